//! Three-way call triage: who (or what) answered the dial-out.
//!
//! A parallel section placed right after STT. The main branch gates the
//! conversation pipeline shut until a decision lands; the classifier branch
//! runs a fast LLM over accumulated transcription and latches the first
//! verdict. After an IVR verdict the same classifier LLM keeps running as
//! the navigation brain: the IVR navigator replaces the classifier context
//! through an upstream update and the branch stays open until navigation
//! completes.

pub mod human;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::{ContextAggregatorPair, ContextMessage, SharedContext, shared_context};
use crate::error::Result;
use crate::frames::{Frame, FrameDirection};
use crate::pipeline::notifier::Notifier;
use crate::pipeline::parallel::ParallelPipeline;
use crate::pipeline::processor::{Processor, ProcessorContext};
use crate::services::llm::{ChatRequest, LlmService};
use crate::session::events::SessionEvent;
use crate::session::usage::UsageObserver;

/// Classification outcome. Monotonic: once non-pending it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageDecision {
    /// No verdict yet.
    Pending,
    /// A live human answered.
    Conversation,
    /// An automated phone menu answered.
    Ivr,
    /// Voicemail answered.
    Voicemail,
}

/// Shared handles into a running triage section.
#[derive(Clone)]
pub struct TriageHandle {
    decision_rx: watch::Receiver<TriageDecision>,
    gate_notifier: Notifier,
    conversation_notifier: Notifier,
    ivr_notifier: Notifier,
    voicemail_notifier: Notifier,
    ivr_completed_notifier: Notifier,
}

impl TriageHandle {
    /// The latched decision.
    pub fn decision(&self) -> TriageDecision {
        *self.decision_rx.borrow()
    }

    /// Signal that IVR navigation completed: opens the main gate and stops
    /// the classifier branch.
    pub fn notify_ivr_completed(&self) {
        info!("IVR navigation complete, opening main branch");
        self.ivr_completed_notifier.notify();
        self.gate_notifier.notify();
    }
}

/// The assembled triage section: the detector goes after STT, the TTS gate
/// after TTS.
pub struct TriageParts {
    /// Parallel detector section.
    pub detector: Box<dyn Processor>,
    /// Output gate placed after TTS.
    pub tts_gate: Box<dyn Processor>,
    /// Orchestrator-side handle.
    pub handle: TriageHandle,
}

/// Build the triage section.
pub fn build_triage(
    classifier_llm: Arc<dyn LlmService>,
    classifier_prompt: &str,
    voicemail_response_delay: f64,
    usage: Arc<UsageObserver>,
) -> TriageParts {
    let context = shared_context(vec![ContextMessage::system(classifier_prompt)]);
    let aggregators = ContextAggregatorPair::new(Arc::clone(&context));

    let (decision_tx, decision_rx) = watch::channel(TriageDecision::Pending);
    let gate_notifier = Notifier::new();
    let conversation_notifier = Notifier::new();
    let ivr_notifier = Notifier::new();
    let voicemail_notifier = Notifier::new();
    let ivr_completed_notifier = Notifier::new();

    let handle = TriageHandle {
        decision_rx: decision_rx.clone(),
        gate_notifier: gate_notifier.clone(),
        conversation_notifier: conversation_notifier.clone(),
        ivr_notifier: ivr_notifier.clone(),
        voicemail_notifier: voicemail_notifier.clone(),
        ivr_completed_notifier: ivr_completed_notifier.clone(),
    };

    let main_branch: Vec<Box<dyn Processor>> = vec![Box::new(MainBranchGate {
        conversation_notifier: conversation_notifier.clone(),
        ivr_completed_notifier: ivr_completed_notifier.clone(),
    })];

    let classifier_branch: Vec<Box<dyn Processor>> = vec![
        Box::new(ClassifierGate {
            gate_notifier: gate_notifier.clone(),
        }),
        Box::new(aggregators.user()),
        Box::new(ClassifierLlmProcessor::new(
            classifier_llm,
            Arc::clone(&context),
            usage,
        )),
        Box::new(TriageProcessor {
            context,
            decision_tx,
            gate_notifier: gate_notifier.clone(),
            conversation_notifier,
            ivr_notifier,
            voicemail_notifier,
            voicemail_response_delay,
            response_buffer: None,
        }),
        Box::new(aggregators.assistant()),
        Box::new(ClassifierUpstreamGate { gate_notifier }),
    ];

    let detector = ParallelPipeline::new("triage", vec![main_branch, classifier_branch])
        // Upstream travel (IVR activation, interruptions) rides the
        // classifier branch.
        .with_upstream_branch(1);

    TriageParts {
        detector: Box::new(detector),
        tts_gate: Box::new(TtsGate { decision_rx }),
        handle,
    }
}

/// Blocks the main conversation branch until triage decides.
///
/// User speech frames are dropped while closed; the classifier context is
/// the single carrier of pre-decision utterances, so replaying them here
/// would double-feed the main context. Control frames always pass.
struct MainBranchGate {
    conversation_notifier: Notifier,
    ivr_completed_notifier: Notifier,
}

impl MainBranchGate {
    fn open(&self) -> bool {
        self.conversation_notifier.is_notified() || self.ivr_completed_notifier.is_notified()
    }
}

#[async_trait]
impl Processor for MainBranchGate {
    fn name(&self) -> &'static str {
        "main_branch_gate"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        if direction == FrameDirection::Downstream
            && matches!(frame, Frame::Transcription(_) | Frame::AudioRaw(_))
            && !self.open()
        {
            debug!(kind = frame.kind(), "main branch gated, dropping frame");
            return Ok(());
        }
        ctx.push_frame(frame, direction).await
    }
}

/// Head of the classifier branch.
///
/// Downstream, only user transcription (while the branch is live) and the
/// terminal frame enter; everything else already traverses the main branch,
/// and admitting it here would leave the section twice. Upstream frames exit
/// the branch unconditionally.
struct ClassifierGate {
    gate_notifier: Notifier,
}

#[async_trait]
impl Processor for ClassifierGate {
    fn name(&self) -> &'static str {
        "classifier_gate"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        if direction == FrameDirection::Upstream {
            return ctx.push_frame(frame, direction).await;
        }
        match &frame {
            Frame::Transcription(_) if !self.gate_notifier.is_notified() => {
                ctx.push_frame(frame, direction).await
            }
            Frame::End => ctx.push_frame(frame, direction).await,
            _ => Ok(()),
        }
    }
}

/// Tail of the classifier branch.
///
/// Upstream, it blocks further classifier activity once the branch is
/// stopped. Downstream, only the classifier's own output leaves the branch
/// (the IVR navigator consumes it); branch-internal traffic such as the
/// duplicated transcription stream ends here, so nothing the main branch
/// gates can sneak out the side.
struct ClassifierUpstreamGate {
    gate_notifier: Notifier,
}

#[async_trait]
impl Processor for ClassifierUpstreamGate {
    fn name(&self) -> &'static str {
        "classifier_upstream_gate"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        match direction {
            FrameDirection::Upstream => {
                if matches!(frame, Frame::LlmContextUpdate(_) | Frame::LlmRun)
                    && self.gate_notifier.is_notified()
                {
                    debug!("classifier stopped, dropping upstream activation");
                    return Ok(());
                }
                ctx.push_frame(frame, direction).await
            }
            FrameDirection::Downstream => match frame {
                Frame::LlmResponseStart
                | Frame::LlmText(_)
                | Frame::LlmResponseEnd
                | Frame::End => ctx.push_frame(frame, direction).await,
                _ => Ok(()),
            },
        }
    }
}

/// Runs the fast classifier LLM on demand.
///
/// Triggered by [`Frame::LlmRun`] in either direction: downstream runs come
/// from the user-side aggregator on new transcription, upstream runs from an
/// IVR context activation entering the branch tail.
pub(crate) struct ClassifierLlmProcessor {
    llm: Arc<dyn LlmService>,
    context: SharedContext,
    usage: Arc<UsageObserver>,
}

impl ClassifierLlmProcessor {
    pub(crate) fn new(
        llm: Arc<dyn LlmService>,
        context: SharedContext,
        usage: Arc<UsageObserver>,
    ) -> Self {
        Self {
            llm,
            context,
            usage,
        }
    }

    async fn run(&mut self, ctx: &ProcessorContext) -> Result<()> {
        let messages = self
            .context
            .lock()
            .map(|c| c.messages())
            .unwrap_or_default();
        if messages.len() <= 1 {
            return Ok(());
        }

        ctx.push_frame(Frame::LlmResponseStart, FrameDirection::Downstream)
            .await?;
        match self.llm.complete(ChatRequest::text(messages)).await {
            Ok(completion) => {
                self.usage
                    .record_llm_usage(self.llm.service_name(), completion.usage);
                if !completion.text.is_empty() {
                    ctx.push_frame(
                        Frame::LlmText(completion.text),
                        FrameDirection::Downstream,
                    )
                    .await?;
                }
            }
            Err(e) => {
                // Fail open: an unclassified burst just leaves the gate
                // closed until the next one.
                warn!(error = %e, "classifier LLM failed");
            }
        }
        ctx.push_frame(Frame::LlmResponseEnd, FrameDirection::Downstream)
            .await
    }
}

#[async_trait]
impl Processor for ClassifierLlmProcessor {
    fn name(&self) -> &'static str {
        "classifier_llm"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        match frame {
            Frame::LlmRun => self.run(ctx).await,
            other => ctx.push_frame(other, direction).await,
        }
    }
}

/// Maps classifier verdicts to the latched [`TriageDecision`], notifies the
/// gates and emits the decision events.
struct TriageProcessor {
    context: SharedContext,
    decision_tx: watch::Sender<TriageDecision>,
    gate_notifier: Notifier,
    conversation_notifier: Notifier,
    ivr_notifier: Notifier,
    voicemail_notifier: Notifier,
    voicemail_response_delay: f64,
    response_buffer: Option<String>,
}

impl TriageProcessor {
    fn decision(&self) -> TriageDecision {
        *self.decision_tx.borrow()
    }

    fn history(&self) -> Vec<ContextMessage> {
        self.context.lock().map(|c| c.history()).unwrap_or_default()
    }

    fn classify(&mut self, verdict: &str, ctx: &ProcessorContext) {
        match verdict {
            "CONVERSATION" => {
                info!("triage: human answered, starting conversation");
                self.decision_tx.send_replace(TriageDecision::Conversation);
                ctx.emit(SessionEvent::ConversationDetected {
                    history: self.history(),
                });
                self.conversation_notifier.notify();
                self.gate_notifier.notify();
            }
            "IVR" => {
                info!("triage: IVR detected, navigation begins");
                self.decision_tx.send_replace(TriageDecision::Ivr);
                ctx.emit(SessionEvent::IvrDetected {
                    history: self.history(),
                });
                // The classifier branch stays open: it is now the
                // navigation brain.
                self.ivr_notifier.notify();
            }
            "VOICEMAIL" => {
                info!(
                    delay_secs = self.voicemail_response_delay,
                    "triage: voicemail detected"
                );
                self.decision_tx.send_replace(TriageDecision::Voicemail);
                self.gate_notifier.notify();
                let events = ctx.event_sender();
                let voicemail_notifier = self.voicemail_notifier.clone();
                let delay = std::time::Duration::from_secs_f64(self.voicemail_response_delay);
                // Let the greeting/beep finish before anyone speaks.
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    voicemail_notifier.notify();
                    let _ = events.send(SessionEvent::VoicemailDetected);
                });
            }
            other => {
                warn!(verdict = other, "unexpected triage verdict");
            }
        }
    }
}

#[async_trait]
impl Processor for TriageProcessor {
    fn name(&self) -> &'static str {
        "triage_processor"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        if direction == FrameDirection::Upstream || self.decision() != TriageDecision::Pending {
            // Latched: classifier output (IVR navigation tags) flows through.
            return ctx.push_frame(frame, direction).await;
        }
        match frame {
            Frame::LlmResponseStart => {
                self.response_buffer = Some(String::new());
                Ok(())
            }
            Frame::LlmText(text) => {
                if let Some(buffer) = self.response_buffer.as_mut() {
                    buffer.push_str(&text);
                }
                Ok(())
            }
            Frame::LlmResponseEnd => {
                if let Some(buffer) = self.response_buffer.take() {
                    let verdict = buffer.trim().to_ascii_uppercase();
                    if !verdict.is_empty() {
                        self.classify(&verdict, ctx);
                    }
                }
                Ok(())
            }
            other => ctx.push_frame(other, direction).await,
        }
    }
}

/// Placed after TTS on the main chain: holds bot output until a decision.
struct TtsGate {
    decision_rx: watch::Receiver<TriageDecision>,
}

#[async_trait]
impl Processor for TtsGate {
    fn name(&self) -> &'static str {
        "tts_gate"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        if direction == FrameDirection::Downstream
            && *self.decision_rx.borrow() == TriageDecision::Pending
            && matches!(
                frame,
                Frame::AudioRaw(_) | Frame::Text(_) | Frame::TtsStarted | Frame::TtsStopped
            )
        {
            debug!(kind = frame.kind(), "TTS gated before triage decision");
            return Ok(());
        }
        ctx.push_frame(frame, direction).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::frames::TranscriptionFrame;
    use crate::pipeline::Pipeline;
    use crate::services::llm::{ChatCompletion, LlmEvent};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Classifier that answers with a fixed sequence of verdicts.
    struct VerdictLlm {
        verdicts: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl LlmService for VerdictLlm {
        fn service_name(&self) -> &str {
            "verdict"
        }

        async fn stream_chat(
            &self,
            _request: ChatRequest,
        ) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
            let verdict = self
                .verdicts
                .lock()
                .unwrap()
                .first()
                .copied()
                .unwrap_or("CONVERSATION");
            if self.verdicts.lock().unwrap().len() > 1 {
                self.verdicts.lock().unwrap().remove(0);
            }
            let (tx, rx) = mpsc::channel(8);
            let verdict = verdict.to_owned();
            tokio::spawn(async move {
                let _ = tx.send(Ok(LlmEvent::Start)).await;
                let _ = tx.send(Ok(LlmEvent::TextDelta(verdict))).await;
                let _ = tx
                    .send(Ok(LlmEvent::Done {
                        usage: Default::default(),
                    }))
                    .await;
            });
            Ok(rx)
        }

        async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion> {
            let mut rx = self.stream_chat(request).await?;
            let mut completion = ChatCompletion::default();
            while let Some(event) = rx.recv().await {
                if let LlmEvent::TextDelta(t) = event? {
                    completion.text.push_str(&t);
                }
            }
            Ok(completion)
        }
    }

    struct Collector {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor for Collector {
        fn name(&self) -> &'static str {
            "collector"
        }

        async fn process(
            &mut self,
            frame: Frame,
            direction: FrameDirection,
            ctx: &ProcessorContext,
        ) -> Result<()> {
            if let Frame::Transcription(t) = &frame {
                self.seen.lock().unwrap().push(t.text.clone());
            }
            ctx.push_frame(frame, direction).await
        }
    }

    async fn drive(
        verdicts: Vec<&'static str>,
        utterances: Vec<&str>,
    ) -> (
        TriageHandle,
        Vec<SessionEvent>,
        Arc<Mutex<Vec<String>>>,
    ) {
        let llm = Arc::new(VerdictLlm {
            verdicts: Mutex::new(verdicts),
        });
        let parts = build_triage(
            llm,
            "Classify the call opening.",
            0.05,
            Arc::new(UsageObserver::new()),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            parts.detector,
            Box::new(Collector {
                seen: Arc::clone(&seen),
            }),
        ]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);
        for text in utterances {
            task.queue_frames(vec![Frame::Transcription(TranscriptionFrame::new(text))])
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        task.queue_frames(vec![Frame::End]).unwrap();
        task.run().await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            events.push(event);
        }
        (parts.handle, events, seen)
    }

    #[tokio::test]
    async fn conversation_verdict_latches_and_emits() {
        let (handle, events, _seen) = drive(vec!["CONVERSATION"], vec!["Hello, this is David."])
            .await;
        assert_eq!(handle.decision(), TriageDecision::Conversation);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::ConversationDetected { history } if !history.is_empty()
        )));
    }

    #[tokio::test]
    async fn no_main_branch_leak_before_decision() {
        // Verdict never fires because the classifier sees an empty first
        // burst only after the gate check; use an IVR verdict and confirm
        // pre-decision frames never cross the main branch.
        let (handle, events, seen) = drive(
            vec!["IVR"],
            vec!["Press 1 for eligibility, press 2 for claims"],
        )
        .await;
        assert_eq!(handle.decision(), TriageDecision::Ivr);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::IvrDetected { .. })));
        // The main branch gate dropped the utterance.
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn voicemail_event_arrives_after_delay() {
        let started = std::time::Instant::now();
        let (handle, events, _seen) = drive(
            vec!["VOICEMAIL"],
            vec!["Please leave a message after the tone"],
        )
        .await;
        assert_eq!(handle.decision(), TriageDecision::Voicemail);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::VoicemailDetected)));
        // Delay is 50 ms in this rig; the drive loop already waits longer,
        // so just confirm the event exists and time moved forward.
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn main_branch_opens_after_ivr_completed() {
        let (handle, _events, seen) = drive(vec!["IVR"], vec!["Press 1 for claims"]).await;
        assert_eq!(handle.decision(), TriageDecision::Ivr);
        assert!(seen.lock().unwrap().is_empty());
        handle.notify_ivr_completed();
        // The gate consults the notifier on the next frame; nothing to
        // assert through a finished pipeline beyond notifier state.
        assert!(handle.ivr_completed_notifier.is_notified());
        assert!(handle.gate_notifier.is_notified());
    }
}
