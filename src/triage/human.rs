//! Parallel human detection while the IVR navigator is working.
//!
//! Hold queues and phone trees speak too; only a person who introduces
//! themselves should end navigation. A lightweight classifier watches the
//! transcription stream and, after a CONVERSATION verdict, waits for 300 ms
//! of classifier silence before confirming, so fragmented transcriptions of
//! one greeting collapse into a single detection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::ContextMessage;
use crate::error::Result;
use crate::frames::{Frame, FrameDirection};
use crate::pipeline::processor::{Processor, ProcessorContext, SourceEvent};
use crate::services::llm::{ChatRequest, LlmService};
use crate::session::events::SessionEvent;

/// Give up on a classification after this long and fail open.
const CLASSIFICATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Classifier silence required after a CONVERSATION verdict.
const DEBOUNCE_DELAY: Duration = Duration::from_millis(300);

const CLASSIFIER_PROMPT: &str = "\
Classify this phone call transcription as IVR or human.

IVR (automated system) examples:
- \"Press 1 for...\", \"For X, press Y\"
- \"Please hold\", \"Thank you for holding\", \"Thank you for your patience\"
- \"Your estimated wait time is...\", \"You are next in queue\"
- \"A representative will be with you shortly\"
- \"Transferring your call\", \"Please wait while we connect you\"

CONVERSATION (human) indicators:
- Person introduces themselves: \"This is [Name]\", \"My name is [Name]\", \"[Name] speaking\"
- Asks how to help: \"How can I help you?\", \"How may I assist you?\"
- Mentions their department: \"This is [Name] with [department]\"

CRITICAL: Generic hold messages like \"Thank you for your patience\" or \"A \
representative will be with you shortly\" are IVR, NOT human. Humans identify \
themselves by name.

Output EXACTLY one word: CONVERSATION or IVR";

/// Activation handle held by the orchestrator.
#[derive(Clone)]
pub struct HumanDetectorHandle {
    active: Arc<AtomicBool>,
}

impl HumanDetectorHandle {
    /// Start monitoring transcriptions.
    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
        info!("IVR human detector activated");
    }

    /// Stop monitoring.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether the detector is currently monitoring.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// The pass-through detector processor. Placed before the triage section so
/// it observes every transcription regardless of the main-branch gate.
pub struct IvrHumanDetector {
    llm: Arc<dyn LlmService>,
    active: Arc<AtomicBool>,
    human_detected: bool,
    accumulated: String,
    deadline: Option<Instant>,
}

impl IvrHumanDetector {
    /// Build the detector and its activation handle.
    pub fn new(llm: Arc<dyn LlmService>) -> (Self, HumanDetectorHandle) {
        let active = Arc::new(AtomicBool::new(false));
        let handle = HumanDetectorHandle {
            active: Arc::clone(&active),
        };
        (
            Self {
                llm,
                active,
                human_detected: false,
                accumulated: String::new(),
                deadline: None,
            },
            handle,
        )
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn reset_debounce(&mut self) {
        self.deadline = Some(Instant::now() + DEBOUNCE_DELAY);
        debug!(
            accumulated = %self.accumulated.chars().take(50).collect::<String>(),
            "human-detector debounce reset"
        );
    }

    async fn classify(&mut self, text: &str) {
        let request = ChatRequest {
            messages: vec![
                ContextMessage::system(CLASSIFIER_PROMPT),
                ContextMessage::user(text),
            ],
            tools: Vec::new(),
            temperature: Some(0.0),
            max_tokens: Some(10),
        };
        let verdict =
            match tokio::time::timeout(CLASSIFICATION_TIMEOUT, self.llm.complete(request)).await {
                Ok(Ok(completion)) => completion.text.trim().to_ascii_uppercase(),
                Ok(Err(e)) => {
                    warn!(error = %e, "human-detector classification failed");
                    return;
                }
                Err(_) => {
                    // Fail open: skip this burst.
                    warn!("human-detector classification timed out");
                    return;
                }
            };

        if verdict == "CONVERSATION" {
            info!(text = %text.chars().take(50).collect::<String>(), "human detected during IVR, debouncing");
            self.human_detected = true;
            self.accumulated = text.to_owned();
            self.reset_debounce();
        }
    }
}

#[async_trait]
impl Processor for IvrHumanDetector {
    fn name(&self) -> &'static str {
        "ivr_human_detector"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        ctx.push_frame(frame.clone(), direction).await?;

        if !self.is_active() || direction != FrameDirection::Downstream {
            return Ok(());
        }
        if let Frame::Transcription(t) = &frame {
            let text = t.text.trim().to_owned();
            if text.is_empty() {
                return Ok(());
            }
            if self.human_detected {
                // Any new transcription resets the silence timer.
                self.accumulated.push(' ');
                self.accumulated.push_str(&text);
                self.reset_debounce();
            } else {
                self.classify(&text).await;
            }
        }
        Ok(())
    }

    async fn source_event(&mut self) -> Option<SourceEvent> {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                Some(SourceEvent::DebounceElapsed)
            }
            None => std::future::pending().await,
        }
    }

    async fn on_source_event(&mut self, event: SourceEvent, ctx: &ProcessorContext) -> Result<()> {
        if !matches!(event, SourceEvent::DebounceElapsed) {
            return Ok(());
        }
        self.deadline = None;
        if self.is_active() && self.human_detected {
            let text = std::mem::take(&mut self.accumulated).trim().to_owned();
            info!(text = %text.chars().take(60).collect::<String>(), "human confirmed during IVR");
            self.active.store(false, Ordering::SeqCst);
            self.human_detected = false;
            ctx.emit(SessionEvent::HumanDetected { text });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::frames::TranscriptionFrame;
    use crate::pipeline::Pipeline;
    use crate::services::llm::{ChatCompletion, LlmEvent};
    use tokio::sync::mpsc;

    struct FixedVerdict(&'static str);

    #[async_trait]
    impl LlmService for FixedVerdict {
        fn service_name(&self) -> &str {
            "fixed"
        }

        async fn stream_chat(
            &self,
            _request: ChatRequest,
        ) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
            let (tx, rx) = mpsc::channel(4);
            let text = self.0.to_owned();
            tokio::spawn(async move {
                let _ = tx.send(Ok(LlmEvent::TextDelta(text))).await;
                let _ = tx
                    .send(Ok(LlmEvent::Done {
                        usage: Default::default(),
                    }))
                    .await;
            });
            Ok(rx)
        }

        async fn complete(&self, _request: ChatRequest) -> Result<ChatCompletion> {
            Ok(ChatCompletion {
                text: self.0.to_owned(),
                ..ChatCompletion::default()
            })
        }
    }

    #[tokio::test]
    async fn human_verdict_fires_after_debounce() {
        let (detector, handle) = IvrHumanDetector::new(Arc::new(FixedVerdict("CONVERSATION")));
        handle.activate();
        let pipeline = Pipeline::new(vec![Box::new(detector)]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);

        task.queue_frames(vec![Frame::Transcription(TranscriptionFrame::new(
            "Hi, this is Sarah with member services.",
        ))])
        .unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        task.queue_frames(vec![Frame::End]).unwrap();
        task.run().await.unwrap();

        let mut found = None;
        while let Ok(event) = events_rx.try_recv() {
            if let SessionEvent::HumanDetected { text } = event {
                found = Some(text);
            }
        }
        let text = found.expect("human detected event");
        assert!(text.contains("Sarah"));
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn ivr_verdict_never_fires() {
        let (detector, handle) = IvrHumanDetector::new(Arc::new(FixedVerdict("IVR")));
        handle.activate();
        let pipeline = Pipeline::new(vec![Box::new(detector)]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);

        task.queue_frames(vec![Frame::Transcription(TranscriptionFrame::new(
            "Please continue to hold.",
        ))])
        .unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        task.queue_frames(vec![Frame::End]).unwrap();
        task.run().await.unwrap();

        while let Ok(event) = events_rx.try_recv() {
            assert!(!matches!(event, SessionEvent::HumanDetected { .. }));
        }
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn inactive_detector_ignores_transcription() {
        let (detector, handle) = IvrHumanDetector::new(Arc::new(FixedVerdict("CONVERSATION")));
        let pipeline = Pipeline::new(vec![Box::new(detector)]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);

        task.queue_frames(vec![Frame::Transcription(TranscriptionFrame::new(
            "Hello, this is David.",
        ))])
        .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        task.queue_frames(vec![Frame::End]).unwrap();
        task.run().await.unwrap();

        while let Ok(event) = events_rx.try_recv() {
            assert!(!matches!(event, SessionEvent::HumanDetected { .. }));
        }
        assert!(!handle.is_active());
    }
}
