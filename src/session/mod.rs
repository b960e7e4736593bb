//! The per-call session orchestrator.
//!
//! Builds the pipeline in the canonical order, wires event handlers for the
//! call type, runs to completion and guarantees idempotent cleanup on every
//! termination path: transcript persistence (latched), usage metrics, task
//! cancellation and vendor recording deletion.

pub mod dialout;
pub mod events;
pub mod transcript;
pub mod usage;

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

use crate::config::{CallType, ServicesConfig};
use crate::context::{ContextAggregatorPair, ContextMessage, shared_context};
use crate::error::{CallError, Result};
use crate::flow::{CallFlow, FlowCore, FlowManager, LlmTurnProcessor, NodeConfig, load_flow};
use crate::frames::{Frame, VadParams};
use crate::ivr::{IvrHandle, IvrNavigator, IvrStatus};
use crate::pipeline::{FrameQueue, Pipeline, Processor};
use crate::safety::{OutputValidator, build_safety_monitor};
use crate::services::llm::LlmService;
use crate::services::stt::{SttMuteFilter, SttProcessor, SttService};
use crate::services::tts::{TtsProcessor, TtsService};
use crate::session::dialout::DialoutManager;
use crate::session::events::SessionEvent;
use crate::session::transcript::{
    EntryType, SharedTranscript, TranscriptData, TranscriptEntry, TranscriptProcessor,
    append_entry, shared_transcript,
};
use crate::session::usage::UsageObserver;
use crate::store::{CallStatus, PatientStore, SessionStore};
use crate::transport::{Transport, TransportEvent};
use crate::triage::human::{HumanDetectorHandle, IvrHumanDetector};
use crate::triage::{TriageHandle, build_triage};
use crate::util::{estimate_tts_duration, mask_id, mask_phone, normalize_sip_endpoint};

/// Identity and payload of one call.
#[derive(Debug, Clone)]
pub struct CallSessionParams {
    /// Workflow name.
    pub workflow: String,
    /// Session id.
    pub session_id: String,
    /// Patient id; `None` for dial-in until the flow finds one.
    pub patient_id: Option<String>,
    /// Opaque patient/context fields.
    pub call_data: serde_json::Value,
    /// E.164 target (dial-out) or caller id (dial-in).
    pub phone_number: String,
    /// Owning organization id.
    pub organization_id: String,
    /// Organization slug for config loading.
    pub organization_slug: String,
    /// Call direction.
    pub call_type: CallType,
}

/// Pre-built vendor services for one call.
pub struct SessionServices {
    /// Speech recognizer.
    pub stt: Arc<dyn SttService>,
    /// Synthesizer.
    pub tts: Arc<dyn TtsService>,
    /// Active conversation LLM (fallback wrapper already applied).
    pub llm: Arc<dyn LlmService>,
    /// Fast classifier LLM; enables triage.
    pub classifier_llm: Option<Arc<dyn LlmService>>,
    /// Guard LLM for the safety monitor and output validator.
    pub safety_llm: Option<Arc<dyn LlmService>>,
}

/// Orchestrates one voice call session.
pub struct CallSession {
    params: CallSessionParams,
    config: ServicesConfig,
    services: SessionServices,
    transport: Arc<dyn Transport>,
    sessions: Arc<dyn SessionStore>,
    patients: Arc<dyn PatientStore>,

    transcripts: SharedTranscript,
    transfer_in_progress: Arc<AtomicBool>,
    transcript_saved: bool,
    cleanup_done: bool,
    usage: Arc<UsageObserver>,
}

struct Wiring {
    manager: Arc<Mutex<FlowManager>>,
    flow: Arc<dyn CallFlow>,
    core: FlowCore,
    triage: Option<TriageHandle>,
    ivr: Option<IvrHandle>,
    human: Option<HumanDetectorHandle>,
    dialout: Option<DialoutManager>,
}

impl CallSession {
    /// Build a session from its parts.
    pub fn new(
        params: CallSessionParams,
        config: ServicesConfig,
        services: SessionServices,
        transport: Arc<dyn Transport>,
        sessions: Arc<dyn SessionStore>,
        patients: Arc<dyn PatientStore>,
    ) -> Self {
        Self {
            params,
            config,
            services,
            transport,
            sessions,
            patients,
            transcripts: shared_transcript(),
            transfer_in_progress: Arc::new(AtomicBool::new(false)),
            transcript_saved: false,
            cleanup_done: false,
            usage: Arc::new(UsageObserver::new()),
        }
    }

    /// Shared transcript handle, for tests and observers.
    pub fn transcripts(&self) -> SharedTranscript {
        Arc::clone(&self.transcripts)
    }

    /// Usage observer handle.
    pub fn usage(&self) -> Arc<UsageObserver> {
        Arc::clone(&self.usage)
    }

    /// Run the call to completion. Cleanup runs on every exit path.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            workflow = %self.params.workflow,
            call_type = self.params.call_type.as_str(),
            phone = %mask_phone(&self.params.phone_number),
            session = %mask_id(&self.params.session_id),
            "starting call session"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let (queue, queue_rx) = FrameQueue::channel();

        let (pipeline, mut wiring) = self.build(queue.clone())?;
        let mut task = pipeline.start_with_queue(events_tx.clone(), queue, queue_rx);
        let cancel = task.cancellation();

        // Fold transport events into the session bus.
        let mut transport_events = self.transport.events();
        let forward_cancel = cancel.clone();
        let forward_tx = events_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = forward_cancel.cancelled() => break,
                    event = transport_events.recv() => match event {
                        Ok(event) => {
                            if forward_tx.send(SessionEvent::Transport(event)).is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    },
                }
            }
        });

        let _ = self
            .sessions
            .update_session(
                &self.params.session_id,
                serde_json::json!({
                    "status": "running",
                    "workflow": self.params.workflow,
                    "call_type": self.params.call_type.as_str(),
                }),
                &self.params.organization_id,
            )
            .await;

        let mut failed: Option<CallError> = None;
        {
            let mut run_fut = pin!(task.run());
            loop {
                tokio::select! {
                    result = &mut run_fut => {
                        if let Err(e) = result {
                            failed = Some(e);
                        }
                        break;
                    }
                    event = events_rx.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = self.handle_event(event, &mut wiring).await {
                            error!(error = %e, "session event handling failed");
                            failed = Some(e);
                            cancel.cancel();
                        }
                    }
                }
            }
        }

        self.cleanup(&task).await;

        match failed {
            Some(e) => {
                let _ = self
                    .sessions
                    .update_session(
                        &self.params.session_id,
                        serde_json::json!({
                            "status": "failed",
                            "completed_at": chrono::Utc::now().to_rfc3339(),
                            "error": e.to_string(),
                        }),
                        &self.params.organization_id,
                    )
                    .await;
                Err(e)
            }
            None => {
                let _ = self
                    .sessions
                    .update_session(
                        &self.params.session_id,
                        serde_json::json!({
                            "status": "completed",
                            "completed_at": chrono::Utc::now().to_rfc3339(),
                        }),
                        &self.params.organization_id,
                    )
                    .await;
                info!("call completed");
                Ok(())
            }
        }
    }

    /// Assemble the processors in the canonical order.
    fn build(&self, queue: FrameQueue) -> Result<(Pipeline, Wiring)> {
        let core = FlowCore::new(
            self.params.call_data.clone(),
            self.params.session_id.clone(),
            self.params.organization_id.clone(),
            self.config.cold_transfer.clone().unwrap_or_default(),
            Arc::clone(&self.sessions),
            Arc::clone(&self.patients),
            Arc::clone(&self.transport),
        );
        let flow = load_flow(&self.params.workflow, core.clone())?;

        let context = shared_context(Vec::new());
        let aggregators = ContextAggregatorPair::new(Arc::clone(&context));
        let transcript_processor = TranscriptProcessor::new(Arc::clone(&self.transcripts));

        let mut manager = FlowManager::new(
            context,
            queue,
            Arc::clone(&self.services.llm),
            Arc::clone(&self.transfer_in_progress),
        );
        flow.init_state(manager.state_mut());
        if let Some(patient_id) = &self.params.patient_id {
            manager.state_mut().set("patient_id", patient_id.clone());
        }
        let manager = Arc::new(Mutex::new(manager));

        let triage_active = self.config.triage_active() && flow.triage_config().is_some();
        let mut triage_handle = None;
        let mut ivr_handle = None;
        let mut human_handle = None;

        let mut processors: Vec<Box<dyn Processor>> = Vec::new();
        processors.push(self.transport.input());
        processors.push(Box::new(SttProcessor::new(
            Arc::clone(&self.services.stt),
            Arc::clone(&self.usage),
        )));

        if self.config.safety_monitors.enabled
            && let Some(safety_llm) = &self.services.safety_llm
        {
            processors.push(build_safety_monitor(
                Arc::clone(safety_llm),
                Arc::clone(&self.usage),
            ));
        }

        if triage_active {
            let classifier = self
                .services
                .classifier_llm
                .clone()
                .ok_or_else(|| CallError::Config("triage requires classifier_llm".into()))?;
            let triage_config = flow
                .triage_config()
                .ok_or_else(|| CallError::Config("flow provides no triage config".into()))?;

            let (human_detector, human) = IvrHumanDetector::new(Arc::clone(&classifier));
            processors.push(Box::new(human_detector));
            human_handle = Some(human);

            let parts = build_triage(
                classifier,
                &triage_config.classifier_prompt,
                self.config.triage.voicemail_response_delay,
                Arc::clone(&self.usage),
            );
            processors.push(parts.detector);
            triage_handle = Some(parts.handle);

            let (navigator, ivr) = IvrNavigator::new();
            processors.push(Box::new(navigator));
            ivr_handle = Some(ivr);

            processors.push(Box::new(SttMuteFilter::new()));
            processors.push(Box::new(transcript_processor.user()));
            processors.push(Box::new(aggregators.user()));
            processors.push(Box::new(LlmTurnProcessor::new(
                Arc::clone(&self.services.llm),
                Arc::clone(&manager),
                Arc::clone(&self.usage),
            )));
            self.push_validator(&mut processors);
            processors.push(Box::new(TtsProcessor::new(
                Arc::clone(&self.services.tts),
                Arc::clone(&self.usage),
            )));
            processors.push(parts.tts_gate);
        } else {
            processors.push(Box::new(SttMuteFilter::new()));
            processors.push(Box::new(transcript_processor.user()));
            processors.push(Box::new(aggregators.user()));
            processors.push(Box::new(LlmTurnProcessor::new(
                Arc::clone(&self.services.llm),
                Arc::clone(&manager),
                Arc::clone(&self.usage),
            )));
            self.push_validator(&mut processors);
            processors.push(Box::new(TtsProcessor::new(
                Arc::clone(&self.services.tts),
                Arc::clone(&self.usage),
            )));
        }

        processors.push(Box::new(transcript_processor.assistant()));
        processors.push(Box::new(aggregators.assistant()));
        processors.push(self.transport.output());

        let dialout = (self.params.call_type == CallType::DialOut)
            .then(|| DialoutManager::new(Arc::clone(&self.transport), self.params.phone_number.clone()));

        Ok((
            Pipeline::new(processors),
            Wiring {
                manager,
                flow,
                core,
                triage: triage_handle,
                ivr: ivr_handle,
                human: human_handle,
                dialout,
            },
        ))
    }

    fn push_validator(&self, processors: &mut Vec<Box<dyn Processor>>) {
        if self.config.safety_monitors.output_validator.enabled
            && let Some(safety_llm) = &self.services.safety_llm
        {
            processors.push(Box::new(OutputValidator::new(Arc::clone(safety_llm))));
        }
    }

    async fn handle_event(&mut self, event: SessionEvent, wiring: &mut Wiring) -> Result<()> {
        match event {
            SessionEvent::Transport(event) => self.handle_transport(event, wiring).await,
            SessionEvent::ConversationDetected { history } => {
                info!("triage: human answered, initializing greeting");
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::system(
                        "Human answered - starting conversation",
                        EntryType::Triage,
                    ),
                );
                let mut manager = wiring.manager.lock().await;
                manager.queue_frame(Frame::VadParamsUpdate(VadParams::conversation()))?;
                let last_utterance = history
                    .iter()
                    .rev()
                    .find(|m| m.role == crate::context::Role::User)
                    .map(|m| m.content.clone());
                let node = Self::greeting_with_utterance(
                    Arc::clone(&wiring.flow).greeting_node(),
                    last_utterance,
                );
                manager.initialize(node).await
            }
            SessionEvent::IvrDetected { history } => {
                info!("triage: IVR detected, activating navigator");
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::system(
                        "IVR system detected - navigating menus",
                        EntryType::Triage,
                    ),
                );
                let goal = wiring
                    .flow
                    .triage_config()
                    .map(|c| c.ivr_navigation_goal)
                    .unwrap_or_default();
                if let Some(ivr) = &wiring.ivr {
                    ivr.activate(goal, history);
                }
                if let Some(human) = &wiring.human {
                    human.activate();
                }
                Ok(())
            }
            SessionEvent::VoicemailDetected => {
                info!("triage: voicemail, leaving message");
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::system(
                        "Voicemail detected - leaving message",
                        EntryType::Triage,
                    ),
                );
                self.update_patient_status(CallStatus::Voicemail).await;
                let _ = self
                    .sessions
                    .update_session(
                        &self.params.session_id,
                        serde_json::json!({ "call_status": CallStatus::Voicemail.as_str() }),
                        &self.params.organization_id,
                    )
                    .await;
                let message = wiring
                    .flow
                    .triage_config()
                    .map(|c| c.voicemail_message)
                    .unwrap_or_default();
                let mut manager = wiring.manager.lock().await;
                if !message.is_empty() {
                    manager.say(message)?;
                }
                manager.queue_frame(Frame::End)
            }
            SessionEvent::IvrStatusChanged {
                status,
                transcription,
            } => self.handle_ivr_status(status, transcription, wiring).await,
            SessionEvent::DtmfPressed(key) => {
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::ivr_action(format!("Pressed {key}")),
                );
                Ok(())
            }
            SessionEvent::HumanDetected { text } => {
                let still_active = wiring.ivr.as_ref().is_some_and(IvrHandle::is_active);
                if !still_active {
                    info!("IVR already completed, ignoring human-detector signal");
                    return Ok(());
                }
                info!("human detected during IVR, completing navigation");
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::system(
                        "Human detected during IVR (classifier)",
                        EntryType::Triage,
                    ),
                );
                if let Some(ivr) = &wiring.ivr {
                    ivr.deactivate();
                }
                self.handle_ivr_status(IvrStatus::Completed, Some(text), wiring)
                    .await
            }
            SessionEvent::EmergencyDetected => {
                warn!(session = %mask_id(&self.params.session_id), "EMERGENCY detected");
                let message = self.config.safety_monitors.emergency_message.clone();
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::system("Emergency detected", EntryType::SystemEvent),
                );
                {
                    let mut manager = wiring.manager.lock().await;
                    manager.say(message.clone())?;
                }
                if self.config.safety_monitors.auto_transfer {
                    tokio::time::sleep(estimate_tts_duration(&message)).await;
                    self.safety_sip_transfer("Emergency").await;
                }
                Ok(())
            }
            SessionEvent::StaffRequested => {
                info!(session = %mask_id(&self.params.session_id), "staff transfer requested");
                let message = "Transferring you now, please hold.";
                {
                    let mut manager = wiring.manager.lock().await;
                    manager.say(message)?;
                }
                tokio::time::sleep(estimate_tts_duration(message)).await;
                self.safety_sip_transfer(CallStatus::Transferred.as_str())
                    .await;
                Ok(())
            }
            SessionEvent::UnsafeOutput { text } => {
                warn!(
                    preview = %text.chars().take(80).collect::<String>(),
                    "unsafe output intercepted"
                );
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::system("Unsafe output intercepted", EntryType::SystemEvent),
                );
                let mut manager = wiring.manager.lock().await;
                manager.say(self.config.safety_monitors.unsafe_output_message.clone())
            }
        }
    }

    async fn handle_transport(
        &mut self,
        event: TransportEvent,
        wiring: &mut Wiring,
    ) -> Result<()> {
        match event {
            TransportEvent::Joined => {
                if self.params.call_type == CallType::DialOut
                    && let Some(dialout) = wiring.dialout.as_mut()
                {
                    info!("bot joined room, dialing");
                    dialout.attempt().await?;
                }
                Ok(())
            }
            TransportEvent::FirstParticipantJoined { participant_id } => {
                info!(participant = %participant_id, "participant connected");
                self.usage.mark_call_connected();
                let _ = self
                    .transport
                    .capture_participant_transcription(&participant_id)
                    .await;
                if self.params.call_type == CallType::DialIn {
                    let mut manager = wiring.manager.lock().await;
                    let node = Arc::clone(&wiring.flow).initial_node();
                    manager.initialize(node).await?;
                }
                Ok(())
            }
            TransportEvent::DialoutAnswered { .. } => {
                if self.transfer_in_progress.load(Ordering::SeqCst) {
                    info!("transfer completed, staff answered");
                    append_entry(
                        &self.transcripts,
                        TranscriptEntry::system("Call transferred to staff", EntryType::Transfer),
                    );
                    let status = match self.params.call_type {
                        CallType::DialOut => CallStatus::SupervisorDialed,
                        CallType::DialIn => CallStatus::Completed,
                    };
                    self.update_patient_status(status).await;
                    self.save_transcript().await;
                    let manager = wiring.manager.lock().await;
                    return manager.queue_frame(Frame::End);
                }
                if let Some(dialout) = wiring.dialout.as_mut() {
                    dialout.mark_connected();
                }
                self.usage.mark_call_connected();
                self.update_patient_status(CallStatus::InProgress).await;
                info!(phone = %mask_phone(&self.params.phone_number), "call answered");
                if wiring.triage.is_none() {
                    // No triage section: open the conversation directly.
                    let mut manager = wiring.manager.lock().await;
                    let node = Arc::clone(&wiring.flow).greeting_node();
                    manager.initialize(node).await?;
                }
                Ok(())
            }
            TransportEvent::DialoutError { message } => {
                if self.transfer_in_progress.load(Ordering::SeqCst) {
                    // Transfer legs never re-enter dial retry.
                    error!(error = %message, "transfer failed, continuing call");
                    self.transfer_in_progress.store(false, Ordering::SeqCst);
                    append_entry(
                        &self.transcripts,
                        TranscriptEntry::system("Transfer to staff failed", EntryType::Transfer),
                    );
                    let mut manager = wiring.manager.lock().await;
                    let node = wiring
                        .core
                        .transfer_failed_node(Arc::clone(&wiring.flow), manager.state());
                    return manager.initialize(node).await;
                }
                let Some(dialout) = wiring.dialout.as_mut() else {
                    return Ok(());
                };
                if dialout.is_connected() {
                    warn!(error = %message, "dial-out error after connect, ignoring");
                    return Ok(());
                }
                warn!(attempt = dialout.attempts(), error = %message, "dial-out error");
                if dialout.retry().await? {
                    return Ok(());
                }
                error!("all dial-out attempts failed");
                self.update_patient_status(CallStatus::Failed).await;
                Err(CallError::Transport(format!(
                    "dial-out failed after {} attempts: {message}",
                    dialout.attempts()
                )))
            }
            TransportEvent::DialoutStopped => {
                info!("dial-out stopped");
                self.usage.mark_call_ended();
                self.update_patient_status_if_not_terminal(CallStatus::Completed)
                    .await;
                let manager = wiring.manager.lock().await;
                manager.queue_frame(Frame::End)
            }
            TransportEvent::ParticipantLeft { .. } | TransportEvent::ClientDisconnected => {
                info!("remote side left the call");
                self.usage.mark_call_ended();
                self.update_patient_status_if_not_terminal(CallStatus::Completed)
                    .await;
                let manager = wiring.manager.lock().await;
                manager.queue_frame(Frame::End)
            }
            TransportEvent::DialinError { message } => {
                error!(error = %message, "dial-in error");
                self.update_patient_status(CallStatus::Failed).await;
                Err(CallError::Transport(format!("dial-in error: {message}")))
            }
        }
    }

    async fn handle_ivr_status(
        &mut self,
        status: IvrStatus,
        transcription: Option<String>,
        wiring: &mut Wiring,
    ) -> Result<()> {
        match status {
            IvrStatus::Completed => {
                info!("IVR navigation completed, starting conversation");
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::system("IVR navigation completed", EntryType::IvrSummary),
                );
                if let Some(triage) = &wiring.triage {
                    triage.notify_ivr_completed();
                }
                if let Some(human) = &wiring.human {
                    human.deactivate();
                }
                let mut manager = wiring.manager.lock().await;
                manager.queue_frame(Frame::VadParamsUpdate(VadParams::conversation()))?;
                let node = Self::greeting_with_utterance(
                    Arc::clone(&wiring.flow).greeting_node(),
                    transcription,
                );
                manager.initialize(node).await
            }
            IvrStatus::Stuck => {
                error!("IVR navigation stuck, ending call");
                append_entry(
                    &self.transcripts,
                    TranscriptEntry::system("IVR navigation failed", EntryType::IvrSummary),
                );
                self.update_patient_status(CallStatus::Failed).await;
                let manager = wiring.manager.lock().await;
                manager.queue_frame(Frame::End)
            }
            IvrStatus::Detected | IvrStatus::Wait => Ok(()),
        }
    }

    /// Inject the utterance heard at answer time so the greeting turn knows
    /// what was said.
    fn greeting_with_utterance(node: NodeConfig, utterance: Option<String>) -> NodeConfig {
        match utterance {
            Some(text) if !text.trim().is_empty() => {
                info!(utterance = %text.chars().take(50).collect::<String>(), "injecting answer utterance");
                node.task_context(ContextMessage::user(text))
            }
            _ => node,
        }
    }

    async fn safety_sip_transfer(&mut self, status: &str) {
        let staff = normalize_sip_endpoint(
            self.config
                .cold_transfer
                .as_ref()
                .and_then(|c| c.staff_number.as_deref()),
        );
        let Some(endpoint) = staff else {
            warn!("no staff_number configured for transfer");
            return;
        };
        self.transfer_in_progress.store(true, Ordering::SeqCst);
        match self.transport.sip_call_transfer(&endpoint).await {
            Ok(()) => {
                info!(endpoint = %endpoint, "SIP transfer initiated");
                let _ = self
                    .sessions
                    .update_session(
                        &self.params.session_id,
                        serde_json::json!({ "call_status": status }),
                        &self.params.organization_id,
                    )
                    .await;
            }
            Err(e) => {
                error!(error = %e, "SIP transfer failed");
                self.transfer_in_progress.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn update_patient_status(&self, status: CallStatus) {
        let Some(patient_id) = &self.params.patient_id else {
            return;
        };
        if let Err(e) = self
            .patients
            .update_call_status(patient_id, status, &self.params.organization_id)
            .await
        {
            warn!(error = %e, "patient status update failed");
        }
    }

    /// Status update that never downgrades a terminal outcome.
    async fn update_patient_status_if_not_terminal(&self, status: CallStatus) {
        let Some(patient_id) = &self.params.patient_id else {
            return;
        };
        match self
            .patients
            .find_by_id(patient_id, &self.params.organization_id)
            .await
        {
            Ok(Some(patient)) => {
                if patient.call_status.is_some_and(|s| s.is_terminal()) {
                    info!("patient status already terminal, leaving it");
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "patient fetch failed");
                return;
            }
        }
        self.update_patient_status(status).await;
    }

    /// Persist the transcript exactly once.
    async fn save_transcript(&mut self) {
        if self.transcript_saved {
            info!("transcript already saved, skipping duplicate save");
            return;
        }
        let raw = self
            .transcripts
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        if raw.is_empty() {
            info!("no transcript messages to save");
            return;
        }
        let data = TranscriptData::assemble(&raw, self.usage.call_duration_seconds());
        match self
            .sessions
            .save_transcript(&self.params.session_id, &data, &self.params.organization_id)
            .await
        {
            Ok(_) => {
                self.transcript_saved = true;
                info!(messages = data.message_count, "transcript saved");
                if let Some(patient_id) = &self.params.patient_id {
                    let updates = serde_json::json!({
                        "last_call_session_id": self.params.session_id,
                        "last_call_timestamp": chrono::Utc::now().to_rfc3339(),
                    });
                    if let Err(e) = self
                        .patients
                        .update_patient(patient_id, updates, &self.params.organization_id)
                        .await
                    {
                        warn!(error = %e, "patient last-call update failed");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to save transcript"),
        }
    }

    /// Idempotent teardown: transcript, usage, task cancel, recordings.
    async fn cleanup(&mut self, task: &crate::pipeline::PipelineTask) {
        if self.cleanup_done {
            return;
        }
        self.cleanup_done = true;

        self.save_transcript().await;

        let summary = self.usage.usage_summary();
        let _ = self
            .sessions
            .update_session(
                &self.params.session_id,
                serde_json::json!({
                    "usage": summary.usage,
                    "costs": summary.costs,
                    "total_cost_usd": summary.total_cost_usd,
                }),
                &self.params.organization_id,
            )
            .await;

        task.cancel();

        if let Err(e) = self.transport.delete_recordings().await {
            warn!(error = %e, "recording deletion failed");
        }
        info!("session cleanup complete");
    }
}
