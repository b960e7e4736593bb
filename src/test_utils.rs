//! Shared test doubles used by unit and integration tests.
//!
//! Scripted service implementations stand in for the external vendors so
//! call scenarios run hermetically: the LLM pops canned responses, STT maps
//! fixed audio to fixed text, TTS returns silence, and the transport records
//! call-control operations and lets tests inject lifecycle events.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::error::{CallError, Result};
use crate::frames::{AudioFrame, KeypadEntry};
use crate::pipeline::processor::Processor;
use crate::services::llm::{ChatRequest, LlmEvent, LlmService, TokenUsage};
use crate::services::stt::{SttEvent, SttService};
use crate::services::tts::TtsService;
use crate::transport::{
    EVENT_CHANNEL_SIZE, Transport, TransportEvent, TransportInput, TransportOutput,
};

/// One canned LLM response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    /// Text streamed as a single delta.
    pub text: String,
    /// Tool calls emitted after the text.
    pub tool_calls: Vec<(String, serde_json::Value)>,
}

impl ScriptedResponse {
    /// A plain text response.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    /// A single tool call with arguments.
    pub fn tool(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![(name.into(), arguments)],
        }
    }
}

/// LLM double that pops one scripted response per request.
pub struct ScriptedLlm {
    name: &'static str,
    responses: std::sync::Mutex<VecDeque<ScriptedResponse>>,
    requests: std::sync::Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    /// Build with a response script. An exhausted script answers with an
    /// empty response.
    pub fn new(name: &'static str, responses: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(Self {
            name,
            responses: std::sync::Mutex::new(responses.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Append another scripted response.
    pub fn push_response(&self, response: ScriptedResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response);
        }
    }

    /// Requests seen so far, for assertions on context content.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    fn service_name(&self) -> &str {
        self.name
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let response = self
            .responses
            .lock()
            .map(|mut r| r.pop_front().unwrap_or_default())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let _ = tx.send(Ok(LlmEvent::Start)).await;
            if !response.text.is_empty() {
                let _ = tx.send(Ok(LlmEvent::TextDelta(response.text))).await;
            }
            for (name, arguments) in response.tool_calls {
                let _ = tx.send(Ok(LlmEvent::ToolCall { name, arguments })).await;
            }
            let _ = tx
                .send(Ok(LlmEvent::Done {
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                    },
                }))
                .await;
        });
        Ok(rx)
    }
}

/// STT double: every audio frame transcribes to the next scripted line.
pub struct ScriptedStt {
    lines: std::sync::Mutex<VecDeque<String>>,
}

impl ScriptedStt {
    /// Build with a transcription script.
    pub fn new(lines: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            lines: std::sync::Mutex::new(lines.into_iter().map(str::to_owned).collect()),
        })
    }
}

#[async_trait]
impl SttService for ScriptedStt {
    fn service_name(&self) -> &str {
        "scripted_stt"
    }

    async fn process_audio(&self, _frame: &AudioFrame) -> Result<Vec<SttEvent>> {
        let line = self.lines.lock().ok().and_then(|mut l| l.pop_front());
        Ok(line
            .map(|text| vec![SttEvent::Final { text }])
            .unwrap_or_default())
    }
}

/// TTS double returning a short burst of silence.
pub struct SilentTts;

#[async_trait]
impl TtsService for SilentTts {
    fn service_name(&self) -> &str {
        "silent_tts"
    }

    async fn synthesize(&self, _text: &str) -> Result<AudioFrame> {
        Ok(AudioFrame::mono(vec![0u8; 960], 24_000))
    }
}

/// Transport double: records operations, lets tests inject events.
pub struct MockTransport {
    events_tx: broadcast::Sender<TransportEvent>,
    audio_in_tx: mpsc::Sender<AudioFrame>,
    audio_in_rx: std::sync::Mutex<Option<mpsc::Receiver<AudioFrame>>>,
    audio_out_tx: mpsc::Sender<AudioFrame>,
    dtmf_tx: mpsc::UnboundedSender<KeypadEntry>,
    dtmf_log: Arc<Mutex<Vec<KeypadEntry>>>,
    dialouts: Mutex<Vec<String>>,
    transfers: Mutex<Vec<String>>,
    fail_transfers: AtomicBool,
    recordings_deleted: AtomicBool,
    captured_participants: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Fresh transport double. Outbound audio is drained and discarded.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (audio_in_tx, audio_in_rx) = mpsc::channel(64);
        let (audio_out_tx, mut audio_out_rx) = mpsc::channel::<AudioFrame>(64);
        tokio::spawn(async move { while audio_out_rx.recv().await.is_some() {} });
        let (dtmf_tx, mut dtmf_rx) = mpsc::unbounded_channel();
        let dtmf_log = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&dtmf_log);
        tokio::spawn(async move {
            while let Some(key) = dtmf_rx.recv().await {
                log.lock().await.push(key);
            }
        });
        Self {
            events_tx,
            audio_in_tx,
            audio_in_rx: std::sync::Mutex::new(Some(audio_in_rx)),
            audio_out_tx,
            dtmf_tx,
            dtmf_log,
            dialouts: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
            fail_transfers: AtomicBool::new(false),
            recordings_deleted: AtomicBool::new(false),
            captured_participants: Mutex::new(Vec::new()),
        }
    }

    /// Inject a lifecycle event as the vendor would.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Feed inbound call audio.
    pub async fn push_audio(&self, frame: AudioFrame) {
        let _ = self.audio_in_tx.send(frame).await;
    }

    /// Make subsequent SIP transfers fail.
    pub fn fail_transfers(&self) {
        self.fail_transfers.store(true, Ordering::SeqCst);
    }

    /// Dial-out attempts so far.
    pub async fn dialout_attempts(&self) -> Vec<String> {
        self.dialouts.lock().await.clone()
    }

    /// SIP transfers attempted so far.
    pub async fn transfer_attempts(&self) -> Vec<String> {
        self.transfers.lock().await.clone()
    }

    /// DTMF tones sent so far.
    pub async fn dtmf_sent(&self) -> Vec<KeypadEntry> {
        self.dtmf_log.lock().await.clone()
    }

    /// Whether recordings were deleted during cleanup.
    pub fn recordings_deleted(&self) -> bool {
        self.recordings_deleted.load(Ordering::SeqCst)
    }

    /// Participants whose transcription was captured.
    pub async fn captured_participants(&self) -> Vec<String> {
        self.captured_participants.lock().await.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn input(&self) -> Box<dyn Processor> {
        let rx = self
            .audio_in_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .unwrap_or_else(|| mpsc::channel(1).1);
        Box::new(TransportInput::new(rx))
    }

    fn output(&self) -> Box<dyn Processor> {
        Box::new(TransportOutput::new(
            self.audio_out_tx.clone(),
            self.dtmf_tx.clone(),
        ))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn start_dialout(&self, phone_number: &str) -> Result<()> {
        self.dialouts.lock().await.push(phone_number.to_owned());
        Ok(())
    }

    async fn sip_call_transfer(&self, to_end_point: &str) -> Result<()> {
        self.transfers.lock().await.push(to_end_point.to_owned());
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(CallError::Transport("transfer rejected".into()));
        }
        Ok(())
    }

    async fn capture_participant_transcription(&self, participant_id: &str) -> Result<()> {
        self.captured_participants
            .lock()
            .await
            .push(participant_id.to_owned());
        Ok(())
    }

    async fn delete_recordings(&self) -> Result<()> {
        self.recordings_deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_dtmf(&self, key: KeypadEntry) -> Result<()> {
        self.dtmf_log.lock().await.push(key);
        Ok(())
    }
}
