//! Shared rig for call-session scenario tests.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use clarion::config::{CallType, ServicesConfig};
use clarion::context::Role;
use clarion::error::Result;
use clarion::frames::AudioFrame;
use clarion::services::llm::{ChatRequest, LlmEvent, LlmService, TokenUsage};
use clarion::session::{CallSession, CallSessionParams, SessionServices};
use clarion::store::{MemoryStore, PatientRecord};
use clarion::test_utils::{MockTransport, ScriptedLlm, ScriptedResponse, ScriptedStt, SilentTts};

/// Routes each request to a response by inspecting its content, so several
/// classifier consumers can share one service without fighting over a queue.
pub struct RouterLlm {
    #[allow(clippy::type_complexity)]
    route: Box<dyn Fn(&ChatRequest) -> ScriptedResponse + Send + Sync>,
}

impl RouterLlm {
    pub fn new(
        route: impl Fn(&ChatRequest) -> ScriptedResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            route: Box::new(route),
        })
    }
}

#[async_trait]
impl LlmService for RouterLlm {
    fn service_name(&self) -> &str {
        "router"
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
        let response = (self.route)(&request);
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
                        prompt_tokens: 8,
                        completion_tokens: 4,
                    },
                }))
                .await;
        });
        Ok(rx)
    }
}

/// System prompt text of a chat request, concatenated.
pub fn system_text(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Last user message of a chat request.
pub fn last_user_text(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// A services config with triage enabled and a short voicemail delay.
pub fn dialout_config() -> ServicesConfig {
    ServicesConfig::from_toml_str(
        r#"
        call_type = "dial-out"

        [services.stt]
        api_key = "k"

        [services.llm]
        api_key = "k"
        model = "gpt-4o"

        [services.classifier_llm]
        provider = "groq"
        api_key = "k"
        model = "llama-3.3-70b-versatile"

        [services.tts]
        api_key = "k"
        voice_id = "v"
        model = "m"

        [services.transport]
        api_key = "k"

        [triage]
        voicemail_response_delay = 0.1

        [cold_transfer]
        staff_number = "+15550009999"
        "#,
    )
    .expect("config parses")
}

/// A dial-in config without triage; safety monitor optional via `enabled`.
pub fn dialin_config(safety: bool) -> ServicesConfig {
    let safety_block = if safety {
        r#"
        [safety_monitors]
        enabled = true
        auto_transfer = true
        emergency_message = "If this is an emergency, hang up and dial nine one one."

        [safety_monitors.safety_llm]
        api_key = "k"
        "#
    } else {
        ""
    };
    ServicesConfig::from_toml_str(&format!(
        r#"
        call_type = "dial-in"

        [services.stt]
        api_key = "k"

        [services.llm]
        api_key = "k"
        model = "gpt-4o"

        [services.tts]
        api_key = "k"
        voice_id = "v"
        model = "m"

        [services.transport]
        api_key = "k"

        [cold_transfer]
        staff_number = "+15550009999"
        {safety_block}
        "#
    ))
    .expect("config parses")
}

/// Seed David Chen, the returning patient of the scenarios.
pub async fn seed_david(store: &MemoryStore) {
    store
        .insert_patient(PatientRecord {
            patient_id: "p-david".into(),
            organization_id: "org-1".into(),
            first_name: "David".into(),
            last_name: "Chen".into(),
            phone_number: "5551234567".into(),
            date_of_birth: "1958-11-02".into(),
            email: "david@example.com".into(),
            ..PatientRecord::default()
        })
        .await;
}

/// Build a session over mocks.
#[allow(clippy::too_many_arguments)]
pub fn build_session(
    config: ServicesConfig,
    workflow: &str,
    call_type: CallType,
    patient_id: Option<&str>,
    call_data: serde_json::Value,
    phone_number: &str,
    llm: Arc<dyn LlmService>,
    classifier: Option<Arc<dyn LlmService>>,
    safety: Option<Arc<dyn LlmService>>,
    stt_lines: Vec<&str>,
    store: Arc<MemoryStore>,
    transport: Arc<MockTransport>,
) -> CallSession {
    let services = SessionServices {
        stt: ScriptedStt::new(stt_lines),
        tts: Arc::new(SilentTts),
        llm,
        classifier_llm: classifier,
        safety_llm: safety,
    };
    let params = CallSessionParams {
        workflow: workflow.to_owned(),
        session_id: "s-1".into(),
        patient_id: patient_id.map(str::to_owned),
        call_data,
        phone_number: phone_number.to_owned(),
        organization_id: "org-1".into(),
        organization_slug: "demo_clinic_alpha".into(),
        call_type,
    };
    CallSession::new(
        params,
        config,
        services,
        transport.clone(),
        store.clone(),
        store,
    )
}

/// One chunk of fake caller audio.
pub fn audio_chunk() -> AudioFrame {
    AudioFrame::mono(vec![0u8; 3200], 16_000)
}

/// Unused placeholder LLM.
pub fn idle_llm() -> Arc<ScriptedLlm> {
    ScriptedLlm::new("idle", Vec::new())
}

