//! Per-workflow services configuration.
//!
//! Each workflow ships a `services.toml` describing the transport, STT, TTS
//! and LLM profiles for its calls, plus triage, safety-monitor and
//! cold-transfer settings. String values of the form `${ENV_VAR}` are
//! substituted from the environment before deserialization; a missing
//! variable fails startup, never a live call.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};

/// Direction of the call this workflow handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    /// Patient calls the clinic.
    #[serde(rename = "dial-in")]
    DialIn,
    /// The system calls out (patient outreach, payer calls).
    #[serde(rename = "dial-out")]
    DialOut,
}

impl CallType {
    /// Wire form used in session records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DialIn => "dial-in",
            Self::DialOut => "dial-out",
        }
    }
}

/// Chat-completions provider for an LLM profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI.
    #[default]
    Openai,
    /// Groq (fast classifier profiles).
    Groq,
    /// Anthropic via the OpenAI-compatible endpoint.
    Anthropic,
}

impl LlmProvider {
    /// Provider name for logs and usage attribution.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Groq => "groq",
            Self::Anthropic => "anthropic",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::Openai => "https://api.openai.com/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
        }
    }
}

/// One LLM profile (main, classifier, fallback or safety).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmServiceConfig {
    /// Provider selection.
    pub provider: LlmProvider,
    /// Bearer token.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Base URL override (self-hosted gateways).
    pub base_url: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: Option<u32>,
}

impl Default for LlmServiceConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Openai,
            api_key: String::new(),
            model: String::new(),
            base_url: None,
            temperature: 0.4,
            max_tokens: None,
        }
    }
}

impl LlmServiceConfig {
    /// Resolved API base URL.
    pub fn endpoint(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_owned())
    }
}

/// STT vendor profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttServiceConfig {
    /// Vendor API key.
    pub api_key: String,
    /// Streaming model.
    pub model: String,
    /// End-of-turn confidence threshold, vendor-specific.
    pub eot_threshold: Option<f64>,
    /// Domain terms boosted during recognition.
    pub keyterms: Vec<String>,
}

impl Default for SttServiceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "flux-general-en".to_owned(),
            eot_threshold: None,
            keyterms: Vec::new(),
        }
    }
}

/// TTS vendor profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsServiceConfig {
    /// Vendor API key.
    pub api_key: String,
    /// Voice to synthesize with.
    pub voice_id: String,
    /// Synthesis model.
    pub model: String,
    /// Base URL override.
    pub base_url: Option<String>,
    /// Voice stability knob.
    pub stability: Option<f32>,
    /// Voice similarity knob.
    pub similarity_boost: Option<f32>,
}

/// Room-based telephony transport profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportServiceConfig {
    /// Vendor REST API key.
    pub api_key: String,
    /// Provisioned outbound phone number id.
    pub phone_number_id: Option<String>,
    /// Vendor REST base URL; empty disables REST operations (local mode).
    pub api_base: String,
}

/// The service table of a workflow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSet {
    /// Speech-to-text.
    pub stt: SttServiceConfig,
    /// Main conversation LLM.
    pub llm: LlmServiceConfig,
    /// Text-to-speech.
    pub tts: TtsServiceConfig,
    /// Telephony transport.
    pub transport: TransportServiceConfig,
    /// Fast classifier LLM; presence enables triage.
    #[serde(default)]
    pub classifier_llm: Option<LlmServiceConfig>,
    /// Fallback LLM swapped in on primary failure.
    #[serde(default)]
    pub fallback_llm: Option<LlmServiceConfig>,
}

/// Triage behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageSettings {
    /// Master switch; triage also needs a classifier LLM profile.
    pub enabled: bool,
    /// Seconds to wait after voicemail detection so the beep finishes.
    pub voicemail_response_delay: f64,
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            voicemail_response_delay: 2.0,
        }
    }
}

/// Output validator switch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputValidatorSettings {
    /// Validate every assistant response before it is spoken.
    pub enabled: bool,
}

/// Safety classifier LLM profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLlmSettings {
    /// Bearer token.
    pub api_key: String,
    /// Guard model identifier.
    pub model: String,
}

impl Default for SafetyLlmSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "meta-llama/llama-guard-4-12b".to_owned(),
        }
    }
}

/// Safety monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    /// Enable the input safety classifier branch.
    pub enabled: bool,
    /// Transfer to staff automatically after the emergency message.
    pub auto_transfer: bool,
    /// Spoken when an emergency is detected.
    pub emergency_message: String,
    /// Spoken when the output validator rejects a response.
    pub unsafe_output_message: String,
    /// Output validator switch.
    pub output_validator: OutputValidatorSettings,
    /// Classifier profile shared by the monitor and the validator.
    pub safety_llm: Option<SafetyLlmSettings>,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_transfer: false,
            emergency_message:
                "If this is a medical emergency, please hang up and dial nine one one."
                    .to_owned(),
            unsafe_output_message: "I apologize, let me rephrase that.".to_owned(),
            output_validator: OutputValidatorSettings::default(),
            safety_llm: None,
        }
    }
}

/// SIP endpoints for cold transfers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdTransferConfig {
    /// Front-desk staff.
    pub staff_number: Option<String>,
    /// Billing department.
    pub billing_number: Option<String>,
    /// Medical staff line.
    pub medical_number: Option<String>,
}

/// A workflow's full services configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServicesConfig {
    /// Call direction this workflow handles.
    pub call_type: CallType,
    /// Service table.
    pub services: ServiceSet,
    /// Triage knobs.
    #[serde(default)]
    pub triage: TriageSettings,
    /// Safety monitor knobs.
    #[serde(default)]
    pub safety_monitors: SafetySettings,
    /// Cold-transfer endpoints.
    #[serde(default)]
    pub cold_transfer: Option<ColdTransferConfig>,
}

impl ServicesConfig {
    /// Load `workflows/<org>/<workflow>/services.toml`, substituting
    /// `${ENV_VAR}` placeholders.
    pub fn load(workflows_root: &Path, organization_slug: &str, workflow: &str) -> Result<Self> {
        let path = workflows_root
            .join(organization_slug)
            .join(workflow)
            .join("services.toml");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            CallError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse a services document from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut value: toml::Value = toml::from_str(raw)
            .map_err(|e| CallError::Config(format!("invalid services config: {e}")))?;
        substitute_env(&mut value)?;
        value
            .try_into()
            .map_err(|e| CallError::Config(format!("invalid services config: {e}")))
    }

    /// Whether triage should be assembled for this call.
    pub fn triage_active(&self) -> bool {
        self.call_type == CallType::DialOut
            && self.triage.enabled
            && self.services.classifier_llm.is_some()
    }
}

/// Replace `${ENV_VAR}` string values in-place.
fn substitute_env(value: &mut toml::Value) -> Result<()> {
    match value {
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                substitute_env(v)?;
            }
        }
        toml::Value::Array(items) => {
            for v in items.iter_mut() {
                substitute_env(v)?;
            }
        }
        toml::Value::String(s) => {
            if let Some(name) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
                let resolved = std::env::var(name).map_err(|_| {
                    CallError::Config(format!(
                        "required environment variable '{name}' is not set"
                    ))
                })?;
                *s = resolved;
            }
        }
        _ => {}
    }
    Ok(())
}
