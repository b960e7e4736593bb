//! External service seams and the per-workflow service factory.

pub mod fallback;
pub mod llm;
pub mod stt;
pub mod tts;

use std::sync::Arc;

use tracing::info;

use crate::config::{LlmProvider, LlmServiceConfig, ServicesConfig};
use crate::error::Result;
use crate::services::fallback::FallbackLlm;
use crate::services::llm::{HttpLlm, LlmService};
use crate::services::stt::{HttpStt, SttService};
use crate::services::tts::{HttpTts, TtsService};
use crate::session::SessionServices;

/// Builds concrete services from a workflow's configuration.
pub struct ServiceFactory;

impl ServiceFactory {
    /// Conversation LLM.
    pub fn create_llm(config: &LlmServiceConfig) -> Result<Arc<dyn LlmService>> {
        info!(provider = config.provider.as_str(), model = %config.model, "creating LLM service");
        Ok(Arc::new(HttpLlm::new(config)?))
    }

    /// Classifier-profile LLM (deterministic, tiny completions).
    pub fn create_classifier_llm(config: &LlmServiceConfig) -> Result<Arc<dyn LlmService>> {
        info!(provider = config.provider.as_str(), model = %config.model, "creating classifier LLM");
        Ok(Arc::new(HttpLlm::classifier(config)?))
    }

    /// Primary LLM wrapped with a fallback.
    pub fn create_llm_with_fallback(
        primary: &LlmServiceConfig,
        fallback: &LlmServiceConfig,
    ) -> Result<Arc<dyn LlmService>> {
        info!(
            primary = %primary.model,
            fallback = %fallback.model,
            "creating LLM with fallback"
        );
        Ok(Arc::new(FallbackLlm::new(
            Self::create_llm(primary)?,
            Self::create_llm(fallback)?,
        )))
    }

    /// Speech recognizer.
    pub fn create_stt(config: &crate::config::SttServiceConfig) -> Arc<dyn SttService> {
        info!(model = %config.model, "creating STT service");
        Arc::new(HttpStt::new(config))
    }

    /// Synthesizer.
    pub fn create_tts(config: &crate::config::TtsServiceConfig) -> Result<Arc<dyn TtsService>> {
        info!(voice = %config.voice_id, "creating TTS service");
        Ok(Arc::new(HttpTts::new(config)?))
    }

    /// Build the full service set for one call.
    pub fn build(config: &ServicesConfig) -> Result<SessionServices> {
        let llm = match &config.services.fallback_llm {
            Some(fallback) => Self::create_llm_with_fallback(&config.services.llm, fallback)?,
            None => Self::create_llm(&config.services.llm)?,
        };

        let classifier_llm = match &config.services.classifier_llm {
            Some(classifier) => Some(Self::create_classifier_llm(classifier)?),
            None => {
                info!("classifier_llm not configured - triage detection disabled");
                None
            }
        };

        let safety_llm = match (
            config.safety_monitors.enabled || config.safety_monitors.output_validator.enabled,
            &config.safety_monitors.safety_llm,
        ) {
            (true, Some(settings)) => {
                let profile = LlmServiceConfig {
                    provider: LlmProvider::Groq,
                    api_key: settings.api_key.clone(),
                    model: settings.model.clone(),
                    base_url: None,
                    temperature: 0.0,
                    max_tokens: Some(10),
                };
                Some(Self::create_classifier_llm(&profile)?)
            }
            _ => None,
        };

        Ok(SessionServices {
            stt: Self::create_stt(&config.services.stt),
            tts: Self::create_tts(&config.services.tts)?,
            llm,
            classifier_llm,
            safety_llm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        call_type = "dial-out"

        [services.stt]
        api_key = "stt-key"

        [services.llm]
        provider = "openai"
        api_key = "llm-key"
        model = "gpt-4o"

        [services.fallback_llm]
        provider = "groq"
        api_key = "fb-key"
        model = "llama-3.3-70b-versatile"

        [services.classifier_llm]
        provider = "groq"
        api_key = "cl-key"
        model = "llama-3.3-70b-versatile"

        [services.tts]
        api_key = "tts-key"
        voice_id = "voice-1"
        model = "turbo-v2"

        [services.transport]
        api_key = "transport-key"

        [safety_monitors]
        enabled = true

        [safety_monitors.safety_llm]
        api_key = "guard-key"
    "#;

    #[test]
    fn full_config_builds_all_services() {
        let config = ServicesConfig::from_toml_str(CONFIG).expect("config parses");
        let services = ServiceFactory::build(&config).expect("services build");
        assert!(services.classifier_llm.is_some());
        assert!(services.safety_llm.is_some());
    }

    #[test]
    fn missing_voice_id_fails_fast() {
        let broken = CONFIG.replace("voice_id = \"voice-1\"", "voice_id = \"\"");
        let config = ServicesConfig::from_toml_str(&broken).expect("config parses");
        assert!(ServiceFactory::build(&config).is_err());
    }
}
