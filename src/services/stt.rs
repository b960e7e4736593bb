//! Speech-to-text seam and its pipeline adapters.
//!
//! The concrete vendor (a streaming websocket recognizer in production) is
//! out of scope; the pipeline consumes [`SttService`] and tests script it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::frames::{AudioFrame, Frame, FrameDirection, TranscriptionFrame, VadParams};
use crate::pipeline::processor::{Processor, ProcessorContext};
use crate::session::usage::UsageObserver;

/// Output of one audio push.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// An endpointed final transcription.
    Final {
        /// Transcribed text.
        text: String,
    },
}

/// The speech-recognizer seam.
#[async_trait]
pub trait SttService: Send + Sync {
    /// Stable name for logs.
    fn service_name(&self) -> &str;

    /// Feed one audio chunk; returns any transcriptions it completed.
    async fn process_audio(&self, frame: &AudioFrame) -> Result<Vec<SttEvent>>;

    /// Update endpoint-of-turn parameters (conversation vs IVR pacing).
    async fn set_vad_params(&self, params: VadParams) -> Result<()> {
        let _ = params;
        Ok(())
    }
}

/// Minimal HTTP recognizer: posts each audio chunk to the vendor's batch
/// endpoint. Production deployments use the vendor's streaming socket behind
/// the same trait; this adapter keeps local mode honest.
pub struct HttpStt {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    vad: std::sync::Mutex<VadParams>,
}

impl HttpStt {
    /// Build from a workflow's STT profile.
    pub fn new(config: &crate::config::SttServiceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.deepgram.com".to_owned(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            vad: std::sync::Mutex::new(VadParams::conversation()),
        }
    }
}

#[async_trait]
impl SttService for HttpStt {
    fn service_name(&self) -> &str {
        "http_stt"
    }

    async fn process_audio(&self, frame: &AudioFrame) -> Result<Vec<SttEvent>> {
        let url = format!(
            "{}/v1/listen?model={}&sample_rate={}&encoding=linear16",
            self.base_url, self.model, frame.sample_rate
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/raw")
            .body(frame.pcm.clone())
            .send()
            .await
            .map_err(|e| crate::error::CallError::Stt(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(crate::error::CallError::Stt(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| crate::error::CallError::Stt(format!("decode failed: {e}")))?;
        let transcript = body["results"]["channels"][0]["alternatives"][0]["transcript"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_owned();
        Ok(if transcript.is_empty() {
            Vec::new()
        } else {
            vec![SttEvent::Final { text: transcript }]
        })
    }

    async fn set_vad_params(&self, params: VadParams) -> Result<()> {
        if let Ok(mut vad) = self.vad.lock() {
            tracing::debug!(stop_secs = params.stop_secs, "VAD params updated");
            *vad = params;
        }
        Ok(())
    }
}

/// Pipeline adapter: audio in, transcription frames out.
pub struct SttProcessor {
    service: Arc<dyn SttService>,
    usage: Arc<UsageObserver>,
}

impl SttProcessor {
    /// Wrap a recognizer.
    pub fn new(service: Arc<dyn SttService>, usage: Arc<UsageObserver>) -> Self {
        Self { service, usage }
    }
}

#[async_trait]
impl Processor for SttProcessor {
    fn name(&self) -> &'static str {
        "stt"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        match (&frame, direction) {
            (Frame::AudioRaw(audio), FrameDirection::Downstream) => {
                let bytes_per_second = f64::from(audio.sample_rate) * 2.0;
                if bytes_per_second > 0.0 {
                    self.usage
                        .record_stt_audio(audio.pcm.len() as f64 / bytes_per_second);
                }
                for event in self.service.process_audio(audio).await? {
                    let SttEvent::Final { text } = event;
                    if !text.trim().is_empty() {
                        ctx.push_frame(
                            Frame::Transcription(TranscriptionFrame::new(text)),
                            FrameDirection::Downstream,
                        )
                        .await?;
                    }
                }
                Ok(())
            }
            // Arrives downstream when queued by the orchestrator, upstream
            // when pushed by the IVR navigator.
            (Frame::VadParamsUpdate(params), _) => self.service.set_vad_params(*params).await,
            _ => ctx.push_frame(frame, direction).await,
        }
    }
}

/// Drops user transcriptions while the bot's first utterance is in flight,
/// so the greeting is not interrupted by line noise or echo.
pub struct SttMuteFilter {
    first_tts_started: bool,
    first_tts_finished: bool,
}

impl SttMuteFilter {
    /// New filter in its pre-greeting state.
    pub fn new() -> Self {
        Self {
            first_tts_started: false,
            first_tts_finished: false,
        }
    }

    fn muted(&self) -> bool {
        self.first_tts_started && !self.first_tts_finished
    }
}

impl Default for SttMuteFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for SttMuteFilter {
    fn name(&self) -> &'static str {
        "stt_mute"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        match (&frame, direction) {
            (Frame::TtsStarted, FrameDirection::Upstream) => {
                self.first_tts_started = true;
                ctx.push_frame(frame, direction).await
            }
            (Frame::TtsStopped, FrameDirection::Upstream) => {
                if self.first_tts_started {
                    self.first_tts_finished = true;
                }
                ctx.push_frame(frame, direction).await
            }
            (Frame::Transcription(t), FrameDirection::Downstream) if self.muted() => {
                tracing::debug!(text = %t.text, "muted transcription during first utterance");
                Ok(())
            }
            _ => ctx.push_frame(frame, direction).await,
        }
    }
}
