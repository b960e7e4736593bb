//! Text-to-speech seam and the pipeline synthesis stage.
//!
//! The TTS processor aggregates streamed LLM text into clauses so synthesis
//! starts before the full response lands, speaks [`Frame::TtsSpeak`] requests
//! immediately, honors `skip_tts` markers, and forwards the spoken text for
//! transcript capture.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::TtsServiceConfig;
use crate::error::{CallError, Result};
use crate::frames::{AudioFrame, Frame, FrameDirection, TextFrame};
use crate::pipeline::processor::{Processor, ProcessorContext};
use crate::session::usage::UsageObserver;

/// Minimum buffered characters before splitting on clause punctuation.
const CLAUSE_MIN_LEN: usize = 20;

/// Find a sentence-ending character (`.`, `!`, `?`, `\n`) followed by a
/// space or end of text. Returns its byte index.
fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\n') {
                return Some(i);
            }
        }
    }
    None
}

/// Find a split point for streaming synthesis: sentence boundaries always,
/// clause punctuation once the buffer is long enough. Returns the last byte
/// of the boundary character so `[..=pos]` stays char-safe.
fn find_clause_boundary(text: &str) -> Option<usize> {
    if let Some(pos) = find_sentence_boundary(text) {
        return Some(pos);
    }
    if text.len() < CLAUSE_MIN_LEN {
        return None;
    }
    let mut last_clause = None;
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') {
                last_clause = Some(i + c.len_utf8() - 1);
            }
        }
    }
    last_clause
}

/// The synthesizer seam.
#[async_trait]
pub trait TtsService: Send + Sync {
    /// Stable name for logs.
    fn service_name(&self) -> &str;

    /// Synthesize one utterance into an audio frame.
    async fn synthesize(&self, text: &str) -> Result<AudioFrame>;
}

/// HTTP vendor adapter for synthesis.
pub struct HttpTts {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    voice_id: String,
    model: String,
    stability: Option<f32>,
    similarity_boost: Option<f32>,
}

impl HttpTts {
    /// Build the adapter from a workflow's TTS profile.
    pub fn new(config: &TtsServiceConfig) -> Result<Self> {
        if config.voice_id.trim().is_empty() {
            return Err(CallError::Config("tts config has empty voice_id".into()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.elevenlabs.io/v1".to_owned()),
            api_key: config.api_key.clone(),
            voice_id: config.voice_id.clone(),
            model: config.model.clone(),
            stability: config.stability,
            similarity_boost: config.similarity_boost,
        })
    }
}

#[async_trait]
impl TtsService for HttpTts {
    fn service_name(&self) -> &str {
        "http_tts"
    }

    async fn synthesize(&self, text: &str) -> Result<AudioFrame> {
        let url = format!(
            "{}/text-to-speech/{}",
            self.base_url.trim_end_matches('/'),
            self.voice_id
        );
        let mut body = serde_json::json!({
            "text": text,
            "model_id": self.model,
            "output_format": "pcm_24000",
        });
        if self.stability.is_some() || self.similarity_boost.is_some() {
            body["voice_settings"] = serde_json::json!({
                "stability": self.stability,
                "similarity_boost": self.similarity_boost,
            });
        }

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Tts(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CallError::Tts(format!(
                "HTTP {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let pcm = response
            .bytes()
            .await
            .map_err(|e| CallError::Tts(format!("body read failed: {e}")))?;
        Ok(AudioFrame::mono(pcm.to_vec(), 24_000))
    }
}

/// Pipeline stage: text in, synthesized audio plus spoken text out.
pub struct TtsProcessor {
    service: Arc<dyn TtsService>,
    usage: Arc<UsageObserver>,
    clause_buffer: String,
    utterance_open: bool,
}

impl TtsProcessor {
    /// Wrap a synthesizer.
    pub fn new(service: Arc<dyn TtsService>, usage: Arc<UsageObserver>) -> Self {
        Self {
            service,
            usage,
            clause_buffer: String::new(),
            utterance_open: false,
        }
    }

    async fn open_utterance(&mut self, ctx: &ProcessorContext) -> Result<()> {
        if !self.utterance_open {
            self.utterance_open = true;
            ctx.push_frame(Frame::TtsStarted, FrameDirection::Downstream)
                .await?;
            ctx.push_frame(Frame::TtsStarted, FrameDirection::Upstream)
                .await?;
        }
        Ok(())
    }

    async fn close_utterance(&mut self, ctx: &ProcessorContext) -> Result<()> {
        if self.utterance_open {
            self.utterance_open = false;
            ctx.push_frame(Frame::TtsStopped, FrameDirection::Downstream)
                .await?;
            ctx.push_frame(Frame::TtsStopped, FrameDirection::Upstream)
                .await?;
        }
        Ok(())
    }

    /// Synthesize one clause and emit audio + the spoken text.
    async fn speak(&mut self, text: &str, ctx: &ProcessorContext) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        if ctx.interrupted() {
            debug!(text, "skipping synthesis under interruption");
            return Ok(());
        }
        self.open_utterance(ctx).await?;
        self.usage.record_tts_characters(text.len() as u64);
        match self.service.synthesize(text).await {
            Ok(audio) => {
                ctx.push_frame(Frame::AudioRaw(audio), FrameDirection::Downstream)
                    .await?;
            }
            Err(e) => {
                // The caller hears silence for this clause; the transcript
                // still records what was meant to be said.
                warn!(error = %e, "synthesis failed");
            }
        }
        ctx.push_frame(
            Frame::Text(TextFrame::new(text)),
            FrameDirection::Downstream,
        )
        .await
    }

    async fn drain_clauses(&mut self, ctx: &ProcessorContext) -> Result<()> {
        while let Some(pos) = find_clause_boundary(&self.clause_buffer) {
            let clause = self.clause_buffer[..=pos].to_owned();
            self.clause_buffer = self.clause_buffer[pos + 1..].to_owned();
            self.speak(&clause, ctx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for TtsProcessor {
    fn name(&self) -> &'static str {
        "tts"
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
        match frame {
            Frame::LlmResponseStart => {
                self.clause_buffer.clear();
                ctx.push_frame(Frame::LlmResponseStart, direction).await
            }
            Frame::LlmText(delta) => {
                self.clause_buffer.push_str(&delta);
                self.drain_clauses(ctx).await
            }
            Frame::LlmResponseEnd => {
                let remaining = std::mem::take(&mut self.clause_buffer);
                self.speak(&remaining, ctx).await?;
                self.close_utterance(ctx).await?;
                ctx.push_frame(Frame::LlmResponseEnd, direction).await
            }
            Frame::TtsSpeak(text) => {
                self.speak(&text, ctx).await?;
                self.close_utterance(ctx).await
            }
            Frame::Text(text) if text.skip_tts => {
                ctx.push_frame(Frame::Text(text), direction).await
            }
            Frame::StartInterruption => {
                self.clause_buffer.clear();
                self.close_utterance(ctx).await?;
                ctx.push_frame(Frame::StartInterruption, direction).await
            }
            other => ctx.push_frame(other, direction).await,
        }
    }
}
