//! Frame types moved along the call pipeline.
//!
//! A [`Frame`] is the unit transported between processors. Frames flow
//! downstream by default (toward the transport output); cancellations,
//! interruptions and context updates flow upstream (toward the transport
//! input).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::context::ContextMessage;

/// Direction a frame travels through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// Toward the transport output (audio to the caller).
    Downstream,
    /// Toward the transport input (control, interruptions, context updates).
    Upstream,
}

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique frame identity.
pub fn next_frame_id() -> u64 {
    NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed)
}

/// A chunk of raw audio on the pipeline.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Frame identity.
    pub id: u64,
    /// 16-bit PCM payload.
    pub pcm: Vec<u8>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1 = mono).
    pub channels: u16,
    /// Presentation timestamp relative to call start, if known.
    pub pts: Option<Duration>,
}

impl AudioFrame {
    /// Create a mono audio frame with a fresh identity.
    pub fn mono(pcm: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            id: next_frame_id(),
            pcm,
            sample_rate,
            channels: 1,
            pts: None,
        }
    }
}

/// A final transcription produced by the STT service.
#[derive(Debug, Clone)]
pub struct TranscriptionFrame {
    /// Frame identity.
    pub id: u64,
    /// The transcribed text.
    pub text: String,
    /// Transport participant that spoke, if known.
    pub participant_id: Option<String>,
    /// ISO-8601 timestamp of the transcription.
    pub timestamp: String,
}

impl TranscriptionFrame {
    /// Create a transcription frame stamped with the current time.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: next_frame_id(),
            text: text.into(),
            participant_id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Text travelling toward TTS / the transcript.
#[derive(Debug, Clone)]
pub struct TextFrame {
    /// Frame identity.
    pub id: u64,
    /// The text content.
    pub text: String,
    /// When set, TTS forwards the frame without synthesizing it. Used for
    /// transcript-only content such as `<dtmf>1</dtmf>` markers.
    pub skip_tts: bool,
}

impl TextFrame {
    /// Create a speakable text frame.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: next_frame_id(),
            text: text.into(),
            skip_tts: false,
        }
    }

    /// Create a transcript-only text frame that TTS will not speak.
    pub fn transcript_only(text: impl Into<String>) -> Self {
        Self {
            id: next_frame_id(),
            text: text.into(),
            skip_tts: true,
        }
    }
}

/// Replacement of the LLM context message list.
#[derive(Debug, Clone)]
pub struct ContextUpdate {
    /// The new message list (replaces all prior messages).
    pub messages: Vec<ContextMessage>,
    /// Trigger an LLM turn immediately after applying the update.
    pub run_llm: bool,
}

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone)]
pub struct ToolCallFrame {
    /// Tool (function schema) name.
    pub name: String,
    /// JSON arguments as produced by the model.
    pub arguments: serde_json::Value,
}

/// The outcome of a tool invocation, for observability and transcripts.
#[derive(Debug, Clone)]
pub struct ToolResultFrame {
    /// Tool name this result belongs to.
    pub name: String,
    /// Spoken result message, if the handler produced one.
    pub message: Option<String>,
    /// Name of the node the flow transitioned to, if any.
    pub next_node: Option<String>,
}

/// A single telephone keypad entry for DTMF output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypadEntry {
    /// Digits 0-9.
    Digit(u8),
    /// The `*` key.
    Star,
    /// The `#` key.
    Pound,
}

impl KeypadEntry {
    /// Parse a keypad entry from the content of a `<dtmf>` tag.
    ///
    /// Returns `None` for anything that is not a single keypad symbol.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match value {
            "*" => Some(Self::Star),
            "#" => Some(Self::Pound),
            _ => {
                let mut chars = value.chars();
                let c = chars.next()?;
                if chars.next().is_some() {
                    return None;
                }
                c.to_digit(10).map(|d| Self::Digit(d as u8))
            }
        }
    }

    /// The wire representation of the key.
    pub fn as_str(&self) -> String {
        match self {
            Self::Digit(d) => d.to_string(),
            Self::Star => "*".to_owned(),
            Self::Pound => "#".to_owned(),
        }
    }
}

impl std::fmt::Display for KeypadEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Endpoint-of-turn parameters for the STT/VAD stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadParams {
    /// Seconds of trailing silence that end a user turn.
    pub stop_secs: f64,
}

impl VadParams {
    /// Natural conversation pacing.
    pub fn conversation() -> Self {
        Self { stop_secs: 0.8 }
    }

    /// IVR menus pause mid-prompt; wait longer before closing the turn.
    pub fn ivr() -> Self {
        Self { stop_secs: 2.0 }
    }
}

/// The unit transported along the pipeline.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Raw audio from the transport or synthesized by TTS.
    AudioRaw(AudioFrame),
    /// Final user transcription from STT.
    Transcription(TranscriptionFrame),
    /// Replace the LLM context, optionally triggering a turn.
    LlmContextUpdate(ContextUpdate),
    /// Trigger an LLM turn using the current context.
    LlmRun,
    /// Streamed LLM text delta.
    LlmText(String),
    /// An LLM response started streaming.
    LlmResponseStart,
    /// The LLM response finished (always delivered, even after interruption).
    LlmResponseEnd,
    /// The LLM requested a tool invocation.
    ToolCall(ToolCallFrame),
    /// A tool invocation completed.
    ToolResult(ToolResultFrame),
    /// Speak this text directly, bypassing the LLM.
    TtsSpeak(String),
    /// Text emitted by TTS (spoken) or marked `skip_tts` (transcript only).
    Text(TextFrame),
    /// TTS began producing audio for an utterance.
    TtsStarted,
    /// TTS finished the current utterance.
    TtsStopped,
    /// Send a DTMF tone ahead of any queued audio.
    DtmfUrgent(KeypadEntry),
    /// Update endpoint-of-turn parameters at the STT stage.
    VadParamsUpdate(VadParams),
    /// Cancel in-flight TTS and the current LLM response.
    StartInterruption,
    /// Graceful end request; the pipeline head converts it to [`Frame::End`].
    EndTask,
    /// Terminal frame; every processor forwards it and shuts down.
    End,
}

impl Frame {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioRaw(_) => "audio",
            Self::Transcription(_) => "transcription",
            Self::LlmContextUpdate(_) => "llm_context_update",
            Self::LlmRun => "llm_run",
            Self::LlmText(_) => "llm_text",
            Self::LlmResponseStart => "llm_response_start",
            Self::LlmResponseEnd => "llm_response_end",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::TtsSpeak(_) => "tts_speak",
            Self::Text(_) => "text",
            Self::TtsStarted => "tts_started",
            Self::TtsStopped => "tts_stopped",
            Self::DtmfUrgent(_) => "dtmf_urgent",
            Self::VadParamsUpdate(_) => "vad_params_update",
            Self::StartInterruption => "start_interruption",
            Self::EndTask => "end_task",
            Self::End => "end",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn keypad_entry_parses_digits_and_symbols() {
        assert_eq!(KeypadEntry::parse("1"), Some(KeypadEntry::Digit(1)));
        assert_eq!(KeypadEntry::parse("0"), Some(KeypadEntry::Digit(0)));
        assert_eq!(KeypadEntry::parse("*"), Some(KeypadEntry::Star));
        assert_eq!(KeypadEntry::parse("#"), Some(KeypadEntry::Pound));
        assert_eq!(KeypadEntry::parse(" 9 "), Some(KeypadEntry::Digit(9)));
    }

    #[test]
    fn keypad_entry_rejects_multi_char_and_garbage() {
        assert_eq!(KeypadEntry::parse("12"), None);
        assert_eq!(KeypadEntry::parse("a"), None);
        assert_eq!(KeypadEntry::parse(""), None);
    }

    #[test]
    fn frame_ids_are_unique() {
        let a = TextFrame::new("a");
        let b = TextFrame::new("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn vad_presets_match_operating_points() {
        assert!((VadParams::conversation().stop_secs - 0.8).abs() < f64::EPSILON);
        assert!((VadParams::ivr().stop_secs - 2.0).abs() < f64::EPSILON);
    }
}
