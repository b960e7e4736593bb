//! Transcript capture and assembly.
//!
//! Two capture points feed one shared list: the user side records final
//! transcriptions, the assistant side records text that was actually spoken.
//! Event handlers append system entries (triage decisions, transfers, IVR
//! actions). Before persistence, consecutive same-role entries within a
//! short window merge into one message.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frames::{Frame, FrameDirection};
use crate::pipeline::processor::{Processor, ProcessorContext};

/// Same-role entries closer than this merge during assembly.
const MERGE_WINDOW_SECS: f64 = 3.0;

/// Transcript entry category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Spoken conversation.
    Transcript,
    /// A DTMF keypress during IVR navigation.
    IvrAction,
    /// IVR navigation lifecycle summary.
    IvrSummary,
    /// Triage decision.
    Triage,
    /// Transfer lifecycle.
    Transfer,
    /// Other orchestrator events.
    SystemEvent,
}

/// One transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Speaker role: `user`, `assistant` or `system`.
    pub role: String,
    /// Entry text.
    pub content: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Entry category.
    #[serde(rename = "type")]
    pub entry_type: EntryType,
}

impl TranscriptEntry {
    fn stamped(role: &str, content: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            role: role.to_owned(),
            content: content.into(),
            timestamp: Utc::now().to_rfc3339(),
            entry_type,
        }
    }

    /// A spoken user line.
    pub fn user(content: impl Into<String>) -> Self {
        Self::stamped("user", content, EntryType::Transcript)
    }

    /// A spoken assistant line.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::stamped("assistant", content, EntryType::Transcript)
    }

    /// An orchestrator event line.
    pub fn system(content: impl Into<String>, entry_type: EntryType) -> Self {
        Self::stamped("system", content, entry_type)
    }

    /// An assistant-side IVR action ("Pressed 1").
    pub fn ivr_action(content: impl Into<String>) -> Self {
        Self::stamped("assistant", content, EntryType::IvrAction)
    }

    fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Shared append-only transcript list.
pub type SharedTranscript = Arc<Mutex<Vec<TranscriptEntry>>>;

/// Create an empty shared transcript.
pub fn shared_transcript() -> SharedTranscript {
    Arc::new(Mutex::new(Vec::new()))
}

/// Append an entry to a shared transcript.
pub fn append_entry(transcript: &SharedTranscript, entry: TranscriptEntry) {
    if let Ok(mut guard) = transcript.lock() {
        guard.push(entry);
    }
}

/// Factory for the two capture processors around the conversation core.
pub struct TranscriptProcessor {
    transcript: SharedTranscript,
}

impl TranscriptProcessor {
    /// Capture into the given shared list.
    pub fn new(transcript: SharedTranscript) -> Self {
        Self { transcript }
    }

    /// User-side capture, placed after the STT mute filter.
    pub fn user(&self) -> UserTranscriptCapture {
        UserTranscriptCapture {
            transcript: Arc::clone(&self.transcript),
        }
    }

    /// Assistant-side capture, placed after the TTS gate.
    pub fn assistant(&self) -> AssistantTranscriptCapture {
        AssistantTranscriptCapture {
            transcript: Arc::clone(&self.transcript),
        }
    }
}

/// Records final user transcriptions.
pub struct UserTranscriptCapture {
    transcript: SharedTranscript,
}

#[async_trait]
impl Processor for UserTranscriptCapture {
    fn name(&self) -> &'static str {
        "transcript_user"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        if let (Frame::Transcription(t), FrameDirection::Downstream) = (&frame, direction) {
            let text = t.text.trim();
            if !text.is_empty() {
                append_entry(
                    &self.transcript,
                    TranscriptEntry {
                        role: "user".to_owned(),
                        content: text.to_owned(),
                        timestamp: t.timestamp.clone(),
                        entry_type: EntryType::Transcript,
                    },
                );
            }
        }
        ctx.push_frame(frame, direction).await
    }
}

/// Records assistant text that was actually spoken.
///
/// `skip_tts` markers are not recorded here; DTMF keypresses land in the
/// transcript through their own `ivr_action` entries.
pub struct AssistantTranscriptCapture {
    transcript: SharedTranscript,
}

#[async_trait]
impl Processor for AssistantTranscriptCapture {
    fn name(&self) -> &'static str {
        "transcript_assistant"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        if let (Frame::Text(t), FrameDirection::Downstream) = (&frame, direction)
            && !t.skip_tts
        {
            let text = t.text.trim();
            if !text.is_empty() {
                append_entry(&self.transcript, TranscriptEntry::assistant(text));
            }
        }
        ctx.push_frame(frame, direction).await
    }
}

/// Merge consecutive same-role entries whose timestamps fall within the
/// merge window, concatenating content with single spaces.
pub fn assemble_transcript(raw: &[TranscriptEntry]) -> Vec<TranscriptEntry> {
    let mut assembled: Vec<TranscriptEntry> = Vec::new();
    for entry in raw {
        let merge = assembled.last().is_some_and(|last| {
            if last.role != entry.role {
                return false;
            }
            match (last.parsed_timestamp(), entry.parsed_timestamp()) {
                (Some(a), Some(b)) => {
                    (b - a).num_milliseconds() as f64 / 1000.0 < MERGE_WINDOW_SECS
                }
                _ => false,
            }
        });
        if merge {
            if let Some(last) = assembled.last_mut() {
                last.content = format!("{} {}", last.content.trim(), entry.content.trim());
            }
        } else {
            assembled.push(entry.clone());
        }
    }
    assembled
}

/// The persisted transcript payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptData {
    /// Assembled messages.
    pub messages: Vec<TranscriptEntry>,
    /// Assembled message count.
    pub message_count: usize,
    /// Raw entry count before assembly.
    pub raw_message_count: usize,
    /// Connected-call duration in seconds, when known.
    pub conversation_duration: Option<f64>,
}

impl TranscriptData {
    /// Assemble a raw transcript into its persisted form.
    pub fn assemble(raw: &[TranscriptEntry], conversation_duration: Option<f64>) -> Self {
        let messages = assemble_transcript(raw);
        Self {
            message_count: messages.len(),
            raw_message_count: raw.len(),
            messages,
            conversation_duration,
        }
    }
}
