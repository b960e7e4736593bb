//! Shared LLM conversation context and its pipeline aggregators.
//!
//! One [`LlmContext`] per model: the main conversation LLM and the triage
//! classifier each own one. The aggregator pair contributes the `user()` and
//! `assistant()` processors placed around the LLM in the pipeline; both sides
//! mutate the same shared context.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frames::{Frame, FrameDirection};
use crate::pipeline::processor::{Processor, ProcessorContext};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System / instruction message.
    System,
    /// Caller or call-center rep speech.
    User,
    /// Assistant speech.
    Assistant,
}

impl Role {
    /// Wire name used by chat-completion APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in an LLM context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ContextMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered message list shared between aggregators, LLM processor and flow
/// manager.
#[derive(Debug, Default)]
pub struct LlmContext {
    messages: Vec<ContextMessage>,
}

impl LlmContext {
    /// Create a context seeded with the given messages.
    pub fn new(messages: Vec<ContextMessage>) -> Self {
        Self { messages }
    }

    /// Append one message.
    pub fn push(&mut self, message: ContextMessage) {
        self.messages.push(message);
    }

    /// Replace all messages.
    pub fn replace(&mut self, messages: Vec<ContextMessage>) {
        self.messages = messages;
    }

    /// Snapshot the current message list.
    pub fn messages(&self) -> Vec<ContextMessage> {
        self.messages.clone()
    }

    /// Number of messages currently held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the context is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Non-system messages, used as conversation history for triage and
    /// greeting injection.
    pub fn history(&self) -> Vec<ContextMessage> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect()
    }
}

/// Shared handle to a context.
pub type SharedContext = Arc<Mutex<LlmContext>>;

/// Create a shared context seeded with the given messages.
pub fn shared_context(messages: Vec<ContextMessage>) -> SharedContext {
    Arc::new(Mutex::new(LlmContext::new(messages)))
}

/// Factory for the user/assistant aggregator processors around one LLM.
pub struct ContextAggregatorPair {
    context: SharedContext,
}

impl ContextAggregatorPair {
    /// Create a pair over the given shared context.
    pub fn new(context: SharedContext) -> Self {
        Self { context }
    }

    /// Shared context handle.
    pub fn context(&self) -> SharedContext {
        Arc::clone(&self.context)
    }

    /// The processor placed before the LLM: appends user transcriptions and
    /// triggers a turn.
    pub fn user(&self) -> UserContextAggregator {
        UserContextAggregator {
            context: Arc::clone(&self.context),
        }
    }

    /// The processor placed after TTS: folds spoken assistant text back into
    /// the context.
    pub fn assistant(&self) -> AssistantContextAggregator {
        AssistantContextAggregator {
            context: Arc::clone(&self.context),
            response_buffer: None,
        }
    }
}

/// Appends user transcriptions to the context and emits [`Frame::LlmRun`].
pub struct UserContextAggregator {
    context: SharedContext,
}

#[async_trait]
impl Processor for UserContextAggregator {
    fn name(&self) -> &'static str {
        "context_user"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        match (&frame, direction) {
            (Frame::Transcription(t), FrameDirection::Downstream) => {
                let text = t.text.trim().to_owned();
                ctx.push_frame(frame.clone(), direction).await?;
                if !text.is_empty() {
                    if let Ok(mut guard) = self.context.lock() {
                        guard.push(ContextMessage::user(text));
                    }
                    ctx.push_frame(Frame::LlmRun, FrameDirection::Downstream)
                        .await?;
                }
                Ok(())
            }
            (Frame::LlmContextUpdate(update), FrameDirection::Downstream) => {
                let run_llm = update.run_llm;
                if let Ok(mut guard) = self.context.lock() {
                    guard.replace(update.messages.clone());
                }
                if run_llm {
                    ctx.push_frame(Frame::LlmRun, FrameDirection::Downstream)
                        .await?;
                }
                Ok(())
            }
            _ => ctx.push_frame(frame, direction).await,
        }
    }
}

/// Folds spoken assistant text back into the context.
///
/// Between `LlmResponseStart` and `LlmResponseEnd` the spoken text is
/// buffered and appended as one assistant message; text outside a response
/// window (direct `tts_say` speech) is appended immediately.
pub struct AssistantContextAggregator {
    context: SharedContext,
    response_buffer: Option<String>,
}

impl AssistantContextAggregator {
    fn record_assistant_text(&mut self, content: String) {
        if content.is_empty() {
            return;
        }
        match self.response_buffer.as_mut() {
            Some(buffer) => {
                if !buffer.is_empty() {
                    buffer.push(' ');
                }
                buffer.push_str(&content);
            }
            None => {
                if let Ok(mut guard) = self.context.lock() {
                    guard.push(ContextMessage::assistant(content));
                }
            }
        }
    }
}

#[async_trait]
impl Processor for AssistantContextAggregator {
    fn name(&self) -> &'static str {
        "context_assistant"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        match (&frame, direction) {
            (Frame::LlmResponseStart, FrameDirection::Downstream) => {
                self.response_buffer = Some(String::new());
                ctx.push_frame(frame, direction).await
            }
            (Frame::Text(text), FrameDirection::Downstream) => {
                let content = text.text.trim().to_owned();
                self.record_assistant_text(content);
                ctx.push_frame(frame, direction).await
            }
            // Raw deltas reach this side only on classifier branches, where
            // no TTS stage converts them to spoken text frames.
            (Frame::LlmText(delta), FrameDirection::Downstream) => {
                let content = delta.trim().to_owned();
                self.record_assistant_text(content);
                ctx.push_frame(frame, direction).await
            }
            (Frame::LlmResponseEnd, FrameDirection::Downstream) => {
                if let Some(buffer) = self.response_buffer.take()
                    && !buffer.is_empty()
                    && let Ok(mut guard) = self.context.lock()
                {
                    guard.push(ContextMessage::assistant(buffer));
                }
                ctx.push_frame(frame, direction).await
            }
            (Frame::LlmContextUpdate(update), FrameDirection::Upstream) => {
                // IVR activation enters the classifier branch from its tail;
                // the assistant side is the first aggregator on that path.
                let run_llm = update.run_llm;
                if let Ok(mut guard) = self.context.lock() {
                    guard.replace(update.messages.clone());
                }
                if run_llm {
                    ctx.push_frame(Frame::LlmRun, FrameDirection::Upstream)
                        .await?;
                }
                Ok(())
            }
            _ => ctx.push_frame(frame, direction).await,
        }
    }
}
