//! IVR menu navigation over DTMF.
//!
//! The navigator is inactive until triage detects a phone menu. Activation
//! hands the classifier LLM a navigation prompt (goal plus the menu heard so
//! far) through an upstream context update, then parses the streamed output
//! for `<dtmf>N</dtmf>` keypresses and `<ivr>status</ivr>` lifecycle tags.
//! Text outside the tags is spoken.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::ContextMessage;
use crate::error::Result;
use crate::frames::{ContextUpdate, Frame, FrameDirection, KeypadEntry, TextFrame, VadParams};
use crate::pipeline::processor::{Processor, ProcessorContext, SourceEvent};
use crate::session::events::SessionEvent;

/// Navigation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvrStatus {
    /// Triage chose IVR; navigation is starting.
    Detected,
    /// Navigation reached the goal (agent queue, target department).
    Completed,
    /// Navigation cannot progress (looping menu, invalid selections).
    Stuck,
    /// Waiting for more of the menu prompt.
    Wait,
}

impl IvrStatus {
    /// Parse the content of an `<ivr>` tag.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "detected" => Some(Self::Detected),
            "completed" => Some(Self::Completed),
            "stuck" => Some(Self::Stuck),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }

    /// Tag form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Completed => "completed",
            Self::Stuck => "stuck",
            Self::Wait => "wait",
        }
    }
}

const IVR_NAVIGATION_PROMPT: &str = "\
You are navigating an Interactive Voice Response (IVR) phone system.

YOUR NAVIGATION GOAL:
{goal}

NAVIGATION RULES:
1. For menu options (\"Press 1 for...\"), respond: <dtmf>NUMBER</dtmf>
2. For digit sequences, enter each digit separately: <dtmf>1</dtmf><dtmf>2</dtmf>
3. For questions that expect a spoken answer, respond with natural language text
4. If NO menu option is relevant, respond with <ivr>wait</ivr>
5. If the transcription looks cut off, respond with <ivr>wait</ivr>

COMPLETION - Respond with <ivr>completed</ivr> when you hear:
- \"Please hold while I transfer you\", \"Connecting you to\"
- \"You've reached [the target department]\"
- \"An agent will be with you shortly\"

STUCK - Respond with <ivr>stuck</ivr> when:
- The same menu has repeated three or more times
- No option relates to your goal
- \"Invalid selection\", \"Please try again\"

Respond with: <dtmf>N</dtmf>, <ivr>completed</ivr>, <ivr>stuck</ivr>, <ivr>wait</ivr>, or text.";

/// Render the navigation prompt with the flow's goal.
pub fn navigation_prompt(goal: &str) -> String {
    IVR_NAVIGATION_PROMPT.replace("{goal}", goal)
}

/// A completed pattern pair occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Pattern id (`dtmf`, `ivr`).
    pub id: &'static str,
    /// Text between the start and end tags.
    pub content: String,
}

struct PatternPair {
    id: &'static str,
    start: &'static str,
    end: &'static str,
}

/// Streaming aggregator extracting tag pairs from text deltas.
///
/// Text outside complete tags is released as soon as it cannot be the
/// beginning of a tag; partial tags stay buffered until completed or
/// flushed.
pub struct PatternPairAggregator {
    buffer: String,
    patterns: Vec<PatternPair>,
}

impl PatternPairAggregator {
    /// Empty aggregator.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            patterns: Vec::new(),
        }
    }

    /// Register a tag pair.
    pub fn add_pattern(mut self, id: &'static str, start: &'static str, end: &'static str) -> Self {
        self.patterns.push(PatternPair { id, start, end });
        self
    }

    /// Feed a text delta. Returns completed matches and any plain text that
    /// is safe to release.
    pub fn aggregate(&mut self, text: &str) -> (Vec<PatternMatch>, String) {
        self.buffer.push_str(text);
        let mut matches = Vec::new();
        let mut released = String::new();

        loop {
            // Earliest complete or opening tag in the buffer.
            let earliest = self
                .patterns
                .iter()
                .filter_map(|p| self.buffer.find(p.start).map(|pos| (pos, p)))
                .min_by_key(|(pos, _)| *pos);

            let Some((start_pos, pattern)) = earliest else {
                // No tag opening; release all but a possible partial prefix
                // at the tail.
                let keep_from = self.partial_tag_start();
                released.push_str(&self.buffer[..keep_from]);
                self.buffer.drain(..keep_from);
                break;
            };

            released.push_str(&self.buffer[..start_pos]);
            self.buffer.drain(..start_pos);

            let content_start = pattern.start.len();
            match self.buffer[content_start..].find(pattern.end) {
                Some(rel_end) => {
                    let content = self.buffer[content_start..content_start + rel_end].to_owned();
                    matches.push(PatternMatch {
                        id: pattern.id,
                        content,
                    });
                    self.buffer
                        .drain(..content_start + rel_end + pattern.end.len());
                }
                None => break, // Tag not closed yet; wait for more text.
            }
        }

        (matches, released)
    }

    /// Byte offset of a trailing partial tag opening, or the buffer length.
    fn partial_tag_start(&self) -> usize {
        if let Some(angle) = self.buffer.rfind('<') {
            let tail = &self.buffer[angle..];
            if self
                .patterns
                .iter()
                .any(|p| p.start.starts_with(tail) || p.end.starts_with(tail))
            {
                return angle;
            }
        }
        self.buffer.len()
    }

    /// Return any buffered text verbatim and reset.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

impl Default for PatternPairAggregator {
    fn default() -> Self {
        Self::new()
    }
}

enum IvrCommand {
    Activate {
        goal: String,
        history: Vec<ContextMessage>,
    },
    Deactivate,
}

/// Orchestrator-side handle to the navigator.
#[derive(Clone)]
pub struct IvrHandle {
    tx: mpsc::UnboundedSender<IvrCommand>,
    active: Arc<AtomicBool>,
}

impl IvrHandle {
    /// Activate navigation with a rendered goal and the menu heard so far.
    pub fn activate(&self, goal: String, history: Vec<ContextMessage>) {
        self.active.store(true, Ordering::SeqCst);
        let _ = self.tx.send(IvrCommand::Activate { goal, history });
    }

    /// Deactivate navigation (completion, stuck, or human detected).
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.tx.send(IvrCommand::Deactivate);
    }

    /// Whether navigation is running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// The navigation processor. Placed after the triage detector so it sees the
/// classifier branch's output.
pub struct IvrNavigator {
    active: Arc<AtomicBool>,
    aggregator: PatternPairAggregator,
    command_rx: mpsc::UnboundedReceiver<IvrCommand>,
}

impl IvrNavigator {
    /// Build the navigator and its handle.
    pub fn new() -> (Self, IvrHandle) {
        let (tx, command_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(false));
        let handle = IvrHandle {
            tx,
            active: Arc::clone(&active),
        };
        (
            Self {
                active,
                aggregator: PatternPairAggregator::new()
                    .add_pattern("dtmf", "<dtmf>", "</dtmf>")
                    .add_pattern("ivr", "<ivr>", "</ivr>"),
                command_rx,
            },
            handle,
        )
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn handle_match(&mut self, m: PatternMatch, ctx: &ProcessorContext) -> Result<()> {
        match m.id {
            "dtmf" => match KeypadEntry::parse(&m.content) {
                Some(key) => {
                    debug!(key = %key, "IVR keypress");
                    ctx.push_frame(Frame::DtmfUrgent(key), FrameDirection::Downstream)
                        .await?;
                    ctx.push_frame(
                        Frame::Text(TextFrame::transcript_only(format!("<dtmf>{key}</dtmf>"))),
                        FrameDirection::Downstream,
                    )
                    .await?;
                    ctx.emit(SessionEvent::DtmfPressed(key));
                }
                None => warn!(value = %m.content, "invalid DTMF value"),
            },
            "ivr" => {
                let Some(status) = IvrStatus::parse(&m.content) else {
                    warn!(value = %m.content, "unrecognized IVR status");
                    return Ok(());
                };
                ctx.push_frame(
                    Frame::Text(TextFrame::transcript_only(format!(
                        "<ivr>{}</ivr>",
                        status.as_str()
                    ))),
                    FrameDirection::Downstream,
                )
                .await?;
                match status {
                    IvrStatus::Completed | IvrStatus::Stuck => {
                        self.active.store(false, Ordering::SeqCst);
                        info!(status = status.as_str(), "IVR navigation finished");
                        ctx.emit(SessionEvent::IvrStatusChanged {
                            status,
                            transcription: None,
                        });
                    }
                    IvrStatus::Wait => debug!("IVR waiting for more of the menu"),
                    IvrStatus::Detected => {}
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for IvrNavigator {
    fn name(&self) -> &'static str {
        "ivr_navigator"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        if !self.is_active() || direction == FrameDirection::Upstream {
            return ctx.push_frame(frame, direction).await;
        }
        match frame {
            Frame::LlmText(text) => {
                let (matches, released) = self.aggregator.aggregate(&text);
                for m in matches {
                    self.handle_match(m, ctx).await?;
                }
                if !released.is_empty() {
                    ctx.push_frame(Frame::LlmText(released), FrameDirection::Downstream)
                        .await?;
                }
                Ok(())
            }
            Frame::LlmResponseEnd | Frame::EndTask => {
                let remaining = self.aggregator.flush();
                if !remaining.is_empty() {
                    ctx.push_frame(Frame::LlmText(remaining), FrameDirection::Downstream)
                        .await?;
                }
                ctx.push_frame(frame, direction).await
            }
            other => ctx.push_frame(other, direction).await,
        }
    }

    async fn source_event(&mut self) -> Option<SourceEvent> {
        match self.command_rx.recv().await {
            Some(IvrCommand::Activate { goal, history }) => {
                Some(SourceEvent::IvrActivate { goal, history })
            }
            Some(IvrCommand::Deactivate) => Some(SourceEvent::IvrDeactivate),
            None => None,
        }
    }

    async fn on_source_event(&mut self, event: SourceEvent, ctx: &ProcessorContext) -> Result<()> {
        match event {
            SourceEvent::IvrActivate { goal, history } => {
                info!("IVR navigator activated");
                let mut messages = vec![ContextMessage::system(navigation_prompt(&goal))];
                messages.extend(history);
                ctx.push_frame(
                    Frame::LlmContextUpdate(ContextUpdate {
                        messages,
                        run_llm: true,
                    }),
                    FrameDirection::Upstream,
                )
                .await?;
                // Menus pause mid-prompt; hold the turn open longer.
                ctx.push_frame(
                    Frame::VadParamsUpdate(VadParams::ivr()),
                    FrameDirection::Upstream,
                )
                .await
            }
            SourceEvent::IvrDeactivate => {
                self.aggregator.flush();
                info!("IVR navigator deactivated");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn aggregator_extracts_complete_tags() {
        let mut agg = PatternPairAggregator::new()
            .add_pattern("dtmf", "<dtmf>", "</dtmf>")
            .add_pattern("ivr", "<ivr>", "</ivr>");
        let (matches, released) = agg.aggregate("<dtmf>1</dtmf>");
        assert_eq!(
            matches,
            vec![PatternMatch {
                id: "dtmf",
                content: "1".into()
            }]
        );
        assert!(released.is_empty());
    }

    #[test]
    fn aggregator_handles_split_tags() {
        let mut agg = PatternPairAggregator::new().add_pattern("dtmf", "<dtmf>", "</dtmf>");
        let (matches, _) = agg.aggregate("<dt");
        assert!(matches.is_empty());
        let (matches, _) = agg.aggregate("mf>5</dt");
        assert!(matches.is_empty());
        let (matches, _) = agg.aggregate("mf>");
        assert_eq!(matches[0].content, "5");
    }

    #[test]
    fn aggregator_releases_plain_text() {
        let mut agg = PatternPairAggregator::new().add_pattern("ivr", "<ivr>", "</ivr>");
        let (matches, released) = agg.aggregate("I'll connect you now. ");
        assert!(matches.is_empty());
        assert_eq!(released, "I'll connect you now. ");
    }

    #[test]
    fn aggregator_mixes_text_and_tags() {
        let mut agg = PatternPairAggregator::new().add_pattern("dtmf", "<dtmf>", "</dtmf>");
        let (matches, released) = agg.aggregate("Selecting claims. <dtmf>2</dtmf> done");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].content, "2");
        assert_eq!(released, "Selecting claims. ");
        assert_eq!(agg.flush(), " done");
    }

    #[test]
    fn flush_returns_partial_tag_verbatim() {
        let mut agg = PatternPairAggregator::new().add_pattern("dtmf", "<dtmf>", "</dtmf>");
        let (_, released) = agg.aggregate("text <dtmf>9");
        assert_eq!(released, "text ");
        assert_eq!(agg.flush(), "<dtmf>9");
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!(IvrStatus::parse("COMPLETED"), Some(IvrStatus::Completed));
        assert_eq!(IvrStatus::parse(" stuck "), Some(IvrStatus::Stuck));
        assert_eq!(IvrStatus::parse("wait"), Some(IvrStatus::Wait));
        assert_eq!(IvrStatus::parse("banana"), None);
    }

    #[test]
    fn navigation_prompt_interpolates_goal() {
        let prompt = navigation_prompt("Reach the eligibility department");
        assert!(prompt.contains("Reach the eligibility department"));
        assert!(!prompt.contains("{goal}"));
    }
}
