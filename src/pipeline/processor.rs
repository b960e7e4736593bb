//! The processor contract and its execution context.
//!
//! Each processor runs as one tokio task wired to its neighbors by channels:
//! a bounded downstream link (audio backpressure) and an unbounded upstream
//! link (control traffic never blocks). A processor that does not consume a
//! frame must forward it in the same direction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::ContextMessage;
use crate::error::{CallError, Result};
use crate::frames::{AudioFrame, Frame, FrameDirection};
use crate::session::events::SessionEvent;

/// Bounded capacity of every downstream link.
pub const FRAME_CHANNEL_SIZE: usize = 64;

/// Self-driven input for processors that emit without an incoming frame.
#[derive(Debug)]
pub enum SourceEvent {
    /// The transport produced raw audio.
    Audio(AudioFrame),
    /// Activate IVR navigation with a rendered goal and prior history.
    IvrActivate {
        /// Rendered navigation goal.
        goal: String,
        /// Conversation heard so far.
        history: Vec<ContextMessage>,
    },
    /// Deactivate IVR navigation.
    IvrDeactivate,
    /// A debounce timer elapsed.
    DebounceElapsed,
}

/// Handles a processor needs while running: neighbor links, the session
/// event bus, the shared interruption flag and the task cancellation token.
#[derive(Clone)]
pub struct ProcessorContext {
    name: &'static str,
    downstream: mpsc::Sender<Frame>,
    upstream: mpsc::UnboundedSender<Frame>,
    events: mpsc::UnboundedSender<SessionEvent>,
    interrupt: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ProcessorContext {
    pub(crate) fn new(
        name: &'static str,
        downstream: mpsc::Sender<Frame>,
        upstream: mpsc::UnboundedSender<Frame>,
        events: mpsc::UnboundedSender<SessionEvent>,
        interrupt: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            downstream,
            upstream,
            events,
            interrupt,
            cancel,
        }
    }

    /// Name of the owning processor, for logs.
    pub fn processor_name(&self) -> &'static str {
        self.name
    }

    /// Emit a frame in the given direction.
    pub async fn push_frame(&self, frame: Frame, direction: FrameDirection) -> Result<()> {
        match direction {
            FrameDirection::Downstream => self
                .downstream
                .send(frame)
                .await
                .map_err(|_| CallError::Channel(format!("{}: downstream closed", self.name))),
            FrameDirection::Upstream => self
                .upstream
                .send(frame)
                .map_err(|_| CallError::Channel(format!("{}: upstream closed", self.name))),
        }
    }

    /// Publish an event on the session bus.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Request an interruption: raises the shared flag immediately (so an
    /// in-flight LLM turn stops at the next token) and pushes
    /// [`Frame::StartInterruption`] upstream so the pipeline head re-emits it
    /// downstream to every processor.
    pub async fn start_interruption(&self) -> Result<()> {
        self.interrupt.store(true, Ordering::SeqCst);
        self.push_frame(Frame::StartInterruption, FrameDirection::Upstream)
            .await
    }

    /// Whether an interruption is currently raised.
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Clear the interruption flag. Called by the LLM processor at the start
    /// of each turn.
    pub fn clear_interruption(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }

    /// Shared interruption flag handle.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Cancellation token of the owning pipeline task.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Session event sender, for components that outlive a single `process`
    /// call (spawned validations, branch tasks).
    pub fn event_sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events.clone()
    }

    /// Raw downstream sender; parallel sections wire branch tails here so
    /// branch outputs merge in emission order.
    pub(crate) fn downstream_sender(&self) -> mpsc::Sender<Frame> {
        self.downstream.clone()
    }

    /// Raw upstream sender; parallel sections wire branch heads here.
    pub(crate) fn upstream_sender(&self) -> mpsc::UnboundedSender<Frame> {
        self.upstream.clone()
    }
}

/// A node in the pipeline.
#[async_trait]
pub trait Processor: Send {
    /// Stable name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// One-time hook before the first frame; parallel sections spawn their
    /// branch tasks here.
    async fn setup(&mut self, ctx: &ProcessorContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Handle one frame. Frames not consumed MUST be forwarded in `direction`.
    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()>;

    /// Wait for the next self-driven event (audio source, command channel,
    /// debounce deadline). Processors without one never resolve; returning
    /// `None` stops further polling.
    async fn source_event(&mut self) -> Option<SourceEvent> {
        std::future::pending().await
    }

    /// Handle a self-driven event produced by [`Processor::source_event`].
    async fn on_source_event(&mut self, event: SourceEvent, ctx: &ProcessorContext) -> Result<()> {
        let _ = (event, ctx);
        Ok(())
    }
}

/// A processor that forwards every frame untouched. Used as the main-branch
/// placeholder in parallel sections that only observe traffic.
pub struct PassThrough;

#[async_trait]
impl Processor for PassThrough {
    fn name(&self) -> &'static str {
        "pass_through"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        ctx.push_frame(frame, direction).await
    }
}
