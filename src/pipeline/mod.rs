//! The frame pipeline: ordered processor chains run as tokio tasks.
//!
//! Frames flow downstream through bounded links (backpressure on audio) and
//! upstream through unbounded links (control never blocks). The pipeline head
//! owns the injection queue and the two source-side conversions: an upstream
//! [`Frame::StartInterruption`] is re-emitted downstream to every processor,
//! and an upstream [`Frame::EndTask`] becomes a downstream [`Frame::End`].

pub mod notifier;
pub mod parallel;
pub mod processor;

pub use notifier::Notifier;
pub use parallel::ParallelPipeline;
pub use processor::{FRAME_CHANNEL_SIZE, PassThrough, Processor, ProcessorContext, SourceEvent};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CallError, Result};
use crate::frames::{Frame, FrameDirection};
use crate::session::events::SessionEvent;

/// Channel endpoints a processor chain plugs into.
pub(crate) struct ChainIo {
    /// Frames entering the chain downstream.
    pub head_down_rx: mpsc::Receiver<Frame>,
    /// Where the chain's downstream output goes.
    pub out_down_tx: mpsc::Sender<Frame>,
    /// Frames entering the chain from its downstream side (upstream travel).
    pub tail_up_rx: mpsc::UnboundedReceiver<Frame>,
    /// Where the chain's upstream output exits.
    pub head_up_tx: mpsc::UnboundedSender<Frame>,
}

/// Spawn one task per processor, wired in order. Shared between the
/// top-level pipeline and parallel branches.
pub(crate) fn spawn_chain(
    processors: Vec<Box<dyn Processor>>,
    io: ChainIo,
    events: mpsc::UnboundedSender<SessionEvent>,
    interrupt: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let count = processors.len();
    assert!(count > 0, "a chain needs at least one processor");

    // Internal downstream links between consecutive processors.
    let mut down_txs = Vec::with_capacity(count);
    let mut down_rxs = Vec::with_capacity(count);
    down_rxs.push(io.head_down_rx);
    for _ in 1..count {
        let (tx, rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_SIZE);
        down_txs.push(tx);
        down_rxs.push(rx);
    }
    down_txs.push(io.out_down_tx);

    // Internal upstream links: processor j sends upstream into j-1's mailbox.
    let mut up_txs = Vec::with_capacity(count);
    let mut up_rxs = Vec::with_capacity(count);
    up_txs.push(io.head_up_tx);
    for _ in 1..count {
        let (tx, rx) = mpsc::unbounded_channel::<Frame>();
        up_txs.push(tx);
        up_rxs.push(rx);
    }
    up_rxs.push(io.tail_up_rx);

    let mut handles = Vec::with_capacity(count);
    // Processor j receives upstream frames from processor j+1; the last one
    // receives from the chain's downstream side.
    for (index, ((proc, down_rx), up_rx)) in processors
        .into_iter()
        .zip(down_rxs)
        .zip(up_rxs)
        .enumerate()
    {
        let out_down = down_txs[index].clone();
        let out_up = up_txs[index].clone();
        let ctx = ProcessorContext::new(
            proc.name(),
            out_down,
            out_up,
            events.clone(),
            Arc::clone(&interrupt),
            cancel.clone(),
        );
        handles.push(tokio::spawn(run_processor(proc, down_rx, up_rx, ctx)));
    }
    handles
}

enum Step {
    Down(Frame),
    Up(Frame),
    Source(SourceEvent),
    Stop,
}

async fn run_processor(
    mut proc: Box<dyn Processor>,
    mut down_rx: mpsc::Receiver<Frame>,
    mut up_rx: mpsc::UnboundedReceiver<Frame>,
    ctx: ProcessorContext,
) {
    if let Err(e) = proc.setup(&ctx).await {
        warn!(processor = ctx.processor_name(), error = %e, "processor setup failed");
        return;
    }

    let cancel = ctx.cancellation();
    let mut source_done = false;
    loop {
        let step = tokio::select! {
            () = cancel.cancelled() => Step::Stop,
            frame = down_rx.recv() => match frame {
                Some(frame) => Step::Down(frame),
                None => Step::Stop,
            },
            frame = up_rx.recv() => match frame {
                Some(frame) => Step::Up(frame),
                None => Step::Stop,
            },
            event = proc.source_event(), if !source_done => match event {
                Some(event) => Step::Source(event),
                None => {
                    source_done = true;
                    continue;
                }
            },
        };

        match step {
            Step::Down(frame) => {
                let is_end = matches!(frame, Frame::End);
                if let Err(e) = proc.process(frame, FrameDirection::Downstream, &ctx).await {
                    warn!(processor = ctx.processor_name(), error = %e, "processor error");
                }
                if is_end {
                    break;
                }
            }
            Step::Up(frame) => {
                if let Err(e) = proc.process(frame, FrameDirection::Upstream, &ctx).await {
                    warn!(processor = ctx.processor_name(), error = %e, "processor error");
                }
            }
            Step::Source(event) => {
                if let Err(e) = proc.on_source_event(event, &ctx).await {
                    warn!(processor = ctx.processor_name(), error = %e, "source event error");
                }
            }
            Step::Stop => break,
        }
    }
}

/// An ordered list of processors, ready to start.
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    /// Build a pipeline from processors in downstream order.
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    /// Spawn all processor tasks plus the head and sink stages.
    pub fn start(self, events: mpsc::UnboundedSender<SessionEvent>) -> PipelineTask {
        let (queue, queue_rx) = FrameQueue::channel();
        self.start_with_queue(events, queue, queue_rx)
    }

    /// Spawn with an externally created injection queue, so components built
    /// before the task (the flow manager) can hold the handle.
    pub fn start_with_queue(
        self,
        events: mpsc::UnboundedSender<SessionEvent>,
        queue: FrameQueue,
        queue_rx: mpsc::UnboundedReceiver<Frame>,
    ) -> PipelineTask {
        let cancel = CancellationToken::new();
        let interrupt = Arc::new(AtomicBool::new(false));
        let queue_tx = queue.tx.clone();
        let (head_down_tx, head_down_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_SIZE);
        let (head_up_tx, head_up_rx) = mpsc::unbounded_channel::<Frame>();
        let (sink_tx, sink_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_SIZE);
        // Held by the task so the last processor's upstream mailbox stays open.
        let (tail_up_tx, tail_up_rx) = mpsc::unbounded_channel::<Frame>();
        let (done_tx, done_rx) = watch::channel(false);

        let mut handles = spawn_chain(
            self.processors,
            ChainIo {
                head_down_rx,
                out_down_tx: sink_tx,
                tail_up_rx,
                head_up_tx,
            },
            events,
            Arc::clone(&interrupt),
            cancel.clone(),
        );
        handles.push(tokio::spawn(run_head(
            queue_rx,
            head_down_tx,
            head_up_rx,
            Arc::clone(&interrupt),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(run_sink(sink_rx, done_tx, cancel.clone())));

        PipelineTask {
            queue_tx,
            cancel,
            interrupt,
            done_rx,
            handles,
            _tail_up_tx: tail_up_tx,
        }
    }
}

async fn run_head(
    mut queue_rx: mpsc::UnboundedReceiver<Frame>,
    down_tx: mpsc::Sender<Frame>,
    mut up_rx: mpsc::UnboundedReceiver<Frame>,
    interrupt: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = queue_rx.recv() => {
                let Some(frame) = frame else { break };
                let is_end = matches!(frame, Frame::End);
                if down_tx.send(frame).await.is_err() || is_end {
                    break;
                }
            }
            frame = up_rx.recv() => match frame {
                Some(Frame::StartInterruption) => {
                    interrupt.store(true, Ordering::SeqCst);
                    if down_tx.send(Frame::StartInterruption).await.is_err() {
                        break;
                    }
                }
                Some(Frame::EndTask) => {
                    if down_tx.send(Frame::End).await.is_err() {
                        break;
                    }
                    break;
                }
                Some(other) => {
                    debug!(kind = other.kind(), "upstream frame reached pipeline head");
                }
                None => break,
            },
        }
    }
}

async fn run_sink(
    mut down_rx: mpsc::Receiver<Frame>,
    done_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = down_rx.recv() => match frame {
                Some(Frame::End) | None => break,
                Some(_) => {}
            },
        }
    }
    done_tx.send_replace(true);
}

/// Handle for injecting frames at the pipeline head.
#[derive(Clone)]
pub struct FrameQueue {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameQueue {
    /// Create a queue handle and the receiver the pipeline head will drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue one frame downstream from the head.
    pub fn queue(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| CallError::Channel("pipeline queue closed".into()))
    }

    /// Queue several frames in order.
    pub fn queue_all(&self, frames: Vec<Frame>) -> Result<()> {
        for frame in frames {
            self.queue(frame)?;
        }
        Ok(())
    }
}

/// A running pipeline.
pub struct PipelineTask {
    queue_tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    interrupt: Arc<AtomicBool>,
    done_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
    _tail_up_tx: mpsc::UnboundedSender<Frame>,
}

impl PipelineTask {
    /// Handle for queueing frames at the head.
    pub fn queue_handle(&self) -> FrameQueue {
        FrameQueue {
            tx: self.queue_tx.clone(),
        }
    }

    /// Queue frames at the head.
    pub fn queue_frames(&self, frames: Vec<Frame>) -> Result<()> {
        self.queue_handle().queue_all(frames)
    }

    /// Shared interruption flag.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Run until the sink observes [`Frame::End`] or the task is cancelled,
    /// then shut every processor down.
    pub async fn run(&mut self) -> Result<()> {
        let mut done = self.done_rx.clone();
        tokio::select! {
            () = self.cancel.cancelled() => {}
            result = done.wait_for(|d| *d) => {
                let _ = result;
            }
        }
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Request cooperative shutdown of every processor.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancellation handle usable while `run()` holds the task.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::frames::TextFrame;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records the text frames it sees, forwards everything.
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn process(
            &mut self,
            frame: Frame,
            direction: FrameDirection,
            ctx: &ProcessorContext,
        ) -> Result<()> {
            if let Frame::Text(text) = &frame {
                self.seen.lock().unwrap().push(text.text.clone());
            }
            ctx.push_frame(frame, direction).await
        }
    }

    /// Converts every text frame to uppercase.
    struct Upcase;

    #[async_trait]
    impl Processor for Upcase {
        fn name(&self) -> &'static str {
            "upcase"
        }

        async fn process(
            &mut self,
            frame: Frame,
            direction: FrameDirection,
            ctx: &ProcessorContext,
        ) -> Result<()> {
            let frame = match frame {
                Frame::Text(t) => Frame::Text(TextFrame {
                    text: t.text.to_uppercase(),
                    ..t
                }),
                other => other,
            };
            ctx.push_frame(frame, direction).await
        }
    }

    #[tokio::test]
    async fn frames_traverse_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Box::new(Upcase),
            Box::new(Recorder {
                seen: Arc::clone(&seen),
            }),
        ]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);
        task.queue_frames(vec![
            Frame::Text(TextFrame::new("one")),
            Frame::Text(TextFrame::new("two")),
            Frame::End,
        ])
        .unwrap();
        task.run().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["ONE", "TWO"]);
    }

    #[tokio::test]
    async fn end_task_upstream_terminates_pipeline() {
        struct EndRequester {
            sent: bool,
        }

        #[async_trait]
        impl Processor for EndRequester {
            fn name(&self) -> &'static str {
                "end_requester"
            }

            async fn process(
                &mut self,
                frame: Frame,
                direction: FrameDirection,
                ctx: &ProcessorContext,
            ) -> Result<()> {
                if !self.sent && matches!(frame, Frame::Text(_)) {
                    self.sent = true;
                    ctx.push_frame(Frame::EndTask, FrameDirection::Upstream)
                        .await?;
                }
                ctx.push_frame(frame, direction).await
            }
        }

        let pipeline = Pipeline::new(vec![Box::new(EndRequester { sent: false })]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);
        task.queue_frames(vec![Frame::Text(TextFrame::new("go"))])
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), task.run())
            .await
            .expect("pipeline ends after EndTask")
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_task() {
        let pipeline = Pipeline::new(vec![Box::new(PassThrough)]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);
        task.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), task.run())
            .await
            .expect("cancel resolves run")
            .unwrap();
    }
}
