//! Branching processor: duplicates input to sub-pipelines, merges outputs.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::frames::{Frame, FrameDirection};
use crate::pipeline::processor::{FRAME_CHANNEL_SIZE, Processor, ProcessorContext};
use crate::pipeline::{ChainIo, spawn_chain};

/// A processor composed of two or more inner pipelines running concurrently.
///
/// Every incoming downstream frame is duplicated to each branch head; frames
/// arriving from the downstream side (upstream travel) are duplicated to each
/// branch tail. Branch downstream outputs go straight to the outer downstream
/// link, so the merge preserves each branch's order and interleaves across
/// branches by emission time. Branch upstream outputs exit through the outer
/// upstream link; a branch that should not leak upstream traffic (the triage
/// main-branch gate) absorbs it instead of forwarding.
pub struct ParallelPipeline {
    name: &'static str,
    branches: Option<Vec<Vec<Box<dyn Processor>>>>,
    branch_down_txs: Vec<mpsc::Sender<Frame>>,
    branch_tail_up_txs: Vec<mpsc::UnboundedSender<Frame>>,
    upstream_branch: usize,
}

impl ParallelPipeline {
    /// Build a parallel section from branches in declaration order.
    pub fn new(name: &'static str, branches: Vec<Vec<Box<dyn Processor>>>) -> Self {
        assert!(
            branches.len() >= 2,
            "a parallel pipeline needs at least two branches"
        );
        Self {
            name,
            branches: Some(branches),
            branch_down_txs: Vec::new(),
            branch_tail_up_txs: Vec::new(),
            upstream_branch: 0,
        }
    }

    /// Route upstream travel through the given branch. Exactly one branch
    /// carries upstream frames so they exit the section once, not per
    /// branch.
    pub fn with_upstream_branch(mut self, index: usize) -> Self {
        self.upstream_branch = index;
        self
    }
}

#[async_trait]
impl Processor for ParallelPipeline {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn setup(&mut self, ctx: &ProcessorContext) -> Result<()> {
        let branches = self.branches.take().unwrap_or_default();
        for processors in branches {
            let (down_tx, down_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_SIZE);
            let (tail_up_tx, tail_up_rx) = mpsc::unbounded_channel::<Frame>();
            self.branch_down_txs.push(down_tx);
            self.branch_tail_up_txs.push(tail_up_tx);
            spawn_chain(
                processors,
                ChainIo {
                    head_down_rx: down_rx,
                    out_down_tx: ctx.downstream_sender(),
                    tail_up_rx,
                    head_up_tx: ctx.upstream_sender(),
                },
                ctx.event_sender(),
                ctx.interrupt_flag(),
                ctx.cancellation(),
            );
        }
        Ok(())
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        _ctx: &ProcessorContext,
    ) -> Result<()> {
        match direction {
            FrameDirection::Downstream => {
                for tx in &self.branch_down_txs {
                    let _ = tx.send(frame.clone()).await;
                }
            }
            FrameDirection::Upstream => {
                if let Some(tx) = self.branch_tail_up_txs.get(self.upstream_branch) {
                    let _ = tx.send(frame);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::frames::TextFrame;
    use crate::pipeline::{PassThrough, Pipeline};
    use std::sync::{Arc, Mutex};

    struct Tagger {
        tag: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor for Tagger {
        fn name(&self) -> &'static str {
            "tagger"
        }

        async fn process(
            &mut self,
            frame: Frame,
            direction: FrameDirection,
            ctx: &ProcessorContext,
        ) -> Result<()> {
            if let Frame::Text(t) = &frame {
                self.seen
                    .lock()
                    .unwrap()
                    .push(format!("{}:{}", self.tag, t.text));
            }
            ctx.push_frame(frame, direction).await
        }
    }

    #[tokio::test]
    async fn both_branches_see_every_frame() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let parallel = ParallelPipeline::new(
            "test_parallel",
            vec![
                vec![Box::new(Tagger {
                    tag: "a",
                    seen: Arc::clone(&seen),
                }) as Box<dyn Processor>],
                vec![Box::new(Tagger {
                    tag: "b",
                    seen: Arc::clone(&seen),
                }) as Box<dyn Processor>],
            ],
        );
        let pipeline = Pipeline::new(vec![Box::new(parallel), Box::new(PassThrough)]);
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut task = pipeline.start(events_tx);
        task.queue_frames(vec![Frame::Text(TextFrame::new("x")), Frame::End])
            .unwrap();
        task.run().await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"a:x".to_owned()));
        assert!(seen.contains(&"b:x".to_owned()));
    }
}
