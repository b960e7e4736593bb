//! The main-LLM pipeline stage: runs turns, streams text, dispatches tools.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::flow::manager::FlowManager;
use crate::flow::types::TurnDisposition;
use crate::frames::{Frame, FrameDirection, ToolCallFrame, ToolResultFrame};
use crate::pipeline::processor::{Processor, ProcessorContext};
use crate::services::llm::{ChatRequest, LlmEvent, LlmService};
use crate::session::usage::UsageObserver;

/// A turn may chain tool calls (`RunAgain`); cap the chain so a confused
/// model cannot spin the session.
const MAX_TURN_STEPS: usize = 8;

/// Pipeline stage driving the conversation LLM against the flow manager.
pub struct LlmTurnProcessor {
    llm: Arc<dyn LlmService>,
    manager: Arc<Mutex<FlowManager>>,
    usage: Arc<UsageObserver>,
}

impl LlmTurnProcessor {
    /// Build the stage.
    pub fn new(
        llm: Arc<dyn LlmService>,
        manager: Arc<Mutex<FlowManager>>,
        usage: Arc<UsageObserver>,
    ) -> Self {
        Self {
            llm,
            manager,
            usage,
        }
    }

    /// Stream one response. Returns collected tool calls, or `None` when the
    /// stream failed.
    async fn stream_response(
        &mut self,
        ctx: &ProcessorContext,
    ) -> Result<Option<Vec<(String, serde_json::Value)>>> {
        let (messages, tools) = {
            let manager = self.manager.lock().await;
            manager.snapshot()
        };
        if messages.is_empty() {
            debug!("skipping LLM run with empty context");
            return Ok(Some(Vec::new()));
        }

        let request = ChatRequest {
            messages,
            tools,
            temperature: None,
            max_tokens: None,
        };

        ctx.push_frame(Frame::LlmResponseStart, FrameDirection::Downstream)
            .await?;

        let mut stream = match self.llm.stream_chat(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "LLM request failed");
                ctx.push_frame(Frame::LlmResponseEnd, FrameDirection::Downstream)
                    .await?;
                return Ok(None);
            }
        };

        let mut tool_calls = Vec::new();
        let mut failed = false;
        while let Some(event) = stream.recv().await {
            match event {
                Ok(LlmEvent::Start) => {}
                Ok(LlmEvent::TextDelta(text)) => {
                    // Interruption drops the rest of the response, but the
                    // response-end frame below still reaches the aggregator.
                    if !ctx.interrupted() {
                        ctx.push_frame(Frame::LlmText(text), FrameDirection::Downstream)
                            .await?;
                    }
                }
                Ok(LlmEvent::ToolCall { name, arguments }) => {
                    tool_calls.push((name, arguments));
                }
                Ok(LlmEvent::Done { usage }) => {
                    self.usage.record_llm_usage(self.llm.service_name(), usage);
                }
                Err(e) => {
                    warn!(error = %e, "LLM stream failed");
                    failed = true;
                    break;
                }
            }
        }

        ctx.push_frame(Frame::LlmResponseEnd, FrameDirection::Downstream)
            .await?;
        if failed {
            return Ok(None);
        }
        Ok(Some(tool_calls))
    }

    async fn run_turn(&mut self, ctx: &ProcessorContext) -> Result<()> {
        ctx.clear_interruption();

        let mut retried = false;
        let mut steps = 0;
        loop {
            steps += 1;
            if steps > MAX_TURN_STEPS {
                warn!("turn exceeded {MAX_TURN_STEPS} steps, waiting for user");
                break;
            }

            let tool_calls = match self.stream_response(ctx).await? {
                Some(calls) => calls,
                None => {
                    // One retry; a configured fallback wrapper swaps the
                    // active service when notified.
                    self.llm.notify_failure();
                    if retried {
                        warn!("LLM failed twice, giving up on this turn");
                        break;
                    }
                    retried = true;
                    continue;
                }
            };

            let Some((name, arguments)) = tool_calls.into_iter().next() else {
                let speech = {
                    let mut manager = self.manager.lock().await;
                    manager.complete_node_response().await?;
                    manager.take_buffered_speech()
                };
                for text in speech {
                    ctx.push_frame(Frame::TtsSpeak(text), FrameDirection::Downstream)
                        .await?;
                }
                break;
            };

            ctx.push_frame(
                Frame::ToolCall(ToolCallFrame {
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                FrameDirection::Downstream,
            )
            .await?;

            let (disposition, speech) = {
                let mut manager = self.manager.lock().await;
                manager.complete_node_response().await?;
                let disposition = manager.handle_tool_call(&name, arguments).await?;
                ctx.push_frame(
                    Frame::ToolResult(ToolResultFrame {
                        name,
                        message: None,
                        next_node: manager.current_node_name().map(str::to_owned),
                    }),
                    FrameDirection::Downstream,
                )
                .await?;
                (disposition, manager.take_buffered_speech())
            };
            // Transition messages and entry speech precede the new node's
            // immediate response.
            for text in speech {
                ctx.push_frame(Frame::TtsSpeak(text), FrameDirection::Downstream)
                    .await?;
            }

            match disposition {
                TurnDisposition::RunAgain => {}
                TurnDisposition::WaitForUser => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for LlmTurnProcessor {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &ProcessorContext,
    ) -> Result<()> {
        match (&frame, direction) {
            (Frame::LlmRun, FrameDirection::Downstream) => self.run_turn(ctx).await,
            _ => ctx.push_frame(frame, direction).await,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::context::{ContextMessage, shared_context};
    use crate::flow::types::{FunctionSchema, HandlerOutcome, NodeConfig, handler_fn};
    use crate::pipeline::{PassThrough, Pipeline};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    /// Scripted service: pops one canned response per call.
    struct ScriptedLlm {
        responses: std::sync::Mutex<Vec<Vec<LlmEvent>>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Vec<LlmEvent>>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmService for ScriptedLlm {
        fn service_name(&self) -> &str {
            "scripted"
        }

        async fn stream_chat(
            &self,
            _request: ChatRequest,
        ) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
            let events = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    vec![LlmEvent::Done {
                        usage: Default::default(),
                    }]
                } else {
                    responses.remove(0)
                }
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for event in events {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn rig(
        llm: Arc<dyn LlmService>,
    ) -> (
        LlmTurnProcessor,
        Arc<Mutex<FlowManager>>,
        ProcessorContext,
        mpsc::Receiver<Frame>,
    ) {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let task = Pipeline::new(vec![Box::new(PassThrough)]).start(events_tx.clone());
        let manager = Arc::new(Mutex::new(FlowManager::new(
            shared_context(vec![ContextMessage::system("persona")]),
            task.queue_handle(),
            llm.clone(),
            Arc::new(AtomicBool::new(false)),
        )));
        // Dropping the task detaches its processor tasks; the queue handle
        // held by the manager keeps the head alive.
        drop(task);
        let processor = LlmTurnProcessor::new(llm, manager.clone(), Arc::new(UsageObserver::new()));
        let (down_tx, down_rx) = mpsc::channel(64);
        let (up_tx, _up_rx) = mpsc::unbounded_channel();
        let ctx = ProcessorContext::new(
            "test",
            down_tx,
            up_tx,
            events_tx,
            Arc::new(AtomicBool::new(false)),
            tokio_util::sync::CancellationToken::new(),
        );
        (processor, manager, ctx, down_rx)
    }

    fn drain_kinds(rx: &mut mpsc::Receiver<Frame>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            kinds.push(frame.kind());
        }
        kinds
    }

    #[tokio::test]
    async fn text_response_streams_between_markers() {
        let llm = Arc::new(ScriptedLlm::new(vec![vec![
            LlmEvent::Start,
            LlmEvent::TextDelta("Hello ".into()),
            LlmEvent::TextDelta("there.".into()),
            LlmEvent::Done {
                usage: Default::default(),
            },
        ]]));
        let (mut processor, _manager, ctx, mut down_rx) = rig(llm);
        processor
            .process(Frame::LlmRun, FrameDirection::Downstream, &ctx)
            .await
            .unwrap();
        assert_eq!(
            drain_kinds(&mut down_rx),
            vec![
                "llm_response_start",
                "llm_text",
                "llm_text",
                "llm_response_end"
            ]
        );
    }

    #[tokio::test]
    async fn tool_call_dispatches_to_manager() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        let handler = handler_fn(move |_args, _mgr| {
            let called = Arc::clone(&called_clone);
            Box::pin(async move {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(HandlerOutcome {
                    message: None,
                    next_node: Some(NodeConfig::named("next").task_message("next").wait_for_user()),
                })
            })
        });

        let llm = Arc::new(ScriptedLlm::new(vec![vec![
            LlmEvent::Start,
            LlmEvent::ToolCall {
                name: "set_returning_patient".into(),
                arguments: serde_json::json!({}),
            },
            LlmEvent::Done {
                usage: Default::default(),
            },
        ]]));
        let (mut processor, manager, ctx, mut down_rx) = rig(llm);
        {
            let mut mgr = manager.lock().await;
            mgr.initialize(
                NodeConfig::named("greeting")
                    .task_message("greet")
                    .function(FunctionSchema::new(
                        "set_returning_patient",
                        "Returning patient.",
                        serde_json::json!({}),
                        &[],
                        handler,
                    ))
                    .wait_for_user(),
            )
            .await
            .unwrap();
        }

        processor
            .process(Frame::LlmRun, FrameDirection::Downstream, &ctx)
            .await
            .unwrap();

        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
        let kinds = drain_kinds(&mut down_rx);
        assert!(kinds.contains(&"tool_call"));
        assert!(kinds.contains(&"tool_result"));
        assert_eq!(manager.lock().await.current_node_name(), Some("next"));
    }

    #[tokio::test]
    async fn failed_stream_retries_once() {
        struct FailingLlm {
            calls: std::sync::Mutex<usize>,
        }

        #[async_trait]
        impl LlmService for FailingLlm {
            fn service_name(&self) -> &str {
                "failing"
            }

            async fn stream_chat(
                &self,
                _request: ChatRequest,
            ) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
                *self.calls.lock().unwrap() += 1;
                Err(crate::error::CallError::Llm("boom".into()))
            }
        }

        let llm = Arc::new(FailingLlm {
            calls: std::sync::Mutex::new(0),
        });
        let (mut processor, _manager, ctx, _down_rx) = rig(llm.clone());
        processor
            .process(Frame::LlmRun, FrameDirection::Downstream, &ctx)
            .await
            .unwrap();
        assert_eq!(*llm.calls.lock().unwrap(), 2);
    }
}
