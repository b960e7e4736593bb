//! The engine that runs a flow against the active LLM and context.
//!
//! The manager owns the flow state and the current node. The LLM turn
//! processor locks it to handle tool calls; the orchestrator locks it to
//! initialize nodes from triage and transport events. Per-session state is
//! only ever mutated under that single lock, so the session stays effectively
//! single-threaded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::context::{ContextMessage, SharedContext};
use crate::error::Result;
use crate::flow::types::{
    ActionConfig, ContextStrategy, FlowState, FunctionSchema, NodeConfig, TurnDisposition,
};
use crate::frames::Frame;
use crate::pipeline::FrameQueue;
use crate::services::llm::{ChatRequest, LlmService, ToolDef};

/// The active node's runtime residue.
struct ActiveNode {
    name: String,
    functions: Vec<FunctionSchema>,
}

/// Drives nodes, tools and transitions for one call.
pub struct FlowManager {
    state: FlowState,
    context: SharedContext,
    queue: FrameQueue,
    llm: Arc<dyn LlmService>,
    node: Option<ActiveNode>,
    pending_post_actions: Vec<ActionConfig>,
    call_ended: bool,
    transfer_in_progress: Arc<AtomicBool>,
    /// While a tool call is being handled, speech collects here so the turn
    /// processor can emit it downstream ahead of the next response, instead
    /// of entering at the pipeline head behind it.
    buffered_speech: Option<Vec<String>>,
}

impl FlowManager {
    /// Build a manager over the main context, pipeline queue and active LLM.
    pub fn new(
        context: SharedContext,
        queue: FrameQueue,
        llm: Arc<dyn LlmService>,
        transfer_in_progress: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state: FlowState::new(),
            context,
            queue,
            llm,
            node: None,
            pending_post_actions: Vec::new(),
            call_ended: false,
            transfer_in_progress,
            buffered_speech: None,
        }
    }

    /// Shared flow state.
    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// Mutable flow state.
    pub fn state_mut(&mut self) -> &mut FlowState {
        &mut self.state
    }

    /// Name of the current node.
    pub fn current_node_name(&self) -> Option<&str> {
        self.node.as_deref_name()
    }

    /// Whether the end-call latch has fired.
    pub fn call_ended(&self) -> bool {
        self.call_ended
    }

    /// Fire the end-call latch. Returns `false` when it was already set, so
    /// a second end-call handler can bail out.
    pub fn mark_call_ended(&mut self) -> bool {
        !std::mem::replace(&mut self.call_ended, true)
    }

    /// Raise or clear the transfer flag shared with the orchestrator.
    pub fn set_transfer_in_progress(&self, value: bool) {
        self.transfer_in_progress.store(value, Ordering::SeqCst);
    }

    /// Whether a SIP transfer is underway.
    pub fn transfer_in_progress(&self) -> bool {
        self.transfer_in_progress.load(Ordering::SeqCst)
    }

    /// Speak fixed text. Buffered during tool handling so ordering against
    /// the model's next response holds; queued at the head otherwise.
    pub fn say(&mut self, text: impl Into<String>) -> Result<()> {
        match self.buffered_speech.as_mut() {
            Some(buffer) => {
                buffer.push(text.into());
                Ok(())
            }
            None => self.queue.queue(Frame::TtsSpeak(text.into())),
        }
    }

    /// Drain speech collected while handling a tool call and leave
    /// buffering mode.
    pub fn take_buffered_speech(&mut self) -> Vec<String> {
        self.buffered_speech.take().unwrap_or_default()
    }

    /// Queue an arbitrary frame at the pipeline head.
    pub fn queue_frame(&self, frame: Frame) -> Result<()> {
        self.queue.queue(frame)
    }

    /// Terminate the conversation.
    pub fn end_conversation(&self) -> Result<()> {
        self.queue.queue(Frame::End)
    }

    /// Snapshot messages and tools for one LLM call.
    pub fn snapshot(&self) -> (Vec<ContextMessage>, Vec<ToolDef>) {
        let messages = self
            .context
            .lock()
            .map(|c| c.messages())
            .unwrap_or_default();
        let tools = self
            .node
            .as_ref()
            .map(|n| n.functions.iter().map(FunctionSchema::tool_def).collect())
            .unwrap_or_default();
        (messages, tools)
    }

    /// Append a message to the shared context.
    pub fn push_context(&self, message: ContextMessage) {
        if let Ok(mut guard) = self.context.lock() {
            guard.push(message);
        }
    }

    /// Enter the first node of the conversation. Queues an LLM run when the
    /// node responds immediately.
    pub async fn initialize(&mut self, node: NodeConfig) -> Result<()> {
        info!(node = %node.name, "flow initialized");
        let run_now = self.set_node(node).await?;
        if run_now {
            self.queue.queue(Frame::LlmRun)?;
        }
        Ok(())
    }

    /// Apply a node: context strategy, function registration, entry actions.
    /// Returns whether an immediate LLM response is wanted.
    async fn set_node(&mut self, node: NodeConfig) -> Result<bool> {
        debug!(node = %node.name, strategy = ?node.context_strategy, "entering node");

        let NodeConfig {
            name,
            role_messages,
            task_messages,
            functions,
            pre_actions,
            post_actions,
            respond_immediately,
            context_strategy,
        } = node;

        self.apply_context_strategy(context_strategy, &role_messages, &task_messages)
            .await;

        let has_messages = !task_messages.is_empty() || !role_messages.is_empty();
        let has_functions = !functions.is_empty();
        self.node = Some(ActiveNode { name, functions });

        for action in pre_actions {
            self.run_action(action).await?;
        }

        let run_now = respond_immediately && (has_messages || has_functions);
        if run_now {
            // Exit actions wait for the node's first response.
            self.pending_post_actions = post_actions;
        } else {
            for action in post_actions {
                self.run_action(action).await?;
            }
            self.pending_post_actions.clear();
        }
        Ok(run_now)
    }

    /// Run any post actions deferred until the node's response completed.
    /// Called by the turn processor, which drains buffered speech after.
    pub async fn complete_node_response(&mut self) -> Result<()> {
        if self.buffered_speech.is_none() {
            self.buffered_speech = Some(Vec::new());
        }
        let actions = std::mem::take(&mut self.pending_post_actions);
        for action in actions {
            self.run_action(action).await?;
        }
        Ok(())
    }

    async fn run_action(&mut self, action: ActionConfig) -> Result<()> {
        match action {
            ActionConfig::TtsSay(text) => self.say(text),
            ActionConfig::Function(handler) => handler(self).await,
            ActionConfig::EndConversation => self.end_conversation(),
        }
    }

    async fn apply_context_strategy(
        &mut self,
        strategy: ContextStrategy,
        role_messages: &[ContextMessage],
        task_messages: &[ContextMessage],
    ) {
        let node_messages = || {
            role_messages
                .iter()
                .chain(task_messages.iter())
                .cloned()
                .collect::<Vec<_>>()
        };
        match strategy {
            ContextStrategy::Append => {
                if let Ok(mut guard) = self.context.lock() {
                    for message in node_messages() {
                        guard.push(message);
                    }
                }
            }
            ContextStrategy::Reset => {
                if let Ok(mut guard) = self.context.lock() {
                    guard.replace(node_messages());
                }
            }
            ContextStrategy::ResetWithSummary => {
                let summary = self.summarize_context().await;
                if let Ok(mut guard) = self.context.lock() {
                    let mut messages = Vec::new();
                    messages.extend(role_messages.iter().cloned());
                    if let Some(summary) = summary {
                        messages.push(ContextMessage::system(format!(
                            "Conversation so far, summarized: {summary}"
                        )));
                    }
                    messages.extend(task_messages.iter().cloned());
                    guard.replace(messages);
                }
            }
        }
    }

    /// Summarize the current context with the active LLM. Fails open to a
    /// plain reset.
    async fn summarize_context(&self) -> Option<String> {
        let history = self.context.lock().ok()?.history();
        if history.is_empty() {
            return None;
        }
        let transcript = history
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let request = ChatRequest::text(vec![
            ContextMessage::system(
                "Summarize this phone conversation in a few sentences. Keep the caller's \
                 identity, anything already verified or collected, and what they want.",
            ),
            ContextMessage::user(transcript),
        ]);
        match self.llm.complete(request).await {
            Ok(completion) if !completion.text.trim().is_empty() => {
                Some(completion.text.trim().to_owned())
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "context summary failed, resetting without one");
                None
            }
        }
    }

    /// Handle one tool call from the LLM. Returns whether the turn loop
    /// should run the model again.
    pub async fn handle_tool_call(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<TurnDisposition> {
        if self.buffered_speech.is_none() {
            self.buffered_speech = Some(Vec::new());
        }
        let current_name = self.node.as_deref_name().map(str::to_owned);
        let handler = self
            .node
            .as_ref()
            .and_then(|n| n.functions.iter().find(|f| f.name == name))
            .map(|f| f.handler.clone());

        let Some(handler) = handler else {
            warn!(tool = name, node = ?current_name, "LLM called unregistered tool");
            return Ok(TurnDisposition::WaitForUser);
        };

        info!(tool = name, "invoking tool handler");
        let outcome = match handler(arguments, self).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(tool = name, error = %e, "tool handler failed, staying in node");
                self.say("I'm sorry, something went wrong. Could you say that again?")?;
                return Ok(TurnDisposition::WaitForUser);
            }
        };

        match outcome.next_node {
            Some(next) => {
                if current_name.as_deref() == Some(next.name.as_str()) {
                    // A transition to the current node is a stay-in-place.
                    debug!(node = %next.name, "duplicate transition treated as stay");
                    if let Some(message) = outcome.message {
                        self.say(message)?;
                    }
                    return Ok(TurnDisposition::WaitForUser);
                }
                // The transition message precedes the new node's entry speech.
                if let Some(message) = &outcome.message {
                    self.say(message.clone())?;
                }
                let run_now = self.set_node(next).await?;
                Ok(if run_now {
                    TurnDisposition::RunAgain
                } else {
                    TurnDisposition::WaitForUser
                })
            }
            None => {
                if self.call_ended {
                    return Ok(TurnDisposition::WaitForUser);
                }
                // Feed the result back so the model can phrase its reply.
                let result_text = outcome.message.unwrap_or_else(|| "done".to_owned());
                self.push_context(ContextMessage::system(format!(
                    "[tool {name} result] {result_text}"
                )));
                Ok(TurnDisposition::RunAgain)
            }
        }
    }
}

trait NodeName {
    fn as_deref_name(&self) -> Option<&str>;
}

impl NodeName for Option<ActiveNode> {
    fn as_deref_name(&self) -> Option<&str> {
        self.as_ref().map(|n| n.name.as_str())
    }
}
