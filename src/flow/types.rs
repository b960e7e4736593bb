//! Declarative node and function types for the conversation flow engine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::ContextMessage;
use crate::error::Result;
use crate::flow::manager::FlowManager;
use crate::services::llm::ToolDef;

/// Keyed state carried across nodes and flows. The map is the single
/// carrier of identity and collected fields through workflow handoffs.
#[derive(Debug, Clone, Default)]
pub struct FlowState {
    values: HashMap<String, serde_json::Value>,
}

impl FlowState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// String value, empty when missing or not a string.
    pub fn str(&self, key: &str) -> String {
        self.values
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned()
    }

    /// Boolean value, `false` when missing.
    pub fn flag(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Integer value, `0` when missing.
    pub fn int(&self, key: &str) -> i64 {
        self.values
            .get(key)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Set a value only when the key is absent or null.
    pub fn set_default(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        let missing = match self.values.get(key) {
            None | Some(serde_json::Value::Null) => true,
            Some(v) => v.as_str().is_some_and(str::is_empty),
        };
        if missing {
            self.values.insert(key.to_owned(), value.into());
        }
    }

    /// Remove a value, returning it.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    /// Increment an integer counter, returning the new value.
    pub fn bump(&mut self, key: &str) -> i64 {
        let next = self.int(key) + 1;
        self.set(key, next);
        next
    }
}

/// What the turn loop should do after a tool call was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDisposition {
    /// Run the model again immediately (transition with an immediate
    /// response, or a tool result for the model to phrase).
    RunAgain,
    /// Wait for the next user utterance.
    WaitForUser,
}

/// What a tool handler decided: an optional spoken message and an optional
/// transition target.
#[derive(Default)]
pub struct HandlerOutcome {
    /// Spoken (or LLM-relayed) result message.
    pub message: Option<String>,
    /// Node to transition to; `None` stays in place.
    pub next_node: Option<NodeConfig>,
}

impl HandlerOutcome {
    /// Stay in the current node silently.
    pub fn stay() -> Self {
        Self::default()
    }

    /// Stay in the current node; the message is relayed through the LLM.
    pub fn say(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            next_node: None,
        }
    }

    /// Transition without a message.
    pub fn next(node: NodeConfig) -> Self {
        Self {
            message: None,
            next_node: Some(node),
        }
    }

    /// Speak a message, then transition.
    pub fn say_and_next(message: impl Into<String>, node: NodeConfig) -> Self {
        Self {
            message: Some(message.into()),
            next_node: Some(node),
        }
    }
}

/// Boxed future returned by handlers.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A tool handler: `(args, manager) -> (message | None, next_node | None)`.
pub type FunctionHandler = Arc<
    dyn for<'a> Fn(serde_json::Value, &'a mut FlowManager) -> HandlerFuture<'a, HandlerOutcome>
        + Send
        + Sync,
>;

/// An inline action handler run during node entry.
pub type ActionHandler =
    Arc<dyn for<'a> Fn(&'a mut FlowManager) -> HandlerFuture<'a, ()> + Send + Sync>;

/// Wrap a tool-handler closure, pinning it to the higher-ranked signature
/// the engine expects (plain coercion loses the borrow lifetime).
pub fn handler_fn<F>(f: F) -> FunctionHandler
where
    F: for<'a> Fn(serde_json::Value, &'a mut FlowManager) -> HandlerFuture<'a, HandlerOutcome>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Wrap an action closure, pinning it to the expected signature.
pub fn action_fn<F>(f: F) -> ActionHandler
where
    F: for<'a> Fn(&'a mut FlowManager) -> HandlerFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A tool callable by the LLM, with its handler.
#[derive(Clone)]
pub struct FunctionSchema {
    /// Function name.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON-schema property map.
    pub properties: serde_json::Value,
    /// Required property names.
    pub required: Vec<String>,
    /// Handler invoked when the model calls the function.
    pub handler: FunctionHandler,
}

impl FunctionSchema {
    /// Build a schema.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: serde_json::Value,
        required: &[&str],
        handler: FunctionHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            properties,
            required: required.iter().map(|s| (*s).to_owned()).collect(),
            handler,
        }
    }

    /// The wire-level tool definition.
    pub fn tool_def(&self) -> ToolDef {
        ToolDef {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": self.properties,
                "required": self.required,
            }),
        }
    }
}

impl std::fmt::Debug for FunctionSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSchema")
            .field("name", &self.name)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// An ordered node-entry or node-exit action.
#[derive(Clone)]
pub enum ActionConfig {
    /// Speak fixed text.
    TtsSay(String),
    /// Run a bound handler (SIP transfer after the transfer message, etc).
    Function(ActionHandler),
    /// Terminate the conversation.
    EndConversation,
}

impl std::fmt::Debug for ActionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TtsSay(text) => f.debug_tuple("TtsSay").field(text).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::EndConversation => f.write_str("EndConversation"),
        }
    }
}

/// Policy for carrying prior messages across a node transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContextStrategy {
    /// Leave prior messages, append the node's.
    #[default]
    Append,
    /// Replace all prior messages with the node's.
    Reset,
    /// Replace with an LLM-generated summary plus the node's messages.
    ResetWithSummary,
}

/// One state of the conversation.
#[derive(Debug, Default)]
pub struct NodeConfig {
    /// Node name; also the duplicate-transition guard key.
    pub name: String,
    /// Persona system prompts.
    pub role_messages: Vec<ContextMessage>,
    /// Task-specific system prompts.
    pub task_messages: Vec<ContextMessage>,
    /// Tools callable while in this node.
    pub functions: Vec<FunctionSchema>,
    /// Ordered actions run on entry.
    pub pre_actions: Vec<ActionConfig>,
    /// Ordered actions run after the node's first response (or immediately
    /// when the node never responds).
    pub post_actions: Vec<ActionConfig>,
    /// Trigger an LLM response on entry instead of waiting for the user.
    pub respond_immediately: bool,
    /// Context carry policy.
    pub context_strategy: ContextStrategy,
}

impl NodeConfig {
    /// Start a node definition. Defaults: respond immediately, append
    /// context.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            respond_immediately: true,
            ..Self::default()
        }
    }

    /// Add a persona system prompt.
    pub fn role_message(mut self, content: impl Into<String>) -> Self {
        self.role_messages.push(ContextMessage::system(content));
        self
    }

    /// Add a task system prompt.
    pub fn task_message(mut self, content: impl Into<String>) -> Self {
        self.task_messages.push(ContextMessage::system(content));
        self
    }

    /// Add a task message with a non-system role (greeting injection).
    pub fn task_context(mut self, message: ContextMessage) -> Self {
        self.task_messages.push(message);
        self
    }

    /// Add a callable function.
    pub fn function(mut self, schema: FunctionSchema) -> Self {
        self.functions.push(schema);
        self
    }

    /// Add an entry action.
    pub fn pre_action(mut self, action: ActionConfig) -> Self {
        self.pre_actions.push(action);
        self
    }

    /// Add an exit action.
    pub fn post_action(mut self, action: ActionConfig) -> Self {
        self.post_actions.push(action);
        self
    }

    /// Wait for the user instead of responding on entry.
    pub fn wait_for_user(mut self) -> Self {
        self.respond_immediately = false;
        self
    }

    /// Set the context carry policy.
    pub fn context_strategy(mut self, strategy: ContextStrategy) -> Self {
        self.context_strategy = strategy;
        self
    }
}
