//! LLM service seam and the OpenAI-compatible HTTP streaming client.
//!
//! Any server implementing the OpenAI chat completions API works: OpenAI,
//! Groq, and Anthropic's compatibility endpoint are the profiles the service
//! factory builds. Responses stream via Server-Sent Events so text reaches
//! TTS clause by clause; tool-call deltas are assembled incrementally and
//! surfaced once complete.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LlmServiceConfig;
use crate::context::ContextMessage;
use crate::error::{CallError, Result};

/// A tool the LLM may call, in JSON-schema form.
#[derive(Debug, Clone)]
pub struct ToolDef {
    /// Function name.
    pub name: String,
    /// What the tool does, for the model.
    pub description: String,
    /// JSON-schema `object` describing the parameters.
    pub parameters: serde_json::Value,
}

/// One chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Ordered context messages.
    pub messages: Vec<ContextMessage>,
    /// Tools callable in this turn.
    pub tools: Vec<ToolDef>,
    /// Sampling temperature override.
    pub temperature: Option<f32>,
    /// Completion token cap override.
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// A plain text request with no tools.
    pub fn text(messages: Vec<ContextMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub prompt_tokens: u64,
    /// Completion-side tokens.
    pub completion_tokens: u64,
}

/// Streaming events produced by [`LlmService::stream_chat`].
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// The response began.
    Start,
    /// A text fragment.
    TextDelta(String),
    /// A fully assembled tool call.
    ToolCall {
        /// Function name.
        name: String,
        /// Parsed JSON arguments.
        arguments: serde_json::Value,
    },
    /// The response finished.
    Done {
        /// Token usage when the provider reported it.
        usage: TokenUsage,
    },
}

/// A drained, non-streaming completion.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    /// Concatenated text.
    pub text: String,
    /// Tool calls in emission order.
    pub tool_calls: Vec<(String, serde_json::Value)>,
    /// Token usage.
    pub usage: TokenUsage,
}

/// The language-model seam consumed by the pipeline.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Stable name for usage attribution and logs.
    fn service_name(&self) -> &str;

    /// Stream one chat turn.
    async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<LlmEvent>>>;

    /// Report a mid-stream failure so wrappers can rotate providers.
    fn notify_failure(&self) {}

    /// Run one chat turn to completion, draining the stream.
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion> {
        let mut rx = self.stream_chat(request).await?;
        let mut completion = ChatCompletion::default();
        while let Some(event) = rx.recv().await {
            match event? {
                LlmEvent::Start => {}
                LlmEvent::TextDelta(text) => completion.text.push_str(&text),
                LlmEvent::ToolCall { name, arguments } => {
                    completion.tool_calls.push((name, arguments));
                }
                LlmEvent::Done { usage } => completion.usage = usage,
            }
        }
        Ok(completion)
    }
}

/// OpenAI-compatible chat completions client.
pub struct HttpLlm {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl HttpLlm {
    /// Build a client for the main conversation profile.
    pub fn new(config: &LlmServiceConfig) -> Result<Self> {
        if config.model.trim().is_empty() {
            return Err(CallError::Config("llm config has empty model".into()));
        }
        Ok(Self {
            name: format!("{}:{}", config.provider.as_str(), config.model),
            client: reqwest::Client::new(),
            base_url: config.endpoint(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Build a client with the classifier profile: deterministic sampling
    /// and a tight completion cap, since it only ever emits one token-ish
    /// verdict.
    pub fn classifier(config: &LlmServiceConfig) -> Result<Self> {
        let mut llm = Self::new(config)?;
        llm.temperature = 0.0;
        llm.max_tokens = Some(config.max_tokens.unwrap_or(10));
        Ok(llm)
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
            "temperature": request.temperature.unwrap_or(self.temperature),
        });

        if let Some(max_tokens) = request.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(tools);
        }

        body
    }
}

/// Partially assembled tool call from streamed deltas.
#[derive(Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn finish(self) -> Option<LlmEvent> {
        if self.name.is_empty() {
            return None;
        }
        let arguments = if self.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments).unwrap_or_else(|e| {
                warn!(error = %e, "tool call arguments failed to parse, using empty object");
                serde_json::json!({})
            })
        };
        Some(LlmEvent::ToolCall {
            name: self.name,
            arguments,
        })
    }
}

#[async_trait]
impl LlmService for HttpLlm {
    fn service_name(&self) -> &str {
        &self.name
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
        let body = self.build_body(&request);
        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );

        let mut http = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            http = http.bearer_auth(&self.api_key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| CallError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CallError::Llm(format!(
                "HTTP {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<LlmEvent>>(64);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let _ = tx.send(Ok(LlmEvent::Start)).await;

            let mut line_buffer = String::new();
            let mut pending: Vec<PendingToolCall> = Vec::new();
            let mut usage = TokenUsage::default();
            let mut failed = false;

            'outer: while let Some(chunk) = byte_stream.next().await {
                let chunk: Bytes = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(CallError::Llm(format!("stream read error: {e}"))))
                            .await;
                        failed = true;
                        break;
                    }
                };
                line_buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = line_buffer.find('\n') {
                    let line = line_buffer[..newline].trim_end_matches('\r').to_owned();
                    line_buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'outer;
                    }

                    let value: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(error = %e, "skipping malformed SSE chunk");
                            continue;
                        }
                    };

                    if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
                        usage.prompt_tokens = u["prompt_tokens"].as_u64().unwrap_or(0);
                        usage.completion_tokens = u["completion_tokens"].as_u64().unwrap_or(0);
                    }

                    let delta = &value["choices"][0]["delta"];
                    if let Some(content) = delta["content"].as_str()
                        && !content.is_empty()
                        && tx
                            .send(Ok(LlmEvent::TextDelta(content.to_owned())))
                            .await
                            .is_err()
                    {
                        break 'outer;
                    }

                    if let Some(tool_deltas) = delta["tool_calls"].as_array() {
                        for td in tool_deltas {
                            let index = td["index"].as_u64().unwrap_or(0) as usize;
                            while pending.len() <= index {
                                pending.push(PendingToolCall::default());
                            }
                            if let Some(name) = td["function"]["name"].as_str() {
                                pending[index].name.push_str(name);
                            }
                            if let Some(args) = td["function"]["arguments"].as_str() {
                                pending[index].arguments.push_str(args);
                            }
                        }
                    }
                }
            }

            if !failed {
                for call in pending.drain(..) {
                    if let Some(event) = call.finish()
                        && tx.send(Ok(event)).await.is_err()
                    {
                        return;
                    }
                }
                let _ = tx.send(Ok(LlmEvent::Done { usage })).await;
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::LlmProvider;

    fn test_config() -> LlmServiceConfig {
        LlmServiceConfig {
            provider: LlmProvider::Openai,
            api_key: "sk-test".into(),
            model: "gpt-4o".into(),
            base_url: None,
            temperature: 0.4,
            max_tokens: None,
        }
    }

    #[test]
    fn body_includes_messages_and_tools() {
        let llm = HttpLlm::new(&test_config()).unwrap();
        let request = ChatRequest {
            messages: vec![
                ContextMessage::system("persona"),
                ContextMessage::user("hello"),
            ],
            tools: vec![ToolDef {
                name: "end_call".into(),
                description: "End the call".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }],
            temperature: None,
            max_tokens: None,
        };
        let body = llm.build_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "hello");
        assert_eq!(body["tools"][0]["function"]["name"], "end_call");
    }

    #[test]
    fn classifier_profile_pins_sampling() {
        let llm = HttpLlm::classifier(&test_config()).unwrap();
        let body = llm.build_body(&ChatRequest::text(vec![ContextMessage::user("hi")]));
        let temp = body["temperature"].as_f64().unwrap();
        assert!(temp.abs() < 0.001);
        assert_eq!(body["max_tokens"], 10);
    }

    #[test]
    fn empty_model_is_a_config_error() {
        let mut config = test_config();
        config.model = String::new();
        assert!(HttpLlm::new(&config).is_err());
    }

    #[test]
    fn pending_tool_call_parses_arguments() {
        let call = PendingToolCall {
            name: "lookup_by_phone".into(),
            arguments: r#"{"phone_number": "5165667132"}"#.into(),
        };
        match call.finish().unwrap() {
            LlmEvent::ToolCall { name, arguments } => {
                assert_eq!(name, "lookup_by_phone");
                assert_eq!(arguments["phone_number"], "5165667132");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn pending_tool_call_tolerates_bad_json() {
        let call = PendingToolCall {
            name: "end_call".into(),
            arguments: "{not json".into(),
        };
        match call.finish().unwrap() {
            LlmEvent::ToolCall { arguments, .. } => {
                assert_eq!(arguments, serde_json::json!({}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sse_stream_yields_text_tools_and_usage() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"there.\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"name\":\"end_call\",\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":42,\"completion_tokens\":7}}\n\n",
            "data: [DONE]\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut config = test_config();
        config.base_url = Some(format!("{}/v1", server.uri()));
        let llm = HttpLlm::new(&config).unwrap();

        let completion = llm
            .complete(ChatRequest::text(vec![ContextMessage::user("hi")]))
            .await
            .unwrap();
        assert_eq!(completion.text, "Hello there.");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].0, "end_call");
        assert_eq!(completion.usage.prompt_tokens, 42);
        assert_eq!(completion.usage.completion_tokens, 7);
    }

    #[tokio::test]
    async fn http_error_surfaces_with_status() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.base_url = Some(format!("{}/v1", server.uri()));
        let llm = HttpLlm::new(&config).unwrap();

        let err = llm
            .stream_chat(ChatRequest::text(vec![ContextMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("429"));
    }
}
