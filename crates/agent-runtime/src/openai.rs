//! OpenAI-compatible LLM Provider
//!
//! Implementation of `LlmProvider` for chat-completions endpoints: OpenAI
//! itself, Mistral, and Ollama's `/v1` compatibility layer.

use std::sync::Arc;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role, Usage},
    provider::{ChatRequest, FinishReason, LlmProvider, ProviderStream},
    stream::{self, FrameEvent, ToolCallFragment},
    tool::{ToolCall, ToolSchema},
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::transport::{HttpTransport, Transport};

/// Provider configuration
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Provider name, for logs
    pub name: String,

    /// API root, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Bearer token; local endpoints need none
    pub api_key: Option<String>,

    /// Model used when the request does not name one
    pub model: String,

    /// Completion token cap
    pub max_tokens: u32,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Whether the endpoint accepts tool definitions
    pub supports_tools: bool,

    /// Additional headers sent with every request
    pub extra_headers: Vec<(String, String)>,
}

impl ProviderConfig {
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key: Some(api_key.into()),
            model: model.into(),
            max_tokens: 1024,
            timeout_secs: 120,
            supports_tools: true,
            extra_headers: Vec::new(),
        }
    }

    /// Mistral accepts no tool definitions through this adapter
    pub fn mistral(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: "mistral".into(),
            base_url: "https://api.mistral.ai/v1".into(),
            supports_tools: false,
            ..Self::openai(api_key, model)
        }
    }

    /// Local Ollama through its OpenAI-compatible endpoint
    pub fn ollama(model: impl Into<String>) -> Self {
        Self {
            name: "ollama".into(),
            base_url: "http://localhost:11434/v1".into(),
            api_key: None,
            model: model.into(),
            max_tokens: 1024,
            timeout_secs: 120,
            supports_tools: true,
            extra_headers: Vec::new(),
        }
    }

    /// Build from environment variables
    pub fn from_env() -> Result<Self> {
        let provider = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".into());
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        let model = std::env::var("LLM_MODEL").ok();

        let require_key = |name: &str| {
            api_key.clone().ok_or_else(|| {
                AgentError::Config(format!("{} requires LLM_API_KEY or OPENAI_API_KEY", name))
            })
        };

        let mut config = match provider.as_str() {
            "openai" => Self::openai(require_key("openai")?, model.unwrap_or_else(|| "gpt-4o-mini".into())),
            "mistral" => Self::mistral(
                require_key("mistral")?,
                model.unwrap_or_else(|| "mistral-small-latest".into()),
            ),
            "ollama" => Self::ollama(model.unwrap_or_else(|| "llama3.2".into())),
            other => {
                return Err(AgentError::Config(format!("Unknown LLM_PROVIDER '{}'", other)));
            }
        };

        if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(max_tokens) = std::env::var("LLM_MAX_TOKENS").ok().and_then(|v| v.parse().ok()) {
            config.max_tokens = max_tokens;
        }
        if let Some(secs) = std::env::var("LLM_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()) {
            config.timeout_secs = secs;
        }

        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Authorization plus extra headers
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::with_capacity(self.extra_headers.len() + 1);
        if let Some(key) = &self.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
        }
        headers.extend(self.extra_headers.iter().cloned());
        headers
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Chat-completions provider
pub struct OpenAiProvider {
    config: ProviderConfig,
    transport: Arc<dyn Transport>,
}

impl OpenAiProvider {
    /// Create over an HTTP transport
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.timeout())?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create over a custom transport
    pub fn with_transport(config: ProviderConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ProviderConfig::from_env()?)
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Build the request body
    pub fn build_body(&self, request: &ChatRequest, stream: bool) -> Result<Value> {
        if !request.tools.is_empty() && !self.config.supports_tools {
            return Err(AgentError::Config(format!(
                "{} does not support tools",
                self.config.name
            )));
        }

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        messages.extend(request.messages.iter().map(convert_message));

        let options = &request.options;
        let model = if options.model.is_empty() {
            &self.config.model
        } else {
            &options.model
        };

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": options.max_tokens.min(self.config.max_tokens),
            "temperature": options.temperature,
            "top_p": options.top_p,
        });

        if !options.stop_sequences.is_empty() {
            body["stop"] = json!(options.stop_sequences);
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_payload).collect());
        }

        if stream {
            body["stream"] = Value::Bool(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        Ok(body)
    }

    /// Decode a non-streaming response
    pub fn parse_response(value: Value) -> Result<Message> {
        let raw_tool_calls = value
            .pointer("/choices/0/message/tool_calls")
            .cloned()
            .unwrap_or(Value::Null);

        let response: ChatCompletion = serde_json::from_value(value)
            .map_err(|e| AgentError::Protocol(format!("unexpected completion shape: {}", e)))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Protocol("completion has no choices".into()))?;

        let content = choice.message.content.unwrap_or_default();
        let usage = response.usage.map(Usage::from);
        let finish = choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_wire);

        let message = match choice.message.tool_calls {
            Some(calls) if !calls.is_empty() => {
                let calls = calls
                    .into_iter()
                    .map(|c| ToolCall::parse(c.id, c.function.name, c.function.arguments))
                    .collect::<Result<Vec<_>>>()?;
                Message::tool_call(content, calls).add_metadata("tool_calls", raw_tool_calls)
            }
            _ if finish == Some(FinishReason::ToolCalls) => {
                return Err(AgentError::Protocol(
                    "finish reason 'tool_calls' without any tool call".into(),
                ));
            }
            _ if finish == Some(FinishReason::Error) => {
                return Err(AgentError::Protocol("provider reported an error finish".into()));
            }
            _ => Message::assistant(content),
        };

        let message = match finish {
            Some(reason) => message.add_metadata("finish_reason", json!(reason.as_str())),
            None => message,
        };

        Ok(message.with_usage(usage))
    }
}

/// Decode one SSE `data:` payload
pub fn decode_frame(data: &str) -> Result<Vec<FrameEvent>> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| AgentError::Protocol(format!("malformed stream frame: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(AgentError::Protocol(format!("provider error: {}", error.message)));
    }

    let mut events = Vec::new();

    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            events.push(FrameEvent::TextDelta(text));
        }

        for call in choice.delta.tool_calls.unwrap_or_default() {
            let function = call.function.unwrap_or_default();
            events.push(FrameEvent::ToolCallFragment(ToolCallFragment {
                index: call.index,
                id: call.id.filter(|id| !id.is_empty()),
                name: function.name,
                arguments: function.arguments,
            }));
        }

        if let Some(reason) = choice.finish_reason {
            events.push(FrameEvent::FinishSignal(FinishReason::from_wire(&reason)));
        }
    }

    if let Some(usage) = chunk.usage {
        events.push(FrameEvent::UsageInfo(usage.into()));
    }

    Ok(events)
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports_tools(&self) -> bool {
        self.config.supports_tools
    }

    async fn health_check(&self) -> Result<bool> {
        match self
            .transport
            .get_json(&self.config.endpoint("models"), &self.config.headers())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(provider = %self.config.name, error = %e, "Provider health check failed");
                Ok(false)
            }
        }
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Message> {
        let body = self.build_body(request, false)?;

        tracing::debug!(
            provider = %self.config.name,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending chat request"
        );

        let value = self
            .transport
            .post_json(&self.config.endpoint("chat/completions"), &self.config.headers(), &body)
            .await?;

        Self::parse_response(value)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ProviderStream> {
        let body = self.build_body(request, true)?;

        tracing::debug!(
            provider = %self.config.name,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Opening chat stream"
        );

        let bytes = self
            .transport
            .post_stream(&self.config.endpoint("chat/completions"), &self.config.headers(), &body)
            .await?;

        Ok(stream::assemble(bytes, decode_frame))
    }
}

fn convert_message(message: &Message) -> Value {
    match message.role {
        Role::System => json!({"role": "system", "content": message.content}),
        Role::User => json!({"role": "user", "content": message.content}),
        Role::Assistant => json!({"role": "assistant", "content": message.content}),
        Role::ToolCall => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments},
                    })
                })
                .collect();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::ToolResult => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
    }
}

fn tool_payload(schema: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": schema.parameters_json(),
        }
    })
}

// Wire types

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}
