//! Reasoning Loop
//!
//! Drives multi-turn tool calling: send the conversation, execute any tools
//! the model asks for, feed the results back, and repeat until the model
//! answers or the depth limit is hit.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, AgentListener, EventBus};
use crate::history::{ChatHistory, DEFAULT_CONTEXT_WINDOW};
use crate::message::Message;
use crate::provider::{ChatRequest, GenerationOptions, LlmProvider, ProviderStream, StreamEvent};
use crate::tool::{Tool, ToolCall, ToolRegistry, ToolResult};

/// Default limit on consecutive tool-call rounds
pub const DEFAULT_MAX_TOOL_DEPTH: usize = 10;

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Active system instruction
    pub instructions: Option<String>,

    /// Maximum tool-call rounds before giving up
    pub max_tool_depth: usize,

    /// Generation options
    pub generation: GenerationOptions,

    /// Deadline for each provider call
    pub provider_timeout: Option<Duration>,

    /// Keep streamed text as the answer when the deadline hits mid-stream
    pub partial_on_timeout: bool,

    /// Run the tools of one round concurrently
    pub parallel_tool_calls: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instructions: None,
            max_tool_depth: DEFAULT_MAX_TOOL_DEPTH,
            generation: GenerationOptions::default(),
            provider_timeout: None,
            partial_on_timeout: false,
            parallel_tool_calls: true,
        }
    }
}

/// Stream of text chunks from [`Agent::stream`]
pub type TextStream<'a> = Pin<Box<dyn Stream<Item = Result<String>> + Send + 'a>>;

/// The main Agent struct
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    history: Arc<ChatHistory>,
    config: AgentConfig,
    instructions: RwLock<Option<String>>,
    events: EventBus,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        history: Arc<ChatHistory>,
        config: AgentConfig,
    ) -> Self {
        let instructions = RwLock::new(config.instructions.clone());
        Self {
            provider,
            tools,
            history,
            config,
            instructions,
            events: EventBus::new(),
        }
    }

    /// Create with default configuration and an in-memory history
    pub fn with_defaults(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self::new(
            provider,
            tools,
            Arc::new(ChatHistory::in_memory(DEFAULT_CONTEXT_WINDOW)),
            AgentConfig::default(),
        )
    }

    /// Current system instruction
    pub fn instructions(&self) -> Option<String> {
        self.instructions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the system instruction, returning the previous one
    pub fn set_instructions(&self, instructions: impl Into<String>) -> Option<String> {
        let mut guard = self.instructions.write().unwrap_or_else(PoisonError::into_inner);
        guard.replace(instructions.into())
    }

    /// Subscribe to lifecycle events
    pub fn observe(&self, listener: Arc<dyn AgentListener>) {
        self.events.subscribe(listener);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Send a user turn and run the tool loop to a final answer
    pub async fn chat(&self, message: Message) -> Result<Message> {
        self.chat_with_instructions(message, self.instructions()).await
    }

    /// Like [`Agent::chat`], with `instructions` fixed for every provider
    /// call of the turn regardless of later [`Agent::set_instructions`]
    pub async fn chat_with_instructions(
        &self,
        message: Message,
        instructions: Option<String>,
    ) -> Result<Message> {
        self.events.notify(AgentEvent::ChatStart {
            message: message.clone(),
        });

        self.history.append(message).await?;
        let response = self.run_tool_loop(instructions.as_deref()).await?;
        if let Some(usage) = response.usage {
            tracing::debug!(total_tokens = usage.total(), "Turn finished");
        }

        self.events.notify(AgentEvent::ChatStop {
            message: response.clone(),
        });
        Ok(response)
    }

    /// Convenience wrapper for a plain-text question
    pub async fn ask(&self, question: &str) -> Result<String> {
        Ok(self.chat(Message::user(question)).await?.content)
    }

    async fn run_tool_loop(&self, instructions: Option<&str>) -> Result<Message> {
        let mut depth = 0;

        loop {
            if depth >= self.config.max_tool_depth {
                return Err(AgentError::MaxToolDepthExceeded(self.config.max_tool_depth));
            }

            let request = self.build_request(instructions).await;
            let response = self
                .with_deadline(self.provider.chat(&request))
                .await?;

            if !response.is_tool_call() {
                self.history.append(response.clone()).await?;
                return Ok(response);
            }

            tracing::debug!(
                depth,
                calls = response.tool_calls.len(),
                provider = self.provider.name(),
                "Model requested tools"
            );

            self.record_tool_round(response).await?;
            depth += 1;
        }
    }

    /// Stream a user turn; tool rounds run between chunks
    ///
    /// The final assistant message is appended to history once the stream
    /// completes. Dropping the stream cancels the in-flight request.
    pub fn stream(&self, message: Message) -> TextStream<'_> {
        let instructions = self.instructions();
        Box::pin(async_stream::try_stream! {
            self.events.notify(AgentEvent::ChatStart { message: message.clone() });
            self.history.append(message).await?;

            let mut depth = 0;
            loop {
                if depth >= self.config.max_tool_depth {
                    Err::<(), _>(AgentError::MaxToolDepthExceeded(self.config.max_tool_depth))?;
                }

                let request = self.build_request(instructions.as_deref()).await;
                let deadline = self.config.provider_timeout.map(|limit| Instant::now() + limit);
                let mut events = self.with_deadline(self.provider.stream(&request)).await?;
                let mut partial = String::new();

                let finished = loop {
                    let next = match self.next_event(&mut events, deadline).await {
                        Err(AgentError::ProviderTimeout(_))
                            if self.config.partial_on_timeout && !partial.is_empty() =>
                        {
                            tracing::debug!(chars = partial.len(), "Deadline hit, keeping partial answer");
                            let message = Message::assistant(std::mem::take(&mut partial))
                                .add_metadata("partial", serde_json::Value::Bool(true));
                            break Some(message);
                        }
                        other => other?,
                    };

                    match next {
                        Some(StreamEvent::TextDelta(text)) => {
                            partial.push_str(&text);
                            yield text;
                        }
                        Some(StreamEvent::ToolCalls(call_message)) => {
                            tracing::debug!(depth, calls = call_message.tool_calls.len(), "Model requested tools while streaming");
                            self.record_tool_round(call_message).await?;
                            break None;
                        }
                        Some(StreamEvent::Completed(message)) => break Some(message),
                        None => Err::<(), _>(AgentError::Protocol("provider stream ended without a final message".into()))?,
                    }
                };

                if let Some(message) = finished {
                    self.history.append(message.clone()).await?;
                    self.events.notify(AgentEvent::ChatStop { message });
                    break;
                }

                depth += 1;
            }
        })
    }

    async fn next_event(
        &self,
        events: &mut ProviderStream,
        deadline: Option<Instant>,
    ) -> Result<Option<StreamEvent>> {
        let next = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, events.next())
                .await
                .map_err(|_| self.timeout_error())?,
            None => events.next().await,
        };
        next.transpose()
    }

    async fn with_deadline<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.provider_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| self.timeout_error())?,
            None => call.await,
        }
    }

    fn timeout_error(&self) -> AgentError {
        AgentError::ProviderTimeout(self.config.provider_timeout.unwrap_or_default())
    }

    async fn build_request(&self, instructions: Option<&str>) -> ChatRequest {
        ChatRequest::new(self.history.all().await)
            .with_system_prompt(instructions.map(str::to_string))
            .with_tools(self.tools.schemas())
            .with_options(self.config.generation.clone())
    }

    /// Run the calls of one round and append the call message plus one
    /// result per call, in call order
    async fn record_tool_round(&self, call_message: Message) -> Result<()> {
        let results = self.execute_tools(&call_message.tool_calls).await;

        let mut batch = Vec::with_capacity(results.len() + 1);
        batch.push(call_message);
        batch.extend(results.into_iter().map(ToolResult::into_message));

        self.history.extend(batch).await
    }

    async fn execute_tools(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        for call in calls {
            self.events.notify(AgentEvent::ToolCalling { call: call.clone() });
        }

        let results = if self.config.parallel_tool_calls {
            futures::future::join_all(calls.iter().map(|call| self.tools.execute(call))).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.tools.execute(call).await);
            }
            results
        };

        for (call, result) in calls.iter().zip(&results) {
            self.events.notify(AgentEvent::ToolCalled {
                call: call.clone(),
                result: result.clone(),
            });
        }

        results
    }

    /// Get the tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the chat history
    pub fn history(&self) -> &Arc<ChatHistory> {
        &self.history
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Arc<ToolRegistry>,
    history: Option<Arc<ChatHistory>>,
    listeners: Vec<Arc<dyn AgentListener>>,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: Arc::new(ToolRegistry::new()),
            history: None,
            listeners: Vec::new(),
            config: AgentConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a tool; fails on a duplicate name
    pub fn tool<T: Tool + 'static>(self, tool: T) -> Result<Self> {
        self.tools.register(tool)?;
        Ok(self)
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn history(mut self, history: Arc<ChatHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn AgentListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.instructions = Some(instructions.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    pub fn max_tool_depth(mut self, max: usize) -> Self {
        self.config.max_tool_depth = max;
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.config.provider_timeout = Some(timeout);
        self
    }

    pub fn partial_on_timeout(mut self, enabled: bool) -> Self {
        self.config.partial_on_timeout = enabled;
        self
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.config.parallel_tool_calls = enabled;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;

        if self.config.max_tool_depth == 0 {
            return Err(AgentError::Config("max_tool_depth must be at least 1".into()));
        }

        let history = self
            .history
            .unwrap_or_else(|| Arc::new(ChatHistory::in_memory(DEFAULT_CONTEXT_WINDOW)));

        let agent = Agent::new(provider, self.tools, history, self.config);
        for listener in self.listeners {
            agent.observe(listener);
        }
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::testing::{call_message, LoopingTool, ScriptedProvider, SlowEchoTool};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn agent(provider: Arc<ScriptedProvider>) -> AgentBuilder {
        AgentBuilder::new().provider(provider)
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![Message::assistant("Hi there")]));
        let agent = agent(provider.clone()).instructions("Be brief.").build().unwrap();

        let answer = agent.chat(Message::user("Hello")).await.unwrap();
        assert_eq!(answer.content, "Hi there");

        let history = agent.history().all().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);

        let sent = provider.requests();
        assert_eq!(sent[0].system_prompt.as_deref(), Some("Be brief."));
        assert!(sent[0].messages.iter().all(|m| m.role != Role::System));
    }

    #[tokio::test]
    async fn test_tool_results_keep_call_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            call_message(&[("1", "slow", r#"{"text":"first"}"#), ("2", "fast", r#"{"text":"second"}"#)]),
            Message::assistant("done"),
        ]));
        let agent = agent(provider.clone())
            .tool(SlowEchoTool::new("slow", Duration::from_millis(60)))
            .unwrap()
            .tool(SlowEchoTool::new("fast", Duration::from_millis(1)))
            .unwrap()
            .build()
            .unwrap();

        let answer = agent.chat(Message::user("go")).await.unwrap();
        assert_eq!(answer.content, "done");

        let history = agent.history().all().await;
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::ToolCall, Role::ToolResult, Role::ToolResult, Role::Assistant]
        );
        assert_eq!(history[2].tool_call_id.as_deref(), Some("1"));
        assert_eq!(history[2].content, "first");
        assert_eq!(history[3].tool_call_id.as_deref(), Some("2"));

        // Second request carried the tool round
        let sent = provider.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].messages.len(), 4);
        assert_eq!(sent[1].tools.len(), 2);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let provider = Arc::new(ScriptedProvider::repeating(call_message(&[("1", "loop", "{}")])));
        let tool = LoopingTool::default();
        let invocations = tool.invocations();
        let agent = agent(provider.clone())
            .tool(tool)
            .unwrap()
            .max_tool_depth(3)
            .build()
            .unwrap();

        let err = agent.chat(Message::user("spin")).await.unwrap_err();
        assert!(matches!(err, AgentError::MaxToolDepthExceeded(3)));
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            call_message(&[("c9", "missing", "{}")]),
            Message::assistant("sorry, no such tool"),
        ]));
        let agent = agent(provider.clone()).build().unwrap();

        let answer = agent.chat(Message::user("use it")).await.unwrap();
        assert_eq!(answer.content, "sorry, no such tool");
        assert_eq!(provider.requests().len(), 2);

        let history = agent.history().all().await;
        let result = &history[2];
        assert_eq!(result.role, Role::ToolResult);
        assert_eq!(result.tool_call_id.as_deref(), Some("c9"));
        assert!(result.content.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_provider_error_aborts_turn() {
        let provider = Arc::new(ScriptedProvider::failing(AgentError::Protocol("bad".into())));
        let agent = agent(provider).build().unwrap();

        let err = agent.chat(Message::user("hi")).await.unwrap_err();
        assert!(err.is_infrastructure());
        assert_eq!(agent.history().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![Message::assistant("late")]).with_delay(Duration::from_secs(30)),
        );
        let agent = agent(provider)
            .provider_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let err = agent.chat(Message::user("hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::ProviderTimeout(d) if d == Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        assert!(matches!(
            agent(provider).max_tool_depth(0).build(),
            Err(AgentError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_runs_tool_rounds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            call_message(&[("1", "fast", r#"{"text":"x"}"#)]),
            Message::assistant("all done"),
        ]));
        let agent = agent(provider)
            .tool(SlowEchoTool::new("fast", Duration::from_millis(1)))
            .unwrap()
            .build()
            .unwrap();

        let chunks: Vec<String> = agent
            .stream(Message::user("go"))
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.concat(), "all done");

        let history = agent.history().all().await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].content, "all done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timeout_discards_partial() {
        let provider = Arc::new(ScriptedProvider::stalling_after("Hel"));
        let agent = agent(provider)
            .provider_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let items: Vec<Result<String>> = agent.stream(Message::user("hi")).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "Hel");
        assert!(matches!(items[1], Err(AgentError::ProviderTimeout(_))));
        assert_eq!(agent.history().len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timeout_keeps_partial_when_asked() {
        let provider = Arc::new(ScriptedProvider::stalling_after("Hel"));
        let agent = agent(provider)
            .provider_timeout(Duration::from_secs(5))
            .partial_on_timeout(true)
            .build()
            .unwrap();

        let items: Vec<Result<String>> = agent.stream(Message::user("hi")).collect().await;
        assert_eq!(items.len(), 1);

        let last = agent.history().last().await.unwrap();
        assert_eq!(last.content, "Hel");
        assert_eq!(last.metadata.get("partial"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn test_tool_events_are_emitted() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            call_message(&[("1", "fast", r#"{"text":"x"}"#)]),
            Message::assistant("ok"),
        ]));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let agent = agent(provider)
            .tool(SlowEchoTool::new("fast", Duration::from_millis(1)))
            .unwrap()
            .listener(Arc::new(move |event: &AgentEvent| -> anyhow::Result<()> {
                if matches!(event, AgentEvent::ToolCalled { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }))
            .build()
            .unwrap();

        agent.chat(Message::user("go")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_leaves_no_answer() {
        let provider = Arc::new(ScriptedProvider::stalling_after("Hel"));
        let agent = agent(provider.clone()).build().unwrap();

        let mut stream = agent.stream(Message::user("hi"));
        assert_eq!(stream.next().await.unwrap().unwrap(), "Hel");
        assert_eq!(provider.open_streams(), 1);

        drop(stream);
        assert_eq!(provider.open_streams(), 0);

        let history = agent.history().all().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_stream_depth_limit() {
        let provider = Arc::new(ScriptedProvider::repeating(call_message(&[("1", "loop", "{}")])));
        let tool = LoopingTool::default();
        let invocations = tool.invocations();
        let agent = agent(provider.clone())
            .tool(tool)
            .unwrap()
            .max_tool_depth(3)
            .build()
            .unwrap();

        let items: Vec<Result<String>> = agent.stream(Message::user("spin")).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AgentError::MaxToolDepthExceeded(3))));
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }
}
