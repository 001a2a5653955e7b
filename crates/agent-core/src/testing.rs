//! Scripted collaborators for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::{AgentError, Result};
use crate::history::ChatStore;
use crate::message::Message;
use crate::provider::{ChatRequest, LlmProvider, ProviderStream, StreamEvent};
use crate::rag::{Document, EmbeddingsProvider, VectorStore};
use crate::tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema};

/// Provider that replays canned responses and records every request
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<Message>>>,
    repeat: Option<Message>,
    stall_after: Option<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<ChatRequest>>,
    open_streams: Arc<AtomicUsize>,
}

/// Counts a stream as open until dropped
struct OpenStream(Arc<AtomicUsize>);

impl OpenStream {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Default::default()
        }
    }

    /// Answer every request with `message`
    pub fn repeating(message: Message) -> Self {
        Self {
            repeat: Some(message),
            ..Default::default()
        }
    }

    pub fn failing(error: AgentError) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from([Err(error)])),
            ..Default::default()
        }
    }

    /// Stream `text` and then never finish
    pub fn stalling_after(text: &str) -> Self {
        Self {
            stall_after: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Stalled streams handed out and not yet dropped
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    async fn next_response(&self, request: &ChatRequest) -> Result<Message> {
        self.requests.lock().unwrap().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        match (next, &self.repeat) {
            (Some(response), _) => response,
            (None, Some(message)) => Ok(message.clone()),
            (None, None) => Err(AgentError::Protocol("script exhausted".into())),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Message> {
        self.next_response(request).await
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ProviderStream> {
        if let Some(text) = &self.stall_after {
            self.requests.lock().unwrap().push(request.clone());
            let open = OpenStream::new(self.open_streams.clone());
            let text = text.clone();
            let events = async_stream::stream! {
                let _open = open;
                yield Ok::<_, AgentError>(StreamEvent::TextDelta(text));
                futures::future::pending::<()>().await;
            };
            return Ok(events.boxed());
        }

        let message = self.next_response(request).await?;
        let events = if message.is_tool_call() {
            vec![Ok(StreamEvent::ToolCalls(message))]
        } else {
            vec![
                Ok(StreamEvent::TextDelta(message.content.clone())),
                Ok(StreamEvent::Completed(message)),
            ]
        };
        Ok(futures::stream::iter(events).boxed())
    }
}

/// Tool-call message from `(id, name, arguments)` triples
pub fn call_message(calls: &[(&str, &str, &str)]) -> Message {
    let calls = calls
        .iter()
        .map(|(id, name, args)| ToolCall::parse(*id, *name, *args).unwrap())
        .collect();
    Message::tool_call("", calls)
}

/// Echoes its `text` argument after a delay
pub struct SlowEchoTool {
    name: String,
    delay: Duration,
}

impl SlowEchoTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }

    pub fn instant(name: &str) -> Self {
        Self::new(name, Duration::ZERO)
    }
}

#[async_trait]
impl Tool for SlowEchoTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: "Echo the given text".into(),
            parameters: vec![ParameterSchema::required("text", "string", "Text to echo")],
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let text = call.input_str("text").unwrap_or_default();
        Ok(ToolResult::success(&self.name, text))
    }
}

pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fail".into(),
            description: "Always fails".into(),
            parameters: vec![],
        }
    }

    async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
        Err(AgentError::Other("boom".into()))
    }
}

pub struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "panic".into(),
            description: "Always panics".into(),
            parameters: vec![],
        }
    }

    async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
        panic!("kaboom")
    }
}

/// Counts invocations; used to drive the model into a loop
#[derive(Default)]
pub struct LoopingTool {
    invocations: Arc<AtomicUsize>,
}

impl LoopingTool {
    pub fn invocations(&self) -> Arc<AtomicUsize> {
        self.invocations.clone()
    }
}

#[async_trait]
impl Tool for LoopingTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "loop".into(),
            description: "Does nothing, again".into(),
            parameters: vec![],
        }
    }

    async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ToolResult::success("loop", format!("round {}", n)))
    }
}

/// Store whose writes fail; loads always find nothing
#[derive(Default)]
pub struct FailingChatStore {
    allow_saves: bool,
}

impl FailingChatStore {
    /// Saves succeed, deletes still fail
    pub fn allowing_saves() -> Self {
        Self { allow_saves: true }
    }
}

#[async_trait]
impl ChatStore for FailingChatStore {
    async fn load(&self, _key: &str) -> Result<Option<Vec<Message>>> {
        Ok(None)
    }

    async fn save(&self, _key: &str, _messages: &[Message]) -> Result<()> {
        if self.allow_saves {
            Ok(())
        } else {
            Err(AgentError::Persistence("disk full".into()))
        }
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(AgentError::Persistence("permission denied".into()))
    }
}

/// Embeds every text to the same unit vector
pub struct ConstantEmbeddings;

#[async_trait]
impl EmbeddingsProvider for ConstantEmbeddings {
    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

/// Returns its canned documents, in order, for any query
pub struct CannedVectorStore {
    documents: Vec<Document>,
}

impl CannedVectorStore {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl VectorStore for CannedVectorStore {
    async fn add_document(&self, _document: Document) -> Result<()> {
        Ok(())
    }

    async fn similarity_search(&self, _embedding: &[f32], _k: usize) -> Result<Vec<Document>> {
        Ok(self.documents.clone())
    }
}
