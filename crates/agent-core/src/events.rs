//! Lifecycle Events
//!
//! Observers subscribe to typed notifications from the agent and the RAG
//! pipeline. A failing or panicking listener is logged and skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use crate::message::Message;
use crate::rag::Document;
use crate::tool::{ToolCall, ToolResult};

/// Notification payloads
#[derive(Clone, Debug)]
pub enum AgentEvent {
    ChatStart { message: Message },
    ChatStop { message: Message },
    ToolCalling { call: ToolCall },
    ToolCalled { call: ToolCall, result: ToolResult },
    SearchStart { question: Message },
    SearchResult { question: Message, documents: Vec<Document> },
    InstructionsChanging { old: Option<String> },
    InstructionsChanged { old: Option<String>, new: String },
    AnswerStart { question: Message },
    AnswerStop { answer: Message },
}

impl AgentEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::ChatStart { .. } => "chat-start",
            AgentEvent::ChatStop { .. } => "chat-stop",
            AgentEvent::ToolCalling { .. } => "tool-calling",
            AgentEvent::ToolCalled { .. } => "tool-called",
            AgentEvent::SearchStart { .. } => "rag-vectorstore-searching",
            AgentEvent::SearchResult { .. } => "rag-vectorstore-result",
            AgentEvent::InstructionsChanging { .. } => "rag-instructions-changing",
            AgentEvent::InstructionsChanged { .. } => "rag-instructions-changed",
            AgentEvent::AnswerStart { .. } => "rag-start",
            AgentEvent::AnswerStop { .. } => "rag-stop",
        }
    }
}

/// Event observer
pub trait AgentListener: Send + Sync {
    fn on_event(&self, event: &AgentEvent) -> anyhow::Result<()>;
}

impl<F> AgentListener for F
where
    F: Fn(&AgentEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Registered listeners
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn AgentListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn AgentListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener, in subscription order
    pub fn notify(&self, event: AgentEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event = event.name(), error = %e, "Event listener failed");
                }
                Err(_) => {
                    tracing::warn!(event = event.name(), "Event listener panicked");
                }
            }
        }
    }
}

/// Forwards every event to `tracing`
pub struct TracingListener;

impl AgentListener for TracingListener {
    fn on_event(&self, event: &AgentEvent) -> anyhow::Result<()> {
        match event {
            AgentEvent::ToolCalling { call } => {
                tracing::debug!(tool = %call.name, call_id = %call.id, "{}", event.name());
            }
            AgentEvent::ToolCalled { call, result } => {
                tracing::debug!(tool = %call.name, call_id = %call.id, success = result.success, "{}", event.name());
            }
            AgentEvent::SearchResult { documents, .. } => {
                tracing::debug!(documents = documents.len(), "{}", event.name());
            }
            AgentEvent::InstructionsChanged { new, .. } => {
                tracing::debug!(chars = new.len(), "{}", event.name());
            }
            _ => tracing::debug!("{}", event.name()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_failing_listener_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(|_: &AgentEvent| -> anyhow::Result<()> {
            anyhow::bail!("listener broke")
        }));
        bus.subscribe(Arc::new(|_: &AgentEvent| -> anyhow::Result<()> {
            panic!("listener panicked")
        }));
        let counter = seen.clone();
        bus.subscribe(Arc::new(move |_: &AgentEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        bus.notify(AgentEvent::InstructionsChanging { old: None });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.len(), 3);
    }
}
