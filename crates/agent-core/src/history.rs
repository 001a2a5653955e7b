//! Chat History
//!
//! Ordered, size-bounded conversation buffer. Every mutation trims the
//! buffer to the context window and is mirrored to a [`ChatStore`] before it
//! becomes visible in memory.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};

/// Default context window, in estimated tokens
pub const DEFAULT_CONTEXT_WINDOW: usize = 50_000;

/// Size of one message in the history's chosen unit
///
/// Must be deterministic for the same message.
pub type SizeEstimator = Arc<dyn Fn(&Message) -> usize + Send + Sync>;

/// Rough token estimate (~4 characters per token)
pub fn token_estimator() -> SizeEstimator {
    Arc::new(|m: &Message| m.estimate_tokens())
}

/// Character count of content plus tool call arguments
pub fn character_estimator() -> SizeEstimator {
    Arc::new(|m: &Message| {
        m.content.chars().count()
            + m.tool_calls.iter().map(|c| c.arguments.chars().count()).sum::<usize>()
    })
}

/// Backing store for chat histories
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Load the messages saved under `key`, if any
    async fn load(&self, key: &str) -> Result<Option<Vec<Message>>>;

    /// Replace the messages saved under `key`
    async fn save(&self, key: &str, messages: &[Message]) -> Result<()>;

    /// Delete the saved state; fails if nothing is stored under `key`
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory chat store (for development/testing)
#[derive(Default)]
pub struct MemoryChatStore {
    entries: StdRwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<Message>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn save(&self, key: &str, messages: &[Message]) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), messages.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| AgentError::Persistence(format!("no chat history stored under '{}'", key)))
    }
}

/// Drop messages until the retained size fits `window`
///
/// Oldest messages go first. The first system message is kept while
/// anything older than the newest message can still be dropped; the newest
/// message is never dropped. Tool results whose originating tool-call
/// message is gone are removed as well. Returns the number of dropped
/// messages.
pub fn trim_to_window(
    messages: &mut Vec<Message>,
    window: usize,
    estimator: &dyn Fn(&Message) -> usize,
) -> usize {
    let before = messages.len();
    let mut total: usize = messages.iter().map(estimator).sum();

    while total > window && messages.len() > 1 {
        let newest = messages.len() - 1;
        let system = messages.iter().position(|m| m.role == Role::System);

        let victim = (0..newest)
            .find(|i| Some(*i) != system)
            .or_else(|| system.filter(|s| *s != newest));

        let Some(victim) = victim else { break };

        if Some(victim) == system {
            tracing::warn!(window, "System message alone with newest message exceeds context window, dropping it");
        }

        total -= estimator(&messages[victim]);
        messages.remove(victim);
    }

    drop_orphaned_tool_results(messages);

    before - messages.len()
}

fn drop_orphaned_tool_results(messages: &mut Vec<Message>) {
    let Some(newest) = messages.len().checked_sub(1) else {
        return;
    };

    let mut known_calls: HashSet<String> = HashSet::new();
    let mut index = 0;
    messages.retain(|m| {
        let keep = match (m.role, &m.tool_call_id) {
            (Role::ToolResult, Some(id)) => index == newest || known_calls.contains(id),
            _ => true,
        };
        if m.role == Role::ToolCall {
            known_calls.extend(m.tool_calls.iter().map(|c| c.id.clone()));
        }
        index += 1;
        keep
    });
}

/// Conversation history bound to one store key
pub struct ChatHistory {
    key: String,
    context_window: usize,
    estimator: SizeEstimator,
    store: Arc<dyn ChatStore>,
    messages: RwLock<Vec<Message>>,
}

impl ChatHistory {
    /// Open the history saved under `key`, starting empty if there is none
    pub async fn open(
        store: Arc<dyn ChatStore>,
        key: impl Into<String>,
        context_window: usize,
    ) -> Result<Self> {
        let key = key.into();
        let messages = store.load(&key).await?.unwrap_or_default();

        tracing::debug!(key = %key, messages = messages.len(), "Opened chat history");

        Ok(Self {
            key,
            context_window,
            estimator: token_estimator(),
            store,
            messages: RwLock::new(messages),
        })
    }

    /// Empty history backed by a fresh [`MemoryChatStore`]
    pub fn in_memory(context_window: usize) -> Self {
        Self {
            key: "default".into(),
            context_window,
            estimator: token_estimator(),
            store: Arc::new(MemoryChatStore::new()),
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Use a different size estimator
    pub fn with_estimator(mut self, estimator: SizeEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Append a message, trim, and persist
    ///
    /// If the store rejects the write, the in-memory history is unchanged.
    pub async fn append(&self, message: Message) -> Result<()> {
        self.extend(vec![message]).await
    }

    /// Append several messages as one write, trimming after each
    pub async fn extend(&self, messages: Vec<Message>) -> Result<()> {
        let mut guard = self.messages.write().await;

        let mut next = guard.clone();
        let mut dropped = 0;
        for message in messages {
            next.push(message);
            dropped += trim_to_window(&mut next, self.context_window, self.estimator.as_ref());
        }

        self.store.save(&self.key, &next).await?;

        if dropped > 0 {
            tracing::debug!(key = %self.key, dropped, "Trimmed chat history to context window");
        }

        *guard = next;
        Ok(())
    }

    /// Snapshot of the retained messages
    pub async fn all(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    /// Last retained message
    pub async fn last(&self) -> Option<Message> {
        self.messages.read().await.last().cloned()
    }

    /// Delete backing state, then empty the history
    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.messages.write().await;
        self.store.delete(&self.key).await?;
        guard.clear();
        Ok(())
    }

    /// Cumulative estimated size of retained messages
    pub async fn size(&self) -> usize {
        let estimator = self.estimator.as_ref();
        self.messages.read().await.iter().map(estimator).sum()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingChatStore;
    use crate::tool::ToolCall;

    fn chars() -> SizeEstimator {
        character_estimator()
    }

    #[tokio::test]
    async fn test_trimming_keeps_newest_within_window() {
        let history = ChatHistory::in_memory(10).with_estimator(chars());

        for text in ["aaaa", "bbbb", "cccc", "dddd", "eeeeee"] {
            history.append(Message::user(text)).await.unwrap();
            assert!(history.size().await <= 10);
            assert_eq!(history.last().await.unwrap().content, text);
        }

        let contents: Vec<String> = history.all().await.into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["dddd", "eeeeee"]);
    }

    #[tokio::test]
    async fn test_oversized_message_is_retained() {
        let history = ChatHistory::in_memory(5).with_estimator(chars());
        history.append(Message::user("abc")).await.unwrap();
        history.append(Message::user("much too long")).await.unwrap();

        let all = history.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "much too long");
    }

    #[tokio::test]
    async fn test_system_message_survives_trimming() {
        let history = ChatHistory::in_memory(12).with_estimator(chars());
        history.append(Message::system("rules")).await.unwrap();
        history.append(Message::user("one")).await.unwrap();
        history.append(Message::assistant("two")).await.unwrap();
        history.append(Message::user("three")).await.unwrap();

        let all = history.all().await;
        assert_eq!(all[0].role, Role::System);
        assert_eq!(all.last().unwrap().content, "three");
        assert!(history.size().await <= 12);
    }

    #[test]
    fn test_system_dropped_only_when_newest_needs_room() {
        let mut messages = vec![Message::system("0123456789"), Message::user("abcdef")];
        let estimator = character_estimator();
        trim_to_window(&mut messages, 8, estimator.as_ref());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "abcdef");
    }

    #[test]
    fn test_orphaned_tool_results_removed() {
        let call = ToolCall::parse("c1", "echo", r#"{"text":"x"}"#).unwrap();
        let mut messages = vec![
            Message::tool_call("", vec![call]),
            Message::tool_result("c1", "echo", "x"),
            Message::user("next question here"),
        ];
        let estimator = character_estimator();
        // Only room for the user message: the call goes, so must its result
        trim_to_window(&mut messages, 20, estimator.as_ref());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let store: Arc<dyn ChatStore> = Arc::new(MemoryChatStore::new());
        let history = ChatHistory::open(store.clone(), "conv", 1000).await.unwrap();
        history.append(Message::user("hi")).await.unwrap();
        history.append(Message::assistant("hello")).await.unwrap();

        let reopened = ChatHistory::open(store, "conv", 1000).await.unwrap();
        assert_eq!(reopened.len().await, 2);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_memory_untouched() {
        let store = Arc::new(FailingChatStore::default());
        let history = ChatHistory::open(store, "conv", 1000).await.unwrap();

        let err = history.append(Message::user("hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::Persistence(_)));
        assert!(history.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear() {
        let store: Arc<dyn ChatStore> = Arc::new(MemoryChatStore::new());
        let history = ChatHistory::open(store.clone(), "conv", 1000).await.unwrap();
        history.append(Message::user("hi")).await.unwrap();

        history.clear().await.unwrap();
        assert!(history.is_empty().await);
        assert!(store.load("conv").await.unwrap().is_none());

        // Nothing left to delete
        let err = history.clear().await.unwrap_err();
        assert!(matches!(err, AgentError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_failed_clear_keeps_messages() {
        let store = Arc::new(FailingChatStore::allowing_saves());
        let history = ChatHistory::open(store, "conv", 1000).await.unwrap();
        history.append(Message::user("hi")).await.unwrap();

        assert!(history.clear().await.is_err());
        assert_eq!(history.len().await, 1);
    }
}
