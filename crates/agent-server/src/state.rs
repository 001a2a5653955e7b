//! Application State

use std::path::PathBuf;
use std::sync::Arc;

use agent_core::{
    history::{ChatHistory, ChatStore},
    rag::{EmbeddingsProvider, MemoryVectorStore},
    reasoning::{Agent, AgentBuilder, DEFAULT_MAX_TOOL_DEPTH},
    LlmProvider, Result, ToolRegistry, TracingListener,
};

/// Server settings read from the environment
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub history_dir: PathBuf,
    pub context_window: usize,
    pub max_tool_depth: usize,
    pub rag_top_k: usize,
    pub instructions: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            history_dir: std::env::var("CHAT_HISTORY_DIR")
                .unwrap_or_else(|_| "data/chats".into())
                .into(),
            context_window: parsed("CONTEXT_WINDOW", agent_core::history::DEFAULT_CONTEXT_WINDOW),
            max_tool_depth: parsed("MAX_TOOL_DEPTH", DEFAULT_MAX_TOOL_DEPTH),
            rag_top_k: parsed("RAG_TOP_K", 4),
            instructions: std::env::var("SYSTEM_PROMPT").ok(),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// LLM provider (OpenAI, Mistral, Ollama)
    pub provider: Arc<dyn LlmProvider>,

    /// Tool registry shared by every agent
    pub tools: Arc<ToolRegistry>,

    /// Where conversation histories live
    pub chat_store: Arc<dyn ChatStore>,

    pub embeddings: Arc<dyn EmbeddingsProvider>,

    /// Documents available to RAG answers
    pub documents: Arc<MemoryVectorStore>,

    pub config: Arc<ServerConfig>,
}

impl AppState {
    fn builder(&self, history: Arc<ChatHistory>) -> AgentBuilder {
        let builder = AgentBuilder::new()
            .provider(self.provider.clone())
            .tools(self.tools.clone())
            .history(history)
            .max_tool_depth(self.config.max_tool_depth)
            .listener(Arc::new(TracingListener));

        match &self.config.instructions {
            Some(instructions) => builder.instructions(instructions.clone()),
            None => builder,
        }
    }

    /// Agent bound to the stored history of `conversation_id`
    pub async fn conversation_agent(&self, conversation_id: &str) -> Result<Agent> {
        let history = ChatHistory::open(
            self.chat_store.clone(),
            conversation_id,
            self.config.context_window,
        )
        .await?;

        self.builder(Arc::new(history)).build()
    }

    /// Agent with a throwaway history
    pub fn ephemeral_agent(&self) -> Result<Agent> {
        let history = ChatHistory::in_memory(self.config.context_window);
        self.builder(Arc::new(history)).build()
    }

    /// Remove the stored history of `conversation_id`; `false` if there was none
    pub async fn clear_conversation(&self, conversation_id: &str) -> Result<bool> {
        if self.chat_store.load(conversation_id).await?.is_none() {
            return Ok(false);
        }
        self.chat_store.delete(conversation_id).await?;
        Ok(true)
    }
}
