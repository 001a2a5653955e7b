//! # agent-runtime
//!
//! Concrete collaborators for agent-core.
//!
//! ## Providers
//!
//! - **OpenAI** (default): chat completions with streaming and tool calls
//! - **Mistral**: same wire format, no tool definitions
//! - **Ollama**: local inference through the `/v1` compatibility endpoint
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{OpenAiProvider, ProviderConfig};
//!
//! let provider = OpenAiProvider::new(ProviderConfig::ollama("llama3.2"))?;
//! let agent = AgentBuilder::new()
//!     .provider(Arc::new(provider))
//!     .build()?;
//! ```

pub mod embeddings;
pub mod file_history;
pub mod openai;
pub mod tools;
pub mod transport;

pub use embeddings::{EmbeddingsConfig, OpenAiEmbeddings};
pub use file_history::FileChatStore;
pub use openai::{OpenAiProvider, ProviderConfig};
pub use tools::{DateTimeTool, KnowledgeSearchTool};
pub use transport::{HttpTransport, Transport};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentBuilder, AgentError, ChatHistory, LlmProvider, Message, Rag, Result, Role, Tool,
    ToolRegistry,
};
