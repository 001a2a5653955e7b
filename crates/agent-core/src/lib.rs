//! # agent-core
//!
//! Provider-agnostic agent orchestration: message model, bounded chat
//! history, tool calling loop and a RAG pipeline on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Rag                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │  Embeddings  │──│ VectorStore  │──│  instructions      │  │
//! │  └──────────────┘  └──────────────┘  └─────────┬──────────┘  │
//! │                         Agent                  │             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌───────────▼─────────┐   │
//! │  │  Reasoning  │  │    Tools    │  │   LlmProvider       │   │
//! │  │    Loop     │──│   Registry  │──│   (Strategy)        │   │
//! │  └──────┬──────┘  └─────────────┘  └─────────────────────┘   │
//! │  ┌──────▼──────┐                                             │
//! │  │ ChatHistory │── ChatStore                                 │
//! │  └─────────────┘                                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait lets OpenAI, Mistral, Ollama or any other
//! chat-completions backend plug in without changing agent logic.
//! [`stream::assemble`] turns an SSE byte stream into [`provider::StreamEvent`]s
//! for provider implementations.

pub mod error;
pub mod events;
pub mod history;
pub mod message;
pub mod provider;
pub mod rag;
pub mod reasoning;
pub mod stream;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AgentError, Result};
pub use events::{AgentEvent, AgentListener, EventBus, TracingListener};
pub use history::{ChatHistory, ChatStore, MemoryChatStore};
pub use message::{Message, Role, Usage};
pub use provider::{ChatRequest, GenerationOptions, LlmProvider, StreamEvent};
pub use rag::{Document, EmbeddingsProvider, MemoryVectorStore, Rag, VectorStore};
pub use reasoning::{Agent, AgentBuilder, AgentConfig};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult, ToolSchema};
