//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Network or HTTP-layer failure talking to a provider
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected frame/payload from a provider
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Provider call exceeded the caller's deadline
    #[error("Provider timed out after {0:?}")]
    ProviderTimeout(std::time::Duration),

    /// Tool not found in registry
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A tool with the same name is already registered
    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    /// Required tool parameter missing
    #[error("Invalid input for tool '{tool}': missing required parameter '{parameter}'")]
    InvalidToolInput { tool: String, parameter: String },

    /// Tool body failed
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The model kept asking for tools past the depth limit
    #[error("Maximum tool call depth ({0}) exceeded")]
    MaxToolDepthExceeded(usize),

    /// Chat history backing store failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Embeddings provider failure
    #[error("Embeddings error: {0}")]
    Embeddings(String),

    /// Vector store failure
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(_) | AgentError::ProviderTimeout(_) | AgentError::Io(_)
        )
    }

    /// Whether the model could not answer because of an infrastructure fault
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(_) | AgentError::Protocol(_) | AgentError::ProviderTimeout(_)
        )
    }

    /// Whether this error is fed back to the model as a tool result
    /// instead of aborting the turn
    pub fn is_tool_feedback(&self) -> bool {
        matches!(
            self,
            AgentError::UnknownTool(_)
                | AgentError::InvalidToolInput { .. }
                | AgentError::ToolExecution { .. }
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Transport(_) => {
                "The AI service could not be reached. Please try again.".into()
            }
            AgentError::Protocol(_) => {
                "The AI service returned a response that could not be understood.".into()
            }
            AgentError::ProviderTimeout(_) => {
                "The AI service took too long to respond. Please try again.".into()
            }
            AgentError::UnknownTool(name) => format!("The tool '{}' is not available.", name),
            AgentError::DuplicateTool(name) => format!("The tool '{}' is already registered.", name),
            AgentError::InvalidToolInput { tool, parameter } => {
                format!("The tool '{}' needs the '{}' parameter.", tool, parameter)
            }
            AgentError::ToolExecution { tool, message } => {
                format!("Tool '{}' error: {}", tool, message)
            }
            AgentError::MaxToolDepthExceeded(_) => {
                "The assistant kept calling tools without reaching an answer. Please rephrase the request.".into()
            }
            AgentError::Persistence(_) => "The conversation could not be saved.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}
