//! rust-agent HTTP Server
//!
//! Axum-based server exposing the tool-calling agent and the RAG pipeline
//! over REST and WebSocket endpoints.

mod handlers;
mod state;

use std::sync::Arc;

use axum::{routing::{delete, get, post}, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{rag::{EmbeddingsProvider, MemoryVectorStore}, LlmProvider, ToolRegistry};
use agent_runtime::{
    DateTimeTool, EmbeddingsConfig, FileChatStore, KnowledgeSearchTool, OpenAiEmbeddings,
    OpenAiProvider, ProviderConfig,
};

use crate::handlers::{
    add_document_handler, chat_handler, chat_stream_handler, clear_chat_handler, health_check,
    rag_answer_handler,
};
use crate::state::{AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env();

    // Initialize LLM provider
    let provider_config = ProviderConfig::from_env()?;
    let model = provider_config.model.clone();
    let provider: Arc<dyn LlmProvider> = Arc::new(OpenAiProvider::new(provider_config)?);

    match provider.health_check().await {
        Ok(true) => tracing::info!(provider = provider.name(), model = %model, "✓ Connected to LLM provider"),
        Ok(false) | Err(_) => {
            tracing::warn!(provider = provider.name(), "⚠ LLM provider not reachable - chat requests will fail");
        }
    }

    let embeddings: Arc<dyn EmbeddingsProvider> = Arc::new(OpenAiEmbeddings::new(EmbeddingsConfig::from_env())?);
    let documents = Arc::new(MemoryVectorStore::new());

    // Initialize tools
    let tools = ToolRegistry::new();
    if provider.supports_tools() {
        tools.register(DateTimeTool)?;
        tools.register(KnowledgeSearchTool::new(
            embeddings.clone(),
            documents.clone(),
            config.rag_top_k,
        ))?;
    } else {
        tracing::warn!(provider = provider.name(), "Provider does not support tools, registering none");
    }

    tracing::info!("Registered {} tools:", tools.len());
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }

    // Chat histories
    tokio::fs::create_dir_all(&config.history_dir).await?;
    let chat_store = Arc::new(FileChatStore::new(&config.history_dir)?);
    tracing::info!(dir = %config.history_dir.display(), "Chat histories stored on disk");

    let bind_addr = config.bind_addr.clone();

    // Build application state
    let state = AppState {
        provider,
        tools: Arc::new(tools),
        chat_store,
        embeddings,
        documents,
        config: Arc::new(config),
    };

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        // Agent API
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/{conversation_id}", delete(clear_chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))
        // RAG
        .route("/api/documents", post(add_document_handler))
        .route("/api/rag/answer", post(rag_answer_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!("🚀 rust-agent server running on http://{}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health                 - Health check");
    tracing::info!("  POST   /api/chat               - Send message");
    tracing::info!("  DELETE /api/chat/:id           - Clear conversation");
    tracing::info!("  GET    /api/chat/stream        - WebSocket streaming");
    tracing::info!("  POST   /api/documents          - Add RAG document");
    tracing::info!("  POST   /api/rag/answer         - Answer with retrieved context");

    axum::serve(listener, app).await?;

    Ok(())
}
