//! HTTP/WebSocket Handlers

use std::sync::Arc;

use axum::{
    extract::{ws::{Message as WsMessage, WebSocket}, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    Json,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use agent_core::{
    rag::{Document, EmbeddingsProvider, Rag, VectorStore},
    AgentError, Message, Usage,
};

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub provider_available: bool,
    pub documents: usize,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct AddDocumentRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct AddDocumentResponse {
    pub hash: String,
    pub documents: usize,
}

#[derive(Debug, Deserialize)]
pub struct RagRequest {
    pub question: String,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RagResponse {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Whether the same request may succeed later
    pub retryable: bool,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map an agent error to a status code and user-facing body
fn api_error(error: AgentError) -> ApiError {
    let (status, code) = match &error {
        AgentError::MaxToolDepthExceeded(_) => (StatusCode::UNPROCESSABLE_ENTITY, "MAX_TOOL_DEPTH"),
        e if e.is_infrastructure() => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
        AgentError::Embeddings(_) => (StatusCode::BAD_GATEWAY, "EMBEDDINGS_ERROR"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR"),
    };

    tracing::error!(code, error = %error, "Request failed");

    (
        status,
        Json(ErrorResponse {
            error: error.user_message(),
            code: code.into(),
            retryable: error.is_retryable(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider_available = state.provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        provider: state.provider.name().to_string(),
        provider_available,
        documents: state.documents.len(),
    })
}

/// Main chat endpoint (non-streaming)
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let conversation_id = payload
        .conversation_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let agent = state
        .conversation_agent(&conversation_id)
        .await
        .map_err(api_error)?;

    let response = agent
        .chat(Message::user(payload.message))
        .await
        .map_err(api_error)?;

    Ok(Json(ChatResponse {
        message: response.content,
        conversation_id,
        usage: response.usage,
    }))
}

/// Forget a conversation
pub async fn clear_chat_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.clear_conversation(&conversation_id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Conversation '{}' not found", conversation_id),
                code: "NOT_FOUND".into(),
                retryable: false,
            }),
        )),
        Err(e) => Err(api_error(e)),
    }
}

/// Embed and store a document for RAG
pub async fn add_document_handler(
    State(state): State<AppState>,
    Json(payload): Json<AddDocumentRequest>,
) -> Result<(StatusCode, Json<AddDocumentResponse>), ApiError> {
    let document = state
        .embeddings
        .embed_document(Document::new(payload.content))
        .await
        .map_err(api_error)?;
    let hash = document.hash.clone();

    state.documents.add_document(document).await.map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(AddDocumentResponse {
            hash,
            documents: state.documents.len(),
        }),
    ))
}

/// Answer a question with retrieved context
pub async fn rag_answer_handler(
    State(state): State<AppState>,
    Json(payload): Json<RagRequest>,
) -> Result<Json<RagResponse>, ApiError> {
    let agent = state.ephemeral_agent().map_err(api_error)?;
    let rag = Rag::new(Arc::new(agent), state.embeddings.clone(), state.documents.clone());

    let k = payload.k.unwrap_or(state.config.rag_top_k);
    let answer = rag
        .answer(Message::user(payload.question), k)
        .await
        .map_err(api_error)?;

    Ok(Json(RagResponse {
        answer: answer.content,
        usage: answer.usage,
    }))
}

/// WebSocket streaming chat
pub async fn chat_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

async fn handle_stream(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        let delivered = match serde_json::from_str::<ChatRequest>(&msg) {
            Ok(request) => stream_reply(&state, request, &mut sender).await,
            Err(e) => {
                let error = serde_json::json!({"type": "error", "error": e.to_string()});
                send_frame(&mut sender, error).await
            }
        };

        if !delivered {
            break;
        }
    }
}

/// Run one streamed turn, forwarding chunks as they arrive
///
/// Returns `false` once the client has gone away; dropping the agent
/// stream then cancels the provider request.
async fn stream_reply(
    state: &AppState,
    request: ChatRequest,
    sender: &mut SplitSink<WebSocket, WsMessage>,
) -> bool {
    let conversation_id = request
        .conversation_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let agent = match state.conversation_agent(&conversation_id).await {
        Ok(agent) => agent,
        Err(e) => return send_frame(sender, error_frame(&e)).await,
    };

    let mut stream = agent.stream(Message::user(request.message));
    while let Some(chunk) = stream.next().await {
        let frame = match chunk {
            Ok(content) => serde_json::json!({"type": "chunk", "content": content}),
            Err(e) => return send_frame(sender, error_frame(&e)).await,
        };
        if !send_frame(sender, frame).await {
            return false;
        }
    }

    let done = serde_json::json!({"type": "done", "conversation_id": conversation_id});
    send_frame(sender, done).await
}

async fn send_frame(sender: &mut SplitSink<WebSocket, WsMessage>, frame: serde_json::Value) -> bool {
    sender.send(WsMessage::Text(frame.to_string().into())).await.is_ok()
}

fn error_frame(error: &AgentError) -> serde_json::Value {
    tracing::error!(error = %error, "Streaming turn failed");
    serde_json::json!({"type": "error", "error": error.user_message()})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(api_error(AgentError::MaxToolDepthExceeded(10)).0, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(api_error(AgentError::Transport("reset".into())).0, StatusCode::BAD_GATEWAY);
        assert_eq!(api_error(AgentError::Protocol("bad frame".into())).0, StatusCode::BAD_GATEWAY);

        let (_, Json(body)) = api_error(AgentError::Transport("reset".into()));
        assert!(body.retryable);
        let (_, Json(body)) = api_error(AgentError::Protocol("bad frame".into()));
        assert!(!body.retryable);
        assert_eq!(
            api_error(AgentError::Persistence("disk".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
