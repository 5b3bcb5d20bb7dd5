//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    ChatRequest, ChatResponse, ConversationListResponse, ConversationResponse,
    ConversationWithTurnsResponse, ErrorResponse, ExecResultRequest, SuccessResponse,
};
use super::AppState;
use crate::runtime::{Frame, TurnStartError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Conversation listing
        .route("/api/conversations", get(list_conversations))
        // Conversation creation
        .route("/api/conversations/new", post(create_conversation))
        // Conversation retrieval
        .route("/api/conversations/:id", get(get_conversation))
        // Frame streaming; opening a conversation triggers replay
        .route("/api/conversations/:id/stream", get(stream_conversation))
        // User actions
        .route("/api/conversations/:id/chat", post(send_chat))
        // Execution channel: asynchronous reply to an `execute` frame
        .route("/api/conversations/:id/result", post(post_result))
        // Lifecycle
        .route("/api/conversations/:id/delete", post(delete_conversation))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Conversation CRUD
// ============================================================

async fn list_conversations(
    State(state): State<AppState>,
) -> Result<Json<ConversationListResponse>, AppError> {
    let conversations = state
        .sessions
        .db()
        .list_conversations()
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let json_convs: Vec<Value> = conversations
        .into_iter()
        .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
        .collect();

    Ok(Json(ConversationListResponse {
        conversations: json_convs,
    }))
}

async fn create_conversation(
    State(state): State<AppState>,
) -> Result<Json<ConversationResponse>, AppError> {
    let id = uuid::Uuid::new_v4().to_string();

    let conversation = state
        .sessions
        .db()
        .create_conversation(&id)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(ConversationResponse {
        conversation: serde_json::to_value(conversation).unwrap_or(Value::Null),
    }))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationWithTurnsResponse>, AppError> {
    let conversation = state
        .sessions
        .db()
        .get_conversation(&id)
        .map_err(|e| AppError::NotFound(e.to_string()))?;

    let turns = state
        .sessions
        .db()
        .get_turns(&id)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(ConversationWithTurnsResponse {
        conversation: serde_json::to_value(&conversation).unwrap_or(Value::Null),
        turns: turns
            .iter()
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .collect(),
    }))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state
        .sessions
        .db()
        .delete_conversation(&id)
        .map_err(|e| AppError::NotFound(e.to_string()))?;

    state.sessions.drop_session(&id).await;

    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Frame Streaming
// ============================================================

/// Open a conversation: send history, then replay every historical tool
/// invocation to rebuild the page before any live interaction.
async fn stream_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let conversation = state
        .sessions
        .db()
        .get_conversation(&id)
        .map_err(|e| AppError::NotFound(e.to_string()))?;

    let turns = state
        .sessions
        .db()
        .get_turns(&id)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    // Subscribe before triggering replay so no execute frame is missed.
    let broadcast_rx = state.sessions.subscribe(&id).await;
    state.sessions.begin_replay(&id).await;

    let init_frame = Frame::Init {
        conversation: serde_json::to_value(&conversation).unwrap_or(Value::Null),
        turns: turns
            .iter()
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .collect(),
    };

    Ok(sse_stream(init_frame, broadcast_rx))
}

// ============================================================
// User Actions
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.text.is_empty() {
        return Err(AppError::BadRequest("Empty message".to_string()));
    }

    state
        .sessions
        .begin_turn(&id, req.text)
        .await
        .map_err(|e| match e {
            TurnStartError::Busy => AppError::Conflict(e.to_string()),
            TurnStartError::NoModel => AppError::Unavailable(e.to_string()),
            TurnStartError::NotFound(_) => AppError::NotFound(e.to_string()),
            TurnStartError::Store(_) => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(ChatResponse { queued: true }))
}

/// The page reports the outcome of one executed tool call. Each correlation
/// id is accepted at most once; late or duplicate deliveries get a 404.
async fn post_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecResultRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    state
        .sessions
        .resolve_result(&id, &req.correlation_id, req.outcome)
        .map_err(|e| AppError::NotFound(e.to_string()))?;

    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("mural ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
