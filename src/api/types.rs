//! API request and response types

use crate::db::ExecOutcome;
use serde::{Deserialize, Serialize};

/// Request to run one conversational turn
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

/// Inbound execution-channel reply from the page
#[derive(Debug, Deserialize)]
pub struct ExecResultRequest {
    pub correlation_id: String,
    pub outcome: ExecOutcome,
}

/// Response with a list of conversations
#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<serde_json::Value>,
}

/// Response with a single conversation
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation: serde_json::Value,
}

/// Response with a conversation and its full turn sequence
#[derive(Debug, Serialize)]
pub struct ConversationWithTurnsResponse {
    pub conversation: serde_json::Value,
    pub turns: Vec<serde_json::Value>,
}

/// Response for the chat action
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub queued: bool,
}

/// Response for lifecycle and result actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
