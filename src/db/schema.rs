//! Database schema and turn types

use crate::llm::ContentBlock;
pub use crate::state_machine::state::ToolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id, sequence_id);
";

/// Conversation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Turn kind, the discriminator stored alongside the content column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    UserMessage,
    AssistantMessage,
    ToolInvocation,
    ToolResult,
}

impl fmt::Display for TurnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnKind::UserMessage => write!(f, "user_message"),
            TurnKind::AssistantMessage => write!(f, "assistant_message"),
            TurnKind::ToolInvocation => write!(f, "tool_invocation"),
            TurnKind::ToolResult => write!(f, "tool_result"),
        }
    }
}

impl TurnKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_message" => Some(TurnKind::UserMessage),
            "assistant_message" => Some(TurnKind::AssistantMessage),
            "tool_invocation" => Some(TurnKind::ToolInvocation),
            "tool_result" => Some(TurnKind::ToolResult),
            _ => None,
        }
    }
}

/// Outcome reported by the execution environment for one tool call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecOutcome {
    Value {
        #[serde(default)]
        value: Value,
    },
    Error {
        message: String,
    },
}

impl ExecOutcome {
    pub fn ok(value: Value) -> Self {
        ExecOutcome::Value { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ExecOutcome::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExecOutcome::Error { .. })
    }

    /// Flatten to the text the model sees in a `tool_result` block
    pub fn as_text(&self) -> String {
        match self {
            ExecOutcome::Value { value } => match value {
                Value::String(s) => s.clone(),
                Value::Null => "ok".to_string(),
                other => other.to_string(),
            },
            ExecOutcome::Error { message } => message.clone(),
        }
    }
}

/// User message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserContent {
    pub text: String,
}

/// Tool result content; must immediately follow the invocation it answers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultContent {
    pub correlation_id: String,
    pub outcome: ExecOutcome,
}

/// Typed turn content
///
/// Stored as a JSON column with the kind held separately in the `kind`
/// column, so the two stay independently queryable.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnContent {
    User(UserContent),
    Assistant(Vec<ContentBlock>),
    Invocation(ToolCall),
    Result(ResultContent),
}

impl TurnContent {
    pub fn kind(&self) -> TurnKind {
        match self {
            Self::User(_) => TurnKind::UserMessage,
            Self::Assistant(_) => TurnKind::AssistantMessage,
            Self::Invocation(_) => TurnKind::ToolInvocation,
            Self::Result(_) => TurnKind::ToolResult,
        }
    }

    /// Serialize content to JSON value (without the kind tag)
    pub fn to_json(&self) -> Value {
        match self {
            Self::User(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            Self::Assistant(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            Self::Invocation(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            Self::Result(c) => serde_json::to_value(c).unwrap_or(Value::Null),
        }
    }

    /// Deserialize content using the kind column as discriminator
    pub fn from_json(kind: TurnKind, value: Value) -> Result<Self, String> {
        match kind {
            TurnKind::UserMessage => serde_json::from_value(value)
                .map(Self::User)
                .map_err(|e| format!("Invalid user content: {e}")),
            TurnKind::AssistantMessage => serde_json::from_value(value)
                .map(Self::Assistant)
                .map_err(|e| format!("Invalid assistant content: {e}")),
            TurnKind::ToolInvocation => serde_json::from_value(value)
                .map(Self::Invocation)
                .map_err(|e| format!("Invalid invocation content: {e}")),
            TurnKind::ToolResult => serde_json::from_value(value)
                .map(Self::Result)
                .map_err(|e| format!("Invalid result content: {e}")),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserContent { text: text.into() })
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self::Assistant(blocks)
    }

    pub fn invocation(call: ToolCall) -> Self {
        Self::Invocation(call)
    }

    pub fn result(correlation_id: impl Into<String>, outcome: ExecOutcome) -> Self {
        Self::Result(ResultContent {
            correlation_id: correlation_id.into(),
            outcome,
        })
    }
}

// Serializes the inner value only; the kind lives in its own column.
impl Serialize for TurnContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::User(c) => c.serialize(serializer),
            Self::Assistant(c) => c.serialize(serializer),
            Self::Invocation(c) => c.serialize(serializer),
            Self::Result(c) => c.serialize(serializer),
        }
    }
}

/// Turn record: one atomic persisted unit of conversation history
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub sequence_id: i64,
    pub kind: TurnKind,
    pub content: TurnContent,
    pub created_at: DateTime<Utc>,
}
