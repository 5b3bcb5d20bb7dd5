//! Runtime for executing conversations
//!
//! One task per active turn or replay, a broadcast frame channel per
//! conversation, and a pending-call registry shared with the HTTP layer.
//! Separate conversations proceed fully independently; within one
//! conversation a busy lock serializes replay and turns.

mod exec;
pub mod replay;
pub mod traits;
mod turn;

#[cfg(test)]
pub mod testing;

pub use exec::{ExecutionChannel, UnknownCorrelation};
pub use traits::{DatabaseStore, TurnStore};
pub use turn::TurnRunner;

use crate::db::{Database, DbError, ExecOutcome};
use crate::llm::ModelClient;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};

/// Default bounded wait for one tool dispatch (live turns and replay)
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// One frame of the outbound server→client event stream.
///
/// Transient wire-level records; never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Sent once on stream connect so a reopened client can render history
    Init {
        conversation: serde_json::Value,
        turns: Vec<serde_json::Value>,
    },
    TextStart,
    TextDelta {
        text: String,
    },
    ToolStart,
    ToolDelta {
        partial_input: String,
    },
    /// Finalized code ready for the page to run
    Execute {
        correlation_id: String,
        code: String,
    },
    /// Result surfaced back to the client after the round trip
    ToolOutput {
        correlation_id: String,
        outcome: ExecOutcome,
    },
    Error {
        message: String,
    },
    Done {
        conversation_id: String,
    },
}

impl Frame {
    /// SSE event name
    pub fn event_name(&self) -> &'static str {
        match self {
            Frame::Init { .. } => "init",
            Frame::TextStart => "text_start",
            Frame::TextDelta { .. } => "text_delta",
            Frame::ToolStart => "tool_start",
            Frame::ToolDelta { .. } => "tool_delta",
            Frame::Execute { .. } => "execute",
            Frame::ToolOutput { .. } => "tool_output",
            Frame::Error { .. } => "error",
            Frame::Done { .. } => "done",
        }
    }
}

/// Handle to one conversation's live session
#[derive(Clone)]
pub struct SessionHandle {
    pub frames: broadcast::Sender<Frame>,
    busy: Arc<Mutex<()>>,
}

/// Errors starting a turn
#[derive(Debug, Error)]
pub enum TurnStartError {
    #[error("Conversation is busy (replaying or mid-turn)")]
    Busy,
    #[error("No model configured (set ANTHROPIC_API_KEY)")]
    NoModel,
    #[error("Conversation not found: {0}")]
    NotFound(String),
    #[error("Store error: {0}")]
    Store(String),
}

/// Manager for all conversation sessions
pub struct SessionManager {
    db: Database,
    model: Option<Arc<dyn ModelClient>>,
    exec: Arc<ExecutionChannel>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    tool_timeout: Duration,
}

impl SessionManager {
    pub fn new(db: Database, model: Option<Arc<dyn ModelClient>>, tool_timeout: Duration) -> Self {
        Self {
            db,
            model,
            exec: Arc::new(ExecutionChannel::new()),
            sessions: RwLock::new(HashMap::new()),
            tool_timeout,
        }
    }

    /// Get the database handle
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Get or create the session handle for a conversation
    async fn handle(&self, conversation_id: &str) -> SessionHandle {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(conversation_id) {
                return handle.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                let (frames, _) = broadcast::channel(256);
                SessionHandle {
                    frames,
                    busy: Arc::new(Mutex::new(())),
                }
            })
            .clone()
    }

    /// Subscribe to a conversation's outbound frames
    pub async fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<Frame> {
        self.handle(conversation_id).await.frames.subscribe()
    }

    /// Rebuild the page on conversation open: re-dispatch every historical
    /// tool invocation, in order, before any live interaction.
    ///
    /// Runs in the background holding the busy lock; if the conversation is
    /// already replaying or mid-turn, this is a no-op.
    pub async fn begin_replay(&self, conversation_id: &str) {
        let handle = self.handle(conversation_id).await;
        let Ok(guard) = handle.busy.clone().try_lock_owned() else {
            tracing::debug!(conv_id = %conversation_id, "Session busy, skipping replay");
            return;
        };

        let store = DatabaseStore::new(self.db.clone());
        let exec = self.exec.clone();
        let frames = handle.frames.clone();
        let conv_id = conversation_id.to_string();
        let timeout = self.tool_timeout;

        tokio::spawn(async move {
            let _guard = guard;
            match replay::rebuild(&store, &exec, &frames, &conv_id, timeout).await {
                Ok(report) => {
                    tracing::info!(
                        conv_id = %conv_id,
                        dispatched = report.dispatched,
                        failed = report.failed,
                        "Replay finished"
                    );
                }
                Err(e) => {
                    tracing::error!(conv_id = %conv_id, error = %e, "Replay aborted");
                }
            }
        });
    }

    /// Run one conversational turn in the background.
    ///
    /// Rejected while the conversation is busy, so a turn can never
    /// interleave with a replay or another turn of the same conversation.
    pub async fn begin_turn(
        &self,
        conversation_id: &str,
        user_message: String,
    ) -> Result<(), TurnStartError> {
        let model = self.model.clone().ok_or(TurnStartError::NoModel)?;

        self.db.get_conversation(conversation_id).map_err(|e| match e {
            DbError::ConversationNotFound(id) => TurnStartError::NotFound(id),
            other => TurnStartError::Store(other.to_string()),
        })?;

        let handle = self.handle(conversation_id).await;
        let guard = handle
            .busy
            .clone()
            .try_lock_owned()
            .map_err(|_| TurnStartError::Busy)?;

        let runner = TurnRunner::new(
            DatabaseStore::new(self.db.clone()),
            model,
            self.exec.clone(),
            handle.frames.clone(),
            conversation_id.to_string(),
            self.tool_timeout,
        );

        tokio::spawn(async move {
            let _guard = guard;
            runner.run(user_message).await;
        });

        Ok(())
    }

    /// Deliver an execution result from the page to the pending call
    pub fn resolve_result(
        &self,
        conversation_id: &str,
        correlation_id: &str,
        outcome: ExecOutcome,
    ) -> Result<(), UnknownCorrelation> {
        self.exec.resolve(conversation_id, correlation_id, outcome)
    }

    /// Forget a conversation's live session (on delete)
    pub async fn drop_session(&self, conversation_id: &str) {
        self.sessions.write().await.remove(conversation_id);
        self.exec.forget_conversation(conversation_id);
    }
}
