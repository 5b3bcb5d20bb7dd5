//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the turn driver and replay engine with mock
//! implementations.

use crate::db::{Database, Turn, TurnContent};
use async_trait::async_trait;
use std::sync::Arc;

/// Storage for conversation turns
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Append a turn to the conversation
    async fn append_turn(
        &self,
        conversation_id: &str,
        content: &TurnContent,
    ) -> Result<Turn, String>;

    /// Get all turns for a conversation, in insertion order
    async fn turns(&self, conversation_id: &str) -> Result<Vec<Turn>, String>;
}

#[async_trait]
impl<T: TurnStore + ?Sized> TurnStore for Arc<T> {
    async fn append_turn(
        &self,
        conversation_id: &str,
        content: &TurnContent,
    ) -> Result<Turn, String> {
        (**self).append_turn(conversation_id, content).await
    }

    async fn turns(&self, conversation_id: &str) -> Result<Vec<Turn>, String> {
        (**self).turns(conversation_id).await
    }
}

// ============================================================
// Production Adapter
// ============================================================

/// Adapter to use Database as a TurnStore
#[derive(Clone)]
pub struct DatabaseStore {
    db: Database,
}

impl DatabaseStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TurnStore for DatabaseStore {
    async fn append_turn(
        &self,
        conversation_id: &str,
        content: &TurnContent,
    ) -> Result<Turn, String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .append_turn(&id, conversation_id, content)
            .map_err(|e| e.to_string())
    }

    async fn turns(&self, conversation_id: &str) -> Result<Vec<Turn>, String> {
        self.db.get_turns(conversation_id).map_err(|e| e.to_string())
    }
}
