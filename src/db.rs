//! Conversation store
//!
//! Durable mapping from conversation id to an ordered sequence of turns.
//! Append-only except for deletion of a whole conversation; the turn
//! sequence is the single source of truth for replay.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Corrupt turn content: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Create a new conversation
    pub fn create_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![id, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            id: id.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, created_at, updated_at FROM conversations WHERE id = ?1")?;

        stmt.query_row(params![id], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                created_at: parse_datetime(&row.get::<_, String>(1)?),
                updated_at: parse_datetime(&row.get::<_, String>(2)?),
            })
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// List conversations, most recently active first
    pub fn list_conversations(&self) -> DbResult<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, updated_at FROM conversations ORDER BY updated_at DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                created_at: parse_datetime(&row.get::<_, String>(1)?),
                updated_at: parse_datetime(&row.get::<_, String>(2)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Delete a conversation and all its turns
    pub fn delete_conversation(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute("DELETE FROM turns WHERE conversation_id = ?1", params![id])?;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;

        if deleted == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Turn Operations ====================

    /// Append a turn to a conversation.
    ///
    /// Sequence ids are allocated monotonically per conversation under the
    /// connection lock, so insertion order is preserved exactly on reload.
    pub fn append_turn(
        &self,
        turn_id: &str,
        conversation_id: &str,
        content: &TurnContent,
    ) -> DbResult<Turn> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        let touched = conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;
        if touched == 0 {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }

        let sequence_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM turns WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        let kind = content.kind();
        let content_str = content.to_json().to_string();

        conn.execute(
            "INSERT INTO turns (id, conversation_id, sequence_id, kind, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                turn_id,
                conversation_id,
                sequence_id,
                kind.to_string(),
                content_str,
                now.to_rfc3339(),
            ],
        )?;

        Ok(Turn {
            id: turn_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sequence_id,
            kind,
            content: content.clone(),
            created_at: now,
        })
    }

    /// Get all turns for a conversation, in insertion order
    pub fn get_turns(&self, conversation_id: &str) -> DbResult<Vec<Turn>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sequence_id, kind, content, created_at
             FROM turns WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (id, conversation_id, sequence_id, kind_str, content_str, created_at) = row?;
            let kind = TurnKind::parse(&kind_str)
                .ok_or_else(|| DbError::Corrupt(format!("unknown turn kind: {kind_str}")))?;
            let value =
                serde_json::from_str(&content_str).map_err(|e| DbError::Corrupt(e.to_string()))?;
            let content = TurnContent::from_json(kind, value).map_err(DbError::Corrupt)?;
            turns.push(Turn {
                id,
                conversation_id,
                sequence_id,
                kind,
                content,
                created_at: parse_datetime(&created_at),
            });
        }

        Ok(turns)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
