//! Execution channel: correlation between dispatched calls and results
//!
//! The outbound leg is an `execute` frame on the conversation's stream; the
//! inbound leg lands here via the HTTP layer. Keyed by conversation id plus
//! correlation id, so results may arrive in any order across conversations
//! while each conversation stays strictly sequential by construction.

use crate::db::ExecOutcome;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
#[error("No pending call for correlation id: {correlation_id}")]
pub struct UnknownCorrelation {
    pub correlation_id: String,
}

/// Pending-call registry
#[derive(Default)]
pub struct ExecutionChannel {
    pending: Mutex<HashMap<(String, String), oneshot::Sender<ExecOutcome>>>,
}

impl ExecutionChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched call and get the receiver its result will
    /// arrive on. A stale entry for the same key is replaced.
    pub fn register(
        &self,
        conversation_id: &str,
        correlation_id: &str,
    ) -> oneshot::Receiver<ExecOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(key(conversation_id, correlation_id), tx);
        rx
    }

    /// Deliver a result. Each correlation id resolves at most once; a second
    /// delivery (or one arriving after a timeout cleared the entry) is
    /// rejected.
    pub fn resolve(
        &self,
        conversation_id: &str,
        correlation_id: &str,
        outcome: ExecOutcome,
    ) -> Result<(), UnknownCorrelation> {
        let sender = self
            .pending
            .lock()
            .unwrap()
            .remove(&key(conversation_id, correlation_id))
            .ok_or_else(|| UnknownCorrelation {
                correlation_id: correlation_id.to_string(),
            })?;

        // The waiter may have gone away; the result is simply dropped then.
        let _ = sender.send(outcome);
        Ok(())
    }

    /// Drop a pending entry (after a timeout expires)
    pub fn forget(&self, conversation_id: &str, correlation_id: &str) {
        self.pending
            .lock()
            .unwrap()
            .remove(&key(conversation_id, correlation_id));
    }

    /// Drop all pending entries for one conversation
    pub fn forget_conversation(&self, conversation_id: &str) {
        self.pending
            .lock()
            .unwrap()
            .retain(|(conv, _), _| conv != conversation_id);
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn key(conversation_id: &str, correlation_id: &str) -> (String, String) {
    (conversation_id.to_string(), correlation_id.to_string())
}
