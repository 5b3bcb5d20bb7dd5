//! Events that drive one turn of the tool-call loop

use crate::db::ExecOutcome;
use crate::llm::StreamEvent;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// One element of the model stream adapter's event sequence
    Model(StreamEvent),

    /// The adapter reported a terminal error (or the stream was truncated,
    /// which the loop treats identically)
    ModelError { message: String },

    /// The execution channel produced an outcome for the dispatched call.
    /// Timeouts and malformed-input failures arrive here too, as locally
    /// synthesized error outcomes.
    ToolResolved {
        correlation_id: String,
        outcome: ExecOutcome,
    },
}
