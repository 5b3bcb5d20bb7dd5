//! Effects produced by state transitions

use crate::db::ExecOutcome;
use crate::llm::ContentBlock;
use crate::runtime::Frame;
use crate::state_machine::state::ToolCall;

/// Effects to be executed by the runtime after a transition.
///
/// Effects are ordered; the driver executes them in sequence, so an
/// invocation turn is always persisted before its call is dispatched, and a
/// result is appended before the next call goes out.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Forward a frame to the client stream
    Forward(Frame),

    /// Persist the completed assistant turn
    AppendAssistant { blocks: Vec<ContentBlock> },

    /// Persist a tool invocation turn
    AppendInvocation { call: ToolCall },

    /// Persist a tool result turn (and surface it to the client)
    AppendResult {
        correlation_id: String,
        outcome: ExecOutcome,
    },

    /// Send the call over the execution channel with a bounded wait
    Dispatch { call: ToolCall },

    /// Re-invoke the model with the updated history
    RequestModel,

    /// The turn is complete; emit `done`
    Complete,

    /// The turn failed; emit `error` and stop
    Abort { message: String },
}
