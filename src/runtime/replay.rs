//! Replay engine
//!
//! Rebuilds the browser page's state when a conversation is reopened: every
//! historical tool invocation is re-dispatched to the page, in order, each
//! one awaited before the next since later invocations may depend on the
//! effects of earlier ones. The model is never consulted and nothing is
//! appended to the store; page state is a pure function of the persisted
//! turn sequence.

use super::exec::ExecutionChannel;
use super::traits::TurnStore;
use super::Frame;
use crate::db::{Turn, TurnContent};
use crate::state_machine::state::ToolCall;
use std::time::Duration;
use tokio::sync::broadcast;

/// What a replay pass did
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayReport {
    pub dispatched: usize,
    pub failed: usize,
}

/// Re-dispatch all historical tool invocations for a conversation.
///
/// Failures (malformed input, error outcomes, timeouts) are logged and
/// replay continues: later invocations may be independent of the failed
/// one, and the user should see as much reconstructed state as possible.
pub async fn rebuild<S: TurnStore>(
    store: &S,
    exec: &ExecutionChannel,
    frames: &broadcast::Sender<Frame>,
    conversation_id: &str,
    tool_timeout: Duration,
) -> Result<ReplayReport, String> {
    let turns = store.turns(conversation_id).await?;
    let mut report = ReplayReport::default();

    for call in invocations(&turns) {
        let input = match call.parse_input() {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(
                    conv_id = %conversation_id,
                    correlation_id = %call.correlation_id,
                    error = %e,
                    "Skipping unreplayable invocation"
                );
                report.failed += 1;
                continue;
            }
        };

        let rx = exec.register(conversation_id, &call.correlation_id);
        let _ = frames.send(Frame::Execute {
            correlation_id: call.correlation_id.clone(),
            code: input.code,
        });
        report.dispatched += 1;

        // The outcome itself is discarded: the goal is reconstruction, not
        // correctness checking. But each dispatch must finish before the
        // next one goes out.
        match tokio::time::timeout(tool_timeout, rx).await {
            Ok(Ok(outcome)) => {
                if outcome.is_error() {
                    tracing::warn!(
                        conv_id = %conversation_id,
                        correlation_id = %call.correlation_id,
                        "Replay dispatch reported an error, continuing"
                    );
                    report.failed += 1;
                }
            }
            Ok(Err(_)) => {
                tracing::warn!(
                    conv_id = %conversation_id,
                    correlation_id = %call.correlation_id,
                    "Execution channel closed during replay, continuing"
                );
                report.failed += 1;
            }
            Err(_) => {
                exec.forget(conversation_id, &call.correlation_id);
                tracing::warn!(
                    conv_id = %conversation_id,
                    correlation_id = %call.correlation_id,
                    "Replay dispatch timed out, continuing"
                );
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// The replay plan: every tool invocation, in insertion order.
///
/// Pure: the same turn sequence always yields the same plan, which is what
/// makes replay idempotent. An invocation with no corresponding result
/// (interrupted turn) is still included.
pub(crate) fn invocations(turns: &[Turn]) -> Vec<&ToolCall> {
    turns
        .iter()
        .filter_map(|turn| match &turn.content {
            TurnContent::Invocation(call) => Some(call),
            _ => None,
        })
        .collect()
}
