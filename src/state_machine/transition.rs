//! Pure state transition function
//!
//! Given the same state and event this always produces the same result,
//! with no I/O. The runtime driver owns all side effects.

use super::state::{Draft, ToolCall, TurnState};
use super::{Effect, TurnEvent};
use crate::db::ExecOutcome;
use crate::llm::StreamEvent;
use crate::runtime::Frame;
use std::collections::VecDeque;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub state: TurnState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: TurnState) -> Self {
        Self {
            state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors for event/state combinations that have no defined transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Unexpected event in state {state}: {event}")]
    UnexpectedEvent { state: &'static str, event: String },
}

/// Pure transition function
pub fn transition(
    state: &TurnState,
    event: TurnEvent,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        (TurnState::AwaitingModel, TurnEvent::Model(ev)) => Ok(on_stream_event(Draft::new(), ev)),

        (TurnState::StreamingText { draft }, TurnEvent::Model(ev))
        | (TurnState::StreamingToolInput { draft, .. }, TurnEvent::Model(ev)) => {
            Ok(on_stream_event(draft.clone(), ev))
        }

        // A terminal adapter error with no tool call pending aborts the turn
        // without appending the partial assistant message.
        (
            TurnState::AwaitingModel
            | TurnState::StreamingText { .. }
            | TurnState::StreamingToolInput { .. },
            TurnEvent::ModelError { message },
        ) => Ok(
            TransitionResult::new(TurnState::Failed {
                message: message.clone(),
            })
            .with_effect(Effect::Abort { message }),
        ),

        (
            TurnState::AwaitingToolResult { current, remaining },
            TurnEvent::ToolResolved {
                correlation_id,
                outcome,
            },
        ) if correlation_id == current.correlation_id => {
            Ok(on_tool_resolved(&correlation_id, outcome, remaining.clone()))
        }

        (state, event) => Err(TransitionError::UnexpectedEvent {
            state: state.name(),
            event: format!("{event:?}"),
        }),
    }
}

/// Handle one adapter stream event while draining a model round
fn on_stream_event(mut draft: Draft, event: StreamEvent) -> TransitionResult {
    match event {
        StreamEvent::TextStart => {
            draft.start_text();
            TransitionResult::new(TurnState::StreamingText { draft })
                .with_effect(Effect::Forward(Frame::TextStart))
        }
        StreamEvent::TextDelta { text } => {
            draft.append_text(&text);
            TransitionResult::new(TurnState::StreamingText { draft })
                .with_effect(Effect::Forward(Frame::TextDelta { text }))
        }
        StreamEvent::ToolStart { correlation_id, .. } => {
            TransitionResult::new(TurnState::StreamingToolInput {
                draft,
                correlation_id,
            })
            .with_effect(Effect::Forward(Frame::ToolStart))
        }
        StreamEvent::ToolInputDelta {
            correlation_id,
            partial_json,
        } => TransitionResult::new(TurnState::StreamingToolInput {
            draft,
            correlation_id,
        })
        .with_effect(Effect::Forward(Frame::ToolDelta {
            partial_input: partial_json,
        })),
        StreamEvent::ToolCallReady {
            correlation_id,
            tool_name,
            raw_input,
        } => {
            draft.push_call(ToolCall::new(correlation_id, tool_name, raw_input));
            TransitionResult::new(TurnState::StreamingText { draft })
        }
        StreamEvent::TurnDone { .. } => finish_round(draft),
    }
}

/// The model round's stream is complete: persist the assistant turn, then
/// start working through the queued tool calls in strict emission order.
fn finish_round(draft: Draft) -> TransitionResult {
    let Draft { blocks, mut calls } = draft;

    let mut result = TransitionResult::new(TurnState::TurnComplete);
    if !blocks.is_empty() {
        result = result.with_effect(Effect::AppendAssistant { blocks });
    }

    if let Some(first) = calls.pop_front() {
        result
            .with_effects([
                Effect::AppendInvocation {
                    call: first.clone(),
                },
                Effect::Dispatch {
                    call: first.clone(),
                },
            ])
            .into_state(TurnState::AwaitingToolResult {
                current: first,
                remaining: calls,
            })
    } else {
        result.with_effect(Effect::Complete)
    }
}

/// A dispatched call resolved (result, timeout, or synthesized failure):
/// persist the result, then dispatch the next queued call or hand the
/// updated history back to the model.
fn on_tool_resolved(
    correlation_id: &str,
    outcome: ExecOutcome,
    mut remaining: VecDeque<ToolCall>,
) -> TransitionResult {
    let result = TransitionResult::new(TurnState::AwaitingModel).with_effect(Effect::AppendResult {
        correlation_id: correlation_id.to_string(),
        outcome,
    });

    if let Some(next) = remaining.pop_front() {
        result
            .with_effects([
                Effect::AppendInvocation { call: next.clone() },
                Effect::Dispatch { call: next.clone() },
            ])
            .into_state(TurnState::AwaitingToolResult {
                current: next,
                remaining,
            })
    } else {
        result.with_effect(Effect::RequestModel)
    }
}

impl TransitionResult {
    fn into_state(mut self, state: TurnState) -> Self {
        self.state = state;
        self
    }
}
