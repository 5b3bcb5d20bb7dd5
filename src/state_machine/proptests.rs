//! Property tests for the turn state machine

use super::state::TurnState;
use super::{transition, Effect, TurnEvent};
use crate::db::ExecOutcome;
use crate::llm::{ContentBlock, StopReason, StreamEvent};
use proptest::prelude::*;
use std::collections::VecDeque;

/// Drive a full model round (plus resolutions for every dispatched call)
/// through the pure machine, returning the final state and effect trace.
fn run_machine(
    events: Vec<StreamEvent>,
    mut outcomes: VecDeque<ExecOutcome>,
) -> (TurnState, Vec<Effect>) {
    let mut state = TurnState::AwaitingModel;
    let mut log = Vec::new();
    let mut queue: VecDeque<TurnEvent> = events.into_iter().map(TurnEvent::Model).collect();

    while let Some(event) = queue.pop_front() {
        let result = transition(&state, event).expect("generated sequences are always valid");
        state = result.state;
        for effect in result.effects {
            if let Effect::Dispatch { call } = &effect {
                let outcome = outcomes
                    .pop_front()
                    .unwrap_or_else(|| ExecOutcome::ok(serde_json::Value::Null));
                queue.push_back(TurnEvent::ToolResolved {
                    correlation_id: call.correlation_id.clone(),
                    outcome,
                });
            }
            log.push(effect);
        }
    }

    (state, log)
}

/// One generated tool call: (well-formed input?, error outcome?)
type CallSpec = (bool, bool);

fn round_events(text: &[String], calls: &[CallSpec]) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if !text.is_empty() {
        events.push(StreamEvent::TextStart);
        for fragment in text {
            events.push(StreamEvent::TextDelta {
                text: fragment.clone(),
            });
        }
    }
    for (i, (well_formed, _)) in calls.iter().enumerate() {
        let id = format!("toolu_{i}");
        let raw = if *well_formed {
            format!("{{\"code\":\"c{i}()\"}}")
        } else {
            "{broken".to_string()
        };
        events.push(StreamEvent::ToolStart {
            correlation_id: id.clone(),
            tool_name: "run_js".to_string(),
        });
        events.push(StreamEvent::ToolInputDelta {
            correlation_id: id.clone(),
            partial_json: raw.clone(),
        });
        events.push(StreamEvent::ToolCallReady {
            correlation_id: id,
            tool_name: "run_js".to_string(),
            raw_input: raw,
        });
    }
    events.push(StreamEvent::TurnDone {
        stop_reason: if calls.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        },
    });
    events
}

fn outcomes_for(calls: &[CallSpec]) -> VecDeque<ExecOutcome> {
    calls
        .iter()
        .map(|(_, is_error)| {
            if *is_error {
                ExecOutcome::error("simulated failure")
            } else {
                ExecOutcome::ok(serde_json::Value::Null)
            }
        })
        .collect()
}

proptest! {
    /// Every invocation gets exactly one result, results reference the
    /// invocation immediately preceding them, and call N+1 is never
    /// dispatched before call N's result is appended.
    #[test]
    fn invocations_and_results_stay_paired_and_ordered(
        text in prop::collection::vec("[a-z ]{1,8}", 0..3),
        calls in prop::collection::vec(any::<CallSpec>(), 0..4),
    ) {
        let (state, log) = run_machine(round_events(&text, &calls), outcomes_for(&calls));

        let mut invocation_ids = Vec::new();
        let mut result_ids = Vec::new();
        let mut dispatch_ids = Vec::new();
        let mut last_appended_invocation: Option<String> = None;

        for effect in &log {
            match effect {
                Effect::AppendInvocation { call } => {
                    invocation_ids.push(call.correlation_id.clone());
                    last_appended_invocation = Some(call.correlation_id.clone());
                }
                Effect::AppendResult { correlation_id, .. } => {
                    // A result always answers the most recently appended
                    // invocation.
                    prop_assert_eq!(Some(correlation_id), last_appended_invocation.as_ref());
                    result_ids.push(correlation_id.clone());
                }
                Effect::Dispatch { call } => {
                    // Dispatch N+1 requires result N already appended.
                    prop_assert_eq!(result_ids.len(), dispatch_ids.len());
                    dispatch_ids.push(call.correlation_id.clone());
                }
                _ => {}
            }
        }

        prop_assert_eq!(invocation_ids.len(), calls.len());
        prop_assert_eq!(&invocation_ids, &result_ids);
        prop_assert_eq!(&invocation_ids, &dispatch_ids);

        // Emission order is preserved.
        let expected: Vec<String> = (0..calls.len()).map(|i| format!("toolu_{i}")).collect();
        prop_assert_eq!(invocation_ids, expected);

        // The round ends in a defined place.
        if calls.is_empty() {
            prop_assert_eq!(state, TurnState::TurnComplete);
        } else {
            prop_assert_eq!(state, TurnState::AwaitingModel);
            prop_assert!(log.iter().any(|e| matches!(e, Effect::RequestModel)));
        }
    }

    /// The assistant turn is appended exactly once per non-empty round,
    /// before any invocation, with text deltas coalesced verbatim.
    #[test]
    fn assistant_turn_precedes_invocations_and_coalesces_text(
        text in prop::collection::vec("[a-z ]{1,8}", 1..4),
        calls in prop::collection::vec(any::<CallSpec>(), 0..3),
    ) {
        let (_, log) = run_machine(round_events(&text, &calls), outcomes_for(&calls));

        let assistant_positions: Vec<usize> = log
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, Effect::AppendAssistant { .. }).then_some(i))
            .collect();
        prop_assert_eq!(assistant_positions.len(), 1);

        if let Some(first_invocation) = log
            .iter()
            .position(|e| matches!(e, Effect::AppendInvocation { .. }))
        {
            prop_assert!(assistant_positions[0] < first_invocation);
        }

        let blocks = log
            .iter()
            .find_map(|e| match e {
                Effect::AppendAssistant { blocks } => Some(blocks.clone()),
                _ => None,
            })
            .unwrap();
        match &blocks[0] {
            ContentBlock::Text { text: coalesced } => {
                prop_assert_eq!(coalesced, &text.concat());
            }
            other => prop_assert!(false, "first block should be text, got {:?}", other),
        }
    }

    /// Forwarded deltas mirror the stream: every text and tool-input delta
    /// is forwarded exactly once, in order.
    #[test]
    fn deltas_are_forwarded_verbatim(
        text in prop::collection::vec("[a-z]{1,6}", 0..4),
    ) {
        let events = round_events(&text, &[]);
        let (_, log) = run_machine(events, VecDeque::new());

        let forwarded: Vec<String> = log
            .iter()
            .filter_map(|e| match e {
                Effect::Forward(crate::runtime::Frame::TextDelta { text }) => Some(text.clone()),
                _ => None,
            })
            .collect();
        prop_assert_eq!(forwarded, text);
    }
}
