//! Turn driver
//!
//! Runs one conversational turn: appends the user message, then repeatedly
//! invokes the model with the stored history, feeding stream events through
//! the pure state machine and executing its effects, until the model
//! produces a round with no further tool calls.

use super::exec::ExecutionChannel;
use super::traits::TurnStore;
use super::Frame;
use crate::db::{ExecOutcome, Turn, TurnContent};
use crate::llm::{ContentBlock, ModelClient, ModelMessage, ModelRequest};
use crate::state_machine::state::ToolCall;
use crate::state_machine::{transition, Effect, TurnEvent, TurnState};
use crate::system_prompt::{build_system_prompt, tool_definitions};
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const MAX_TOKENS: u32 = 8192;

/// Drives one turn of one conversation
pub struct TurnRunner<S, M>
where
    S: TurnStore + 'static,
    M: ModelClient + 'static,
{
    store: S,
    model: Arc<M>,
    exec: Arc<ExecutionChannel>,
    frames: broadcast::Sender<Frame>,
    conversation_id: String,
    tool_timeout: Duration,
    state: TurnState,
}

impl<S, M> TurnRunner<S, M>
where
    S: TurnStore + 'static,
    M: ModelClient + 'static,
{
    pub fn new(
        store: S,
        model: M,
        exec: Arc<ExecutionChannel>,
        frames: broadcast::Sender<Frame>,
        conversation_id: String,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            store,
            model: Arc::new(model),
            exec,
            frames,
            conversation_id,
            tool_timeout,
            state: TurnState::AwaitingModel,
        }
    }

    pub async fn run(mut self, user_message: String) {
        tracing::info!(conv_id = %self.conversation_id, "Starting turn");

        if !self.append(TurnContent::user(user_message)).await {
            return;
        }

        loop {
            // Each round re-reads history from the store, so the model sees
            // its own tool output and in-memory state cannot diverge from
            // what the next load will see.
            let request = match self.build_request().await {
                Ok(request) => request,
                Err(message) => {
                    self.fail(message);
                    return;
                }
            };

            let mut stream = match self.model.stream_turn(&request).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.apply(TurnEvent::ModelError {
                        message: e.to_string(),
                    })
                    .await;
                    return;
                }
            };

            while let Some(item) = stream.next().await {
                if self.client_gone() {
                    // Stop forwarding; dropping the stream cancels the
                    // provider call. Nothing from this round has been
                    // appended yet.
                    tracing::info!(conv_id = %self.conversation_id, "Client disconnected mid-stream, cancelling turn");
                    return;
                }

                let event = match item {
                    Ok(stream_event) => TurnEvent::Model(stream_event),
                    Err(e) => TurnEvent::ModelError {
                        message: e.to_string(),
                    },
                };

                if !self.apply(event).await {
                    return;
                }

                if self.state.is_terminal() {
                    return;
                }
                if matches!(self.state, TurnState::AwaitingModel) {
                    break;
                }
            }

            match &self.state {
                // Tool results appended; invoke the model again, unless
                // the client went away while we were executing tools.
                TurnState::AwaitingModel => {
                    if self.client_gone() {
                        tracing::info!(conv_id = %self.conversation_id, "Client disconnected, not re-invoking model");
                        return;
                    }
                }
                TurnState::TurnComplete | TurnState::Failed { .. } => return,
                // The stream ended without a turn_done: a connection drop is
                // treated identically to an explicit error event.
                _ => {
                    self.apply(TurnEvent::ModelError {
                        message: "Model stream ended before the turn completed".to_string(),
                    })
                    .await;
                    return;
                }
            }
        }
    }

    /// Feed one event through the state machine and execute its effects.
    /// Dispatch effects produce follow-up events processed in the same call.
    /// Returns false when the turn must stop (store failure).
    async fn apply(&mut self, event: TurnEvent) -> bool {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let result = match transition(&self.state, event) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(conv_id = %self.conversation_id, error = %e, "Ignoring turn event");
                    continue;
                }
            };
            self.state = result.state;

            for effect in result.effects {
                match effect {
                    Effect::Forward(frame) => self.send(frame),
                    Effect::AppendAssistant { blocks } => {
                        if !self.append(TurnContent::assistant(blocks)).await {
                            return false;
                        }
                    }
                    Effect::AppendInvocation { call } => {
                        if !self.append(TurnContent::invocation(call)).await {
                            return false;
                        }
                    }
                    Effect::AppendResult {
                        correlation_id,
                        outcome,
                    } => {
                        let content = TurnContent::result(&correlation_id, outcome.clone());
                        if !self.append(content).await {
                            return false;
                        }
                        self.send(Frame::ToolOutput {
                            correlation_id,
                            outcome,
                        });
                    }
                    Effect::Dispatch { call } => {
                        let outcome = self.dispatch(&call).await;
                        queue.push_back(TurnEvent::ToolResolved {
                            correlation_id: call.correlation_id,
                            outcome,
                        });
                    }
                    // The outer loop reacts to the AwaitingModel state.
                    Effect::RequestModel => {}
                    Effect::Complete => {
                        self.send(Frame::Done {
                            conversation_id: self.conversation_id.clone(),
                        });
                    }
                    Effect::Abort { message } => {
                        tracing::error!(conv_id = %self.conversation_id, error = %message, "Turn failed");
                        self.send(Frame::Error { message });
                    }
                }
            }
        }

        true
    }

    /// Send the call to the page and wait (bounded) for the correlated
    /// result. Every failure mode comes back as an error outcome the model
    /// can react to.
    async fn dispatch(&self, call: &ToolCall) -> ExecOutcome {
        let input = match call.parse_input() {
            Ok(input) => input,
            Err(message) => {
                tracing::warn!(
                    conv_id = %self.conversation_id,
                    correlation_id = %call.correlation_id,
                    error = %message,
                    "Tool call not dispatchable"
                );
                return ExecOutcome::error(message);
            }
        };

        let rx = self.exec.register(&self.conversation_id, &call.correlation_id);
        self.send(Frame::Execute {
            correlation_id: call.correlation_id.clone(),
            code: input.code,
        });

        match tokio::time::timeout(self.tool_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ExecOutcome::error("Execution channel closed before a result arrived"),
            Err(_) => {
                self.exec.forget(&self.conversation_id, &call.correlation_id);
                ExecOutcome::error(format!(
                    "No result within {}s",
                    self.tool_timeout.as_secs()
                ))
            }
        }
    }

    async fn build_request(&self) -> Result<ModelRequest, String> {
        let turns = self.store.turns(&self.conversation_id).await?;
        Ok(ModelRequest {
            system: build_system_prompt(),
            messages: build_messages(&turns),
            tools: tool_definitions(),
            max_tokens: MAX_TOKENS,
        })
    }

    /// Append a turn; a store failure is fatal for the turn and surfaced as
    /// an error frame.
    async fn append(&mut self, content: TurnContent) -> bool {
        match self.store.append_turn(&self.conversation_id, &content).await {
            Ok(_) => true,
            Err(e) => {
                self.fail(format!("Failed to persist turn: {e}"));
                false
            }
        }
    }

    fn fail(&mut self, message: String) {
        tracing::error!(conv_id = %self.conversation_id, error = %message, "Turn failed");
        self.send(Frame::Error {
            message: message.clone(),
        });
        self.state = TurnState::Failed { message };
    }

    fn send(&self, frame: Frame) {
        let _ = self.frames.send(frame);
    }

    fn client_gone(&self) -> bool {
        self.frames.receiver_count() == 0
    }
}

/// Project the persisted turn sequence into provider messages.
///
/// Assistant turns already carry their tool_use blocks, so invocation turns
/// contribute nothing here; result turns become tool_result blocks in a
/// user message, consecutive ones merged. An invocation with no recorded
/// result (interrupted turn) gets a placeholder result so the history stays
/// well-formed for the provider.
pub(crate) fn build_messages(turns: &[Turn]) -> Vec<ModelMessage> {
    let resolved: HashSet<&str> = turns
        .iter()
        .filter_map(|t| match &t.content {
            TurnContent::Result(r) => Some(r.correlation_id.as_str()),
            _ => None,
        })
        .collect();

    let mut messages: Vec<ModelMessage> = Vec::new();
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    for turn in turns {
        match &turn.content {
            TurnContent::Result(result) => {
                pending_results.push(ContentBlock::tool_result(
                    &result.correlation_id,
                    result.outcome.as_text(),
                    result.outcome.is_error(),
                ));
            }
            TurnContent::User(user) => {
                flush_results(&mut messages, &mut pending_results);
                messages.push(ModelMessage::user(vec![ContentBlock::text(&user.text)]));
            }
            TurnContent::Assistant(blocks) => {
                flush_results(&mut messages, &mut pending_results);
                messages.push(ModelMessage::assistant(blocks.clone()));

                for block in blocks {
                    if let ContentBlock::ToolUse { id, .. } = block {
                        if !resolved.contains(id.as_str()) {
                            pending_results.push(ContentBlock::tool_result(
                                id,
                                "No result recorded (execution was interrupted)",
                                false,
                            ));
                        }
                    }
                }
            }
            TurnContent::Invocation(_) => {}
        }
    }
    flush_results(&mut messages, &mut pending_results);

    messages
}

fn flush_results(messages: &mut Vec<ModelMessage>, pending: &mut Vec<ContentBlock>) {
    if !pending.is_empty() {
        messages.push(ModelMessage::user(std::mem::take(pending)));
    }
}
