//! Test doubles for the runtime
//!
//! A scripted model client, an in-memory turn store, and a fake browser
//! page that answers `execute` frames, so turns and replays run through the
//! real driver without network or disk I/O.

use super::exec::ExecutionChannel;
use super::traits::TurnStore;
use super::{Frame, TurnRunner};
use crate::db::{ExecOutcome, Turn, TurnContent};
use crate::llm::{
    EventStream, ModelClient, ModelRequest, ProviderError, StopReason, StreamEvent,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================
// Scripted Model Client
// ============================================================

/// Model client that plays back queued event scripts, one per turn
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Result<StreamEvent, ProviderError>>>>,
    /// Record of all requests made
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue the event script for the next model turn
    pub fn script(&self, events: Vec<Result<StreamEvent, ProviderError>>) {
        self.scripts.lock().unwrap().push_back(events);
    }

    pub fn recorded_requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn stream_turn(&self, request: &ModelRequest) -> Result<EventStream, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::unknown("No scripted turn queued"))?;
        Ok(Box::pin(futures::stream::iter(script)))
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }
}

/// Script for a text-only model turn
pub fn text_turn(text: &str) -> Vec<Result<StreamEvent, ProviderError>> {
    vec![
        Ok(StreamEvent::TextStart),
        Ok(StreamEvent::TextDelta {
            text: text.to_string(),
        }),
        Ok(StreamEvent::TurnDone {
            stop_reason: StopReason::EndTurn,
        }),
    ]
}

/// Script for a model turn declaring tool calls: optional leading text, then
/// one `run_js` call per `(correlation_id, code)` pair
pub fn tool_turn(
    text: Option<&str>,
    calls: &[(&str, &str)],
) -> Vec<Result<StreamEvent, ProviderError>> {
    let mut events = Vec::new();
    if let Some(text) = text {
        events.push(Ok(StreamEvent::TextStart));
        events.push(Ok(StreamEvent::TextDelta {
            text: text.to_string(),
        }));
    }
    for (id, code) in calls {
        let raw = serde_json::json!({ "code": code }).to_string();
        events.push(Ok(StreamEvent::ToolStart {
            correlation_id: (*id).to_string(),
            tool_name: "run_js".to_string(),
        }));
        events.push(Ok(StreamEvent::ToolInputDelta {
            correlation_id: (*id).to_string(),
            partial_json: raw.clone(),
        }));
        events.push(Ok(StreamEvent::ToolCallReady {
            correlation_id: (*id).to_string(),
            tool_name: "run_js".to_string(),
            raw_input: raw,
        }));
    }
    events.push(Ok(StreamEvent::TurnDone {
        stop_reason: StopReason::ToolUse,
    }));
    events
}

/// Script for a model turn that produces nothing and ends
pub fn empty_turn() -> Vec<Result<StreamEvent, ProviderError>> {
    vec![Ok(StreamEvent::TurnDone {
        stop_reason: StopReason::EndTurn,
    })]
}

// ============================================================
// In-Memory Turn Store
// ============================================================

/// In-memory store for testing
pub struct MemoryStore {
    turns: Mutex<HashMap<String, Vec<Turn>>>,
    fail_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(HashMap::new()),
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Make subsequent appends fail (store-error paths)
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn all(&self, conversation_id: &str) -> Vec<Turn> {
        self.turns
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn seed(&self, conversation_id: &str, contents: Vec<TurnContent>) {
        for content in contents {
            self.push(conversation_id, &content);
        }
    }

    fn push(&self, conversation_id: &str, content: &TurnContent) -> Turn {
        let mut turns = self.turns.lock().unwrap();
        let list = turns.entry(conversation_id.to_string()).or_default();
        #[allow(clippy::cast_possible_wrap)]
        let sequence_id = list.len() as i64 + 1;
        let turn = Turn {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sequence_id,
            kind: content.kind(),
            content: content.clone(),
            created_at: Utc::now(),
        };
        list.push(turn.clone());
        turn
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TurnStore for MemoryStore {
    async fn append_turn(
        &self,
        conversation_id: &str,
        content: &TurnContent,
    ) -> Result<Turn, String> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err("store unavailable".to_string());
        }
        Ok(self.push(conversation_id, content))
    }

    async fn turns(&self, conversation_id: &str) -> Result<Vec<Turn>, String> {
        Ok(self.all(conversation_id))
    }
}

// ============================================================
// Fake Browser Page
// ============================================================

/// Spawn a task that plays the browser's part: records every `execute`
/// frame's code and posts back the outcome `respond` chooses for it.
/// Returns the shared execution log.
pub fn spawn_page<F>(
    mut rx: broadcast::Receiver<Frame>,
    exec: Arc<ExecutionChannel>,
    conversation_id: &str,
    respond: F,
) -> Arc<Mutex<Vec<String>>>
where
    F: Fn(&str) -> ExecOutcome + Send + 'static,
{
    let log = Arc::new(Mutex::new(Vec::new()));
    let task_log = log.clone();
    let conversation_id = conversation_id.to_string();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Frame::Execute {
                    correlation_id,
                    code,
                }) => {
                    task_log.lock().unwrap().push(code.clone());
                    let outcome = respond(&code);
                    let _ = exec.resolve(&conversation_id, &correlation_id, outcome);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    log
}

/// Spawn a task collecting every frame sent on the channel
pub fn collect_frames(mut rx: broadcast::Receiver<Frame>) -> Arc<Mutex<Vec<Frame>>> {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let task_frames = frames.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => task_frames.lock().unwrap().push(frame),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    frames
}

// ============================================================
// Test Harness
// ============================================================

const CONV: &str = "conv-1";
const FAST_TIMEOUT: Duration = Duration::from_millis(100);

/// Everything a driver-level test needs, wired together
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub model: Arc<ScriptedModel>,
    pub exec: Arc<ExecutionChannel>,
    pub frames: broadcast::Sender<Frame>,
}

impl TestHarness {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(256);
        Self {
            store: Arc::new(MemoryStore::new()),
            model: Arc::new(ScriptedModel::new()),
            exec: Arc::new(ExecutionChannel::new()),
            frames,
        }
    }

    pub fn runner(&self, timeout: Duration) -> TurnRunner<Arc<MemoryStore>, Arc<ScriptedModel>> {
        TurnRunner::new(
            self.store.clone(),
            self.model.clone(),
            self.exec.clone(),
            self.frames.clone(),
            CONV.to_string(),
            timeout,
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TurnKind;
    use crate::llm::ContentBlock;
    use crate::runtime::replay::rebuild;
    use serde_json::json;

    fn kinds(turns: &[Turn]) -> Vec<TurnKind> {
        turns.iter().map(|t| t.kind).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_text_only_turn() {
        let h = TestHarness::new();
        h.model.script(text_turn("Hello!"));
        let frames = collect_frames(h.frames.subscribe());

        h.runner(FAST_TIMEOUT).run("Hi".to_string()).await;
        settle().await;

        let turns = h.store.all(CONV);
        assert_eq!(
            kinds(&turns),
            vec![TurnKind::UserMessage, TurnKind::AssistantMessage]
        );

        let frames = frames.lock().unwrap();
        assert!(frames.iter().any(|f| matches!(f, Frame::TextStart)));
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::TextDelta { text } if text == "Hello!")));
        assert!(frames.iter().any(|f| matches!(f, Frame::Done { .. })));
    }

    /// End-to-end: "draw a red square" produces exactly four turns, and
    /// reopening the conversation re-dispatches the code exactly once.
    #[tokio::test]
    async fn test_end_to_end_square_then_replay() {
        let h = TestHarness::new();
        h.model.script(tool_turn(
            Some("Sure, here's a square:"),
            &[("toolu_1", "drawSquare()")],
        ));
        h.model.script(empty_turn());
        let page = spawn_page(h.frames.subscribe(), h.exec.clone(), CONV, |_| {
            ExecOutcome::ok(json!("ok"))
        });

        h.runner(FAST_TIMEOUT)
            .run("draw a red square".to_string())
            .await;
        settle().await;

        let turns = h.store.all(CONV);
        assert_eq!(
            kinds(&turns),
            vec![
                TurnKind::UserMessage,
                TurnKind::AssistantMessage,
                TurnKind::ToolInvocation,
                TurnKind::ToolResult,
            ]
        );
        match (&turns[2].content, &turns[3].content) {
            (TurnContent::Invocation(call), TurnContent::Result(result)) => {
                assert_eq!(call.correlation_id, "toolu_1");
                assert_eq!(result.correlation_id, "toolu_1");
                assert!(!result.outcome.is_error());
            }
            other => panic!("Unexpected turn contents: {other:?}"),
        }
        assert_eq!(page.lock().unwrap().clone(), vec!["drawSquare()"]);

        // Reopen on a fresh page: the historical call replays exactly once.
        let (replay_tx, _) = broadcast::channel(64);
        let fresh_page = spawn_page(replay_tx.subscribe(), h.exec.clone(), CONV, |_| {
            ExecOutcome::ok(json!(null))
        });
        let report = rebuild(&h.store, &h.exec, &replay_tx, CONV, FAST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(fresh_page.lock().unwrap().clone(), vec!["drawSquare()"]);

        // Replaying again dispatches the same sequence: replay is a pure
        // function of history.
        let (again_tx, _) = broadcast::channel(64);
        let again_page = spawn_page(again_tx.subscribe(), h.exec.clone(), CONV, |_| {
            ExecOutcome::ok(json!(null))
        });
        let report = rebuild(&h.store, &h.exec, &again_tx, CONV, FAST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(again_page.lock().unwrap().clone(), vec!["drawSquare()"]);

        // Nothing new was appended by replay.
        assert_eq!(h.store.all(CONV).len(), 4);
    }

    /// Two calls in one model turn: A is fully resolved (result appended)
    /// before B is dispatched.
    #[tokio::test]
    async fn test_second_call_dispatched_after_first_resolves() {
        let h = TestHarness::new();
        h.model
            .script(tool_turn(None, &[("toolu_a", "a()"), ("toolu_b", "b()")]));
        h.model.script(empty_turn());
        let page = spawn_page(h.frames.subscribe(), h.exec.clone(), CONV, |_| {
            ExecOutcome::ok(json!(null))
        });
        let frames = collect_frames(h.frames.subscribe());

        h.runner(FAST_TIMEOUT).run("two".to_string()).await;
        settle().await;

        assert_eq!(page.lock().unwrap().clone(), vec!["a()", "b()"]);

        let turns = h.store.all(CONV);
        assert_eq!(
            kinds(&turns),
            vec![
                TurnKind::UserMessage,
                TurnKind::AssistantMessage,
                TurnKind::ToolInvocation,
                TurnKind::ToolResult,
                TurnKind::ToolInvocation,
                TurnKind::ToolResult,
            ]
        );

        // On the wire: execute(a) .. tool_output(a) .. execute(b)
        let frames = frames.lock().unwrap();
        let index_of = |pred: &dyn Fn(&Frame) -> bool| frames.iter().position(|f| pred(f)).unwrap();
        let exec_a = index_of(&|f| {
            matches!(f, Frame::Execute { correlation_id, .. } if correlation_id == "toolu_a")
        });
        let output_a = index_of(&|f| {
            matches!(f, Frame::ToolOutput { correlation_id, .. } if correlation_id == "toolu_a")
        });
        let exec_b = index_of(&|f| {
            matches!(f, Frame::Execute { correlation_id, .. } if correlation_id == "toolu_b")
        });
        assert!(exec_a < output_a && output_a < exec_b);
    }

    /// A timed-out call produces exactly one synthetic error result and the
    /// loop proceeds instead of hanging.
    #[tokio::test]
    async fn test_timeout_synthesizes_error_result() {
        let h = TestHarness::new();
        h.model.script(tool_turn(None, &[("toolu_1", "hang()")]));
        h.model.script(text_turn("That didn't work."));
        let frames = collect_frames(h.frames.subscribe());

        // No page is listening, so the dispatch can only time out.
        h.runner(Duration::from_millis(50))
            .run("hang".to_string())
            .await;
        settle().await;

        let turns = h.store.all(CONV);
        assert_eq!(
            kinds(&turns),
            vec![
                TurnKind::UserMessage,
                TurnKind::AssistantMessage,
                TurnKind::ToolInvocation,
                TurnKind::ToolResult,
                TurnKind::AssistantMessage,
            ]
        );

        let error_results: Vec<_> = turns
            .iter()
            .filter_map(|t| match &t.content {
                TurnContent::Result(r) if r.outcome.is_error() => Some(r.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(error_results.len(), 1);
        assert!(error_results[0].outcome.as_text().contains("No result"));

        // The turn completed; the pending entry was cleaned up.
        assert!(frames
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, Frame::Done { .. })));
        assert_eq!(h.exec.pending_count(), 0);
        assert_eq!(h.model.recorded_requests().len(), 2);
    }

    /// A provider failure mid-stream aborts the turn without appending a
    /// partial assistant message.
    #[tokio::test]
    async fn test_provider_error_aborts_without_partial_append() {
        let h = TestHarness::new();
        h.model.script(vec![
            Ok(StreamEvent::TextStart),
            Ok(StreamEvent::TextDelta {
                text: "partial".to_string(),
            }),
            Err(ProviderError::server("upstream blew up")),
        ]);
        let frames = collect_frames(h.frames.subscribe());

        h.runner(FAST_TIMEOUT).run("hi".to_string()).await;
        settle().await;

        assert_eq!(kinds(&h.store.all(CONV)), vec![TurnKind::UserMessage]);
        assert!(frames
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, Frame::Error { message } if message.contains("blew up"))));
    }

    /// A request-level provider failure behaves the same way.
    #[tokio::test]
    async fn test_request_failure_surfaces_error_frame() {
        let h = TestHarness::new();
        // No script queued: stream_turn itself errors.
        let frames = collect_frames(h.frames.subscribe());

        h.runner(FAST_TIMEOUT).run("hi".to_string()).await;
        settle().await;

        assert_eq!(kinds(&h.store.all(CONV)), vec![TurnKind::UserMessage]);
        assert!(frames
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, Frame::Error { .. })));
    }

    /// An execution failure in the page is not fatal: it is recorded as a
    /// normal error result and fed back to the model.
    #[tokio::test]
    async fn test_execution_error_fed_back_to_model() {
        let h = TestHarness::new();
        h.model.script(tool_turn(None, &[("toolu_1", "oops()")]));
        h.model.script(text_turn("Let me fix that."));
        let _page = spawn_page(h.frames.subscribe(), h.exec.clone(), CONV, |_| {
            ExecOutcome::error("ReferenceError: oops is not defined")
        });

        h.runner(FAST_TIMEOUT).run("go".to_string()).await;
        settle().await;

        let requests = h.model.recorded_requests();
        assert_eq!(requests.len(), 2);
        let followup = requests[1].messages.last().unwrap();
        assert!(followup.content.iter().any(|block| matches!(
            block,
            ContentBlock::ToolResult { is_error: true, content, .. }
                if content.contains("ReferenceError")
        )));

        // And the conversation still completed normally.
        let turns = h.store.all(CONV);
        assert_eq!(turns.last().unwrap().kind, TurnKind::AssistantMessage);
    }

    /// Malformed tool input never reaches the page; the model sees the
    /// parse failure as an error result.
    #[tokio::test]
    async fn test_malformed_input_synthesizes_error_without_dispatch() {
        let h = TestHarness::new();
        h.model.script(vec![
            Ok(StreamEvent::ToolStart {
                correlation_id: "toolu_1".to_string(),
                tool_name: "run_js".to_string(),
            }),
            Ok(StreamEvent::ToolCallReady {
                correlation_id: "toolu_1".to_string(),
                tool_name: "run_js".to_string(),
                raw_input: "{not valid json".to_string(),
            }),
            Ok(StreamEvent::TurnDone {
                stop_reason: StopReason::ToolUse,
            }),
        ]);
        h.model.script(empty_turn());
        let page = spawn_page(h.frames.subscribe(), h.exec.clone(), CONV, |_| {
            ExecOutcome::ok(json!(null))
        });

        h.runner(FAST_TIMEOUT).run("go".to_string()).await;
        settle().await;

        assert!(page.lock().unwrap().is_empty());

        let turns = h.store.all(CONV);
        match &turns[3].content {
            TurnContent::Result(r) => {
                assert!(r.outcome.is_error());
                assert!(r.outcome.as_text().contains("Invalid run_js input"));
            }
            other => panic!("Expected result turn, got {other:?}"),
        }
    }

    /// Client disconnect mid-turn: the already-dispatched call's result is
    /// still appended once it arrives; the model is not re-invoked.
    #[tokio::test]
    async fn test_disconnect_still_appends_inflight_result() {
        let h = TestHarness::new();
        h.model.script(tool_turn(None, &[("toolu_1", "slow()")]));

        let mut rx = h.frames.subscribe();
        let runner = h.runner(Duration::from_secs(5));
        let turn = tokio::spawn(runner.run("go".to_string()));

        // Wait until the call is on the wire, then disconnect the client.
        loop {
            match rx.recv().await.unwrap() {
                Frame::Execute { correlation_id, .. } => {
                    assert_eq!(correlation_id, "toolu_1");
                    break;
                }
                _ => {}
            }
        }
        drop(rx);

        // The page answers after the client went away.
        h.exec
            .resolve(CONV, "toolu_1", ExecOutcome::ok(json!("done")))
            .unwrap();
        turn.await.unwrap();

        let turns = h.store.all(CONV);
        assert_eq!(
            kinds(&turns),
            vec![
                TurnKind::UserMessage,
                TurnKind::AssistantMessage,
                TurnKind::ToolInvocation,
                TurnKind::ToolResult,
            ]
        );
        // No further model round happened for a disconnected client.
        assert_eq!(h.model.recorded_requests().len(), 1);
    }

    /// A failing replay dispatch is logged and replay continues with the
    /// remaining invocations.
    #[tokio::test]
    async fn test_replay_continues_past_failures() {
        let h = TestHarness::new();
        h.store.seed(
            CONV,
            vec![
                TurnContent::user("build the page"),
                TurnContent::invocation(crate::db::ToolCall::new(
                    "toolu_1",
                    "run_js",
                    r#"{"code":"first()"}"#,
                )),
                TurnContent::result("toolu_1", ExecOutcome::ok(json!(null))),
                TurnContent::invocation(crate::db::ToolCall::new(
                    "toolu_2",
                    "run_js",
                    r#"{"code":"second()"}"#,
                )),
                // toolu_2 was interrupted: no result, still replayed
            ],
        );

        let (replay_tx, _) = broadcast::channel(64);
        let page = spawn_page(replay_tx.subscribe(), h.exec.clone(), CONV, |code| {
            if code.contains("first") {
                ExecOutcome::error("first() exploded")
            } else {
                ExecOutcome::ok(json!(null))
            }
        });

        let report = rebuild(&h.store, &h.exec, &replay_tx, CONV, FAST_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(report.dispatched, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(page.lock().unwrap().clone(), vec!["first()", "second()"]);
    }

    /// A store failure is fatal and surfaced, never silently dropped.
    #[tokio::test]
    async fn test_store_failure_surfaces_error() {
        let h = TestHarness::new();
        h.model.script(text_turn("never used"));
        h.store.fail_appends(true);
        let frames = collect_frames(h.frames.subscribe());

        h.runner(FAST_TIMEOUT).run("hi".to_string()).await;
        settle().await;

        assert!(h.store.all(CONV).is_empty());
        assert!(frames
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, Frame::Error { message } if message.contains("persist"))));
        // The model was never consulted for a turn that could not be stored.
        assert!(h.model.recorded_requests().is_empty());
    }
}
