//! Turn state types

use crate::llm::ContentBlock;
use crate::system_prompt::RUN_JS_TOOL;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Input for the `run_js` tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJsInput {
    pub code: String,
}

/// A tool call extracted from the model stream.
///
/// `raw_input` is the accumulated streamed JSON, kept verbatim; it is parsed
/// exactly once, when the call is dispatched. A malformed payload is a model
/// mistake surfaced back to the model as an error result, not a protocol
/// error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub correlation_id: String,
    pub tool_name: String,
    pub raw_input: String,
}

impl ToolCall {
    pub fn new(
        correlation_id: impl Into<String>,
        tool_name: impl Into<String>,
        raw_input: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            tool_name: tool_name.into(),
            raw_input: raw_input.into(),
        }
    }

    /// Parse the raw input, enforcing the single supported tool kind
    pub fn parse_input(&self) -> Result<RunJsInput, String> {
        if self.tool_name != RUN_JS_TOOL {
            return Err(format!("Unsupported tool: {}", self.tool_name));
        }
        serde_json::from_str(&self.raw_input)
            .map_err(|e| format!("Invalid {RUN_JS_TOOL} input: {e}"))
    }

    /// Raw input as a JSON value for the assistant content block
    pub fn input_value(&self) -> Value {
        serde_json::from_str(&self.raw_input).unwrap_or(Value::Null)
    }
}

/// Assistant output accumulated while draining one model round
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Draft {
    /// Content blocks in emission order (text and tool_use)
    pub blocks: Vec<ContentBlock>,
    /// Completed tool calls awaiting dispatch, in emission order
    pub calls: VecDeque<ToolCall>,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh text block
    pub fn start_text(&mut self) {
        self.blocks.push(ContentBlock::text(""));
    }

    /// Append to the current text block, opening one if necessary
    pub fn append_text(&mut self, fragment: &str) {
        match self.blocks.last_mut() {
            Some(ContentBlock::Text { text }) => text.push_str(fragment),
            _ => self.blocks.push(ContentBlock::text(fragment)),
        }
    }

    /// Record a completed tool call
    pub fn push_call(&mut self, call: ToolCall) {
        self.blocks.push(ContentBlock::tool_use(
            &call.correlation_id,
            &call.tool_name,
            call.input_value(),
        ));
        self.calls.push_back(call);
    }
}

/// Turn state
#[derive(Debug, Clone, PartialEq)]
pub enum TurnState {
    /// A model round is about to start (or a request is in flight)
    AwaitingModel,

    /// Streaming assistant text
    StreamingText { draft: Draft },

    /// Accumulating streamed input for one tool call
    StreamingToolInput {
        draft: Draft,
        correlation_id: String,
    },

    /// A call has been dispatched; the turn is suspended until its result
    /// arrives (or the bounded wait expires)
    AwaitingToolResult {
        current: ToolCall,
        remaining: VecDeque<ToolCall>,
    },

    /// The model finished a round with no further tool calls
    TurnComplete,

    /// The model stream failed with no tool call pending
    Failed { message: String },
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::TurnComplete | TurnState::Failed { .. })
    }

    /// Short name for logging and error messages
    pub fn name(&self) -> &'static str {
        match self {
            TurnState::AwaitingModel => "awaiting_model",
            TurnState::StreamingText { .. } => "streaming_text",
            TurnState::StreamingToolInput { .. } => "streaming_tool_input",
            TurnState::AwaitingToolResult { .. } => "awaiting_tool_result",
            TurnState::TurnComplete => "turn_complete",
            TurnState::Failed { .. } => "failed",
        }
    }
}
