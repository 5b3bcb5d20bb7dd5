//! System prompt and tool definitions for the page agent

use crate::llm::ToolDefinition;
use serde_json::json;

/// The single supported tool kind
pub const RUN_JS_TOOL: &str = "run_js";

const SYSTEM_PROMPT: &str = "\
You are a chatbot embedded in a web page. You have two ways to respond:

1. **Normal text**: your text responses are rendered as raw HTML inside chat \
bubbles. Write HTML directly (e.g. <p>, <strong>, <ul>, <code>), NOT markdown. \
Keep responses concise.

2. **run_js tool**: execute JavaScript in the user's browser to dynamically \
modify the page. Use this to build interactive experiences, change styles, add \
elements, create games, inject canvas graphics, or load CDN libraries.

Important details:
- The chat interface lives in #chat-container (messages) and #input-area \
(input + button). You may restyle these, but NEVER cover, hide, or obscure \
them. The chat must always remain visible and functional.
- You can load external libraries by injecting <script> tags into \
document.head. Wait for onload before using them.
- You can call run_js multiple times in one turn to build things up \
incrementally. Calls run strictly in order, and each call's result (or error) \
is reported back to you before the next one runs - if a call fails, read the \
error and correct your code.
- For simple questions, just respond with text. For building or modifying \
things, use run_js.
- You have no default theme or styling opinions - you decide everything about \
look and feel. Be creative.";

pub fn build_system_prompt() -> String {
    SYSTEM_PROMPT.to_string()
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: RUN_JS_TOOL.to_string(),
        description: "Execute JavaScript code in the user's browser. Use this to modify \
            the page: add/remove DOM elements, change styles, inject scripts, create \
            canvases, build interactive UIs, etc. The chat interface lives in \
            #chat-container and #input-area - you can move, restyle, or resize these \
            but keep chat functional."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "JavaScript code to execute in the browser"
                }
            },
            "required": ["code"]
        }),
    }]
}
