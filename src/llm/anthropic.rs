//! Anthropic Claude provider implementation (streaming Messages API)

use super::types::*;
use super::{EventStream, ModelClient, ProviderError};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic client speaking the Messages API with `stream: true`
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: impl Into<String>, base_url: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            model: model.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn translate_request(&self, request: &ModelRequest) -> WireRequest {
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    MessageRole::User => "user".to_string(),
                    MessageRole::Assistant => "assistant".to_string(),
                },
                content: m.content.clone(),
            })
            .collect();

        let tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        WireRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            stream: true,
            system: request.system.clone(),
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn stream_turn(&self, request: &ModelRequest) -> Result<EventStream, ProviderError> {
        let wire_request = self.translate_request(request);

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&wire_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    ProviderError::network(format!("Connection failed: {e}"))
                } else {
                    ProviderError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_events(response, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Consume the provider's SSE stream and forward translated events.
///
/// Dropping the receiver cancels the pump, which in turn drops the HTTP
/// response and releases the provider-side stream.
async fn pump_events(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamEvent, ProviderError>>,
) {
    let mut source = response.bytes_stream().eventsource();
    let mut translator = StreamTranslator::new();

    while let Some(item) = source.next().await {
        let sse = match item {
            Ok(sse) => sse,
            Err(e) => {
                let _ = tx
                    .send(Err(ProviderError::network(format!("Model stream failed: {e}"))))
                    .await;
                return;
            }
        };

        match translator.accept(&sse.data) {
            Ok(events) => {
                for event in events {
                    let done = matches!(event, StreamEvent::TurnDone { .. });
                    if tx.send(Ok(event)).await.is_err() {
                        // Consumer went away; stop streaming.
                        return;
                    }
                    if done {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    let _ = tx
        .send(Err(ProviderError::truncated(
            "Model stream ended before the turn completed",
        )))
        .await;
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::auth(format!("Authentication failed: {body}")),
        429 => ProviderError::rate_limit(format!("Rate limited: {body}")),
        400 => ProviderError::invalid_request(format!("Invalid request: {body}")),
        500..=599 => ProviderError::server(format!("Server error: {body}")),
        _ => ProviderError::unknown(format!("HTTP {status}: {body}")),
    }
}

// ============================================================
// Wire event translation
// ============================================================

/// Translates raw wire events into [`StreamEvent`]s.
///
/// Holds the one piece of cross-event state the wire format requires: the
/// currently open content block (tool input fragments accumulate here until
/// `content_block_stop`) and the stop reason announced by `message_delta`.
struct StreamTranslator {
    block: Option<OpenBlock>,
    stop_reason: Option<String>,
}

enum OpenBlock {
    Text,
    ToolUse {
        id: String,
        name: String,
        input: String,
    },
}

impl StreamTranslator {
    fn new() -> Self {
        Self {
            block: None,
            stop_reason: None,
        }
    }

    fn accept(&mut self, data: &str) -> Result<Vec<StreamEvent>, ProviderError> {
        let wire: WireEvent = serde_json::from_str(data)
            .map_err(|e| ProviderError::unknown(format!("Unparseable stream event: {e}")))?;

        let events = match wire {
            WireEvent::MessageStart | WireEvent::Ping => vec![],
            WireEvent::ContentBlockStart { content_block } => match content_block {
                WireBlock::Text => {
                    self.block = Some(OpenBlock::Text);
                    vec![StreamEvent::TextStart]
                }
                WireBlock::ToolUse { id, name } => {
                    self.block = Some(OpenBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: String::new(),
                    });
                    vec![StreamEvent::ToolStart {
                        correlation_id: id,
                        tool_name: name,
                    }]
                }
                WireBlock::Unknown => {
                    self.block = None;
                    vec![]
                }
            },
            WireEvent::ContentBlockDelta { delta } => match delta {
                WireDelta::TextDelta { text } => vec![StreamEvent::TextDelta { text }],
                WireDelta::InputJsonDelta { partial_json } => {
                    if let Some(OpenBlock::ToolUse { id, input, .. }) = &mut self.block {
                        input.push_str(&partial_json);
                        vec![StreamEvent::ToolInputDelta {
                            correlation_id: id.clone(),
                            partial_json,
                        }]
                    } else {
                        vec![]
                    }
                }
                WireDelta::Unknown => vec![],
            },
            WireEvent::ContentBlockStop => match self.block.take() {
                Some(OpenBlock::ToolUse { id, name, input }) => {
                    vec![StreamEvent::ToolCallReady {
                        correlation_id: id,
                        tool_name: name,
                        raw_input: input,
                    }]
                }
                _ => vec![],
            },
            WireEvent::MessageDelta { delta } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                vec![]
            }
            WireEvent::MessageStop => vec![StreamEvent::TurnDone {
                stop_reason: StopReason::from_wire(self.stop_reason.as_deref()),
            }],
            WireEvent::Error { error } => {
                return Err(ProviderError::server(format!(
                    "{}: {}",
                    error.error_type, error.message
                )));
            }
            WireEvent::Unknown => vec![],
        };

        Ok(events)
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    system: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    // ContentBlock's serde representation matches the Messages API exactly.
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    // Unlisted fields (indices, usage, message envelope) are ignored.
    MessageStart,
    ContentBlockStart {
        content_block: WireBlock,
    },
    ContentBlockDelta {
        delta: WireDelta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: WireMessageDelta,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    // The initial `text` payload is always empty; ignored.
    Text,
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
