//! Inbound request translation
//!
//! The upstream rejects content arrays whose segments carry no `type`
//! discriminator, so every untagged segment is tagged as plain text before
//! forwarding. Segments that are already tagged with something other than
//! text (images and the like) pass through unchanged — the gateway does not
//! support them end-to-end, but it does not silently drop them either.
//!
//! Model identifiers pass through verbatim. The only model-aware rewrites
//! are for the o1 family, which rejects `system` roles and never streams:
//! system messages become user messages, and a streamed o1 request is
//! satisfied by synthesizing SSE events from the buffered response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

/// Upstream default when the client does not set `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u64 = 10_240;

/// Structural errors in the inbound body. Never retried — these are client
/// errors, surfaced as HTTP 400.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid request body: {0}")]
    Malformed(String),
}

/// Inbound chat-completions request. Generation parameters the gateway does
/// not inspect (temperature, top_p, ...) ride along in `extra`.
#[derive(Debug, Deserialize, Serialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message content: either a plain string or a list of typed segments.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Segments(Vec<ContentSegment>),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ContentSegment {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parse the inbound body and reshape it for the upstream endpoint.
///
/// Fails only on structurally invalid input (not JSON, or no message list).
/// Translation itself performs no I/O.
pub fn translate(body: &[u8]) -> Result<ChatRequest, TranslateError> {
    let mut request: ChatRequest =
        serde_json::from_slice(body).map_err(|e| TranslateError::Malformed(e.to_string()))?;

    let is_o1 = request.model.starts_with("o1");

    for message in &mut request.messages {
        match &mut message.content {
            MessageContent::Text(text) => {
                *text = sanitize_text(text);
            }
            MessageContent::Segments(segments) => {
                for segment in segments.iter_mut() {
                    match segment.kind.as_deref() {
                        None => {
                            segment.kind = Some("text".into());
                            if let Some(text) = &segment.text {
                                segment.text = Some(sanitize_text(text));
                            }
                        }
                        Some("text") => {
                            if let Some(text) = &segment.text {
                                segment.text = Some(sanitize_text(text));
                            }
                        }
                        Some(other) => {
                            // Not supported end-to-end; forwarded as-is
                            debug!(segment_type = other, "passing non-text segment through");
                        }
                    }
                }
            }
        }

        // o1 models reject system messages outright
        if is_o1 && message.role == "system" {
            message.role = "user".into();
        }
    }

    if request.max_tokens.is_none() {
        request.max_tokens = Some(DEFAULT_MAX_TOKENS);
    }

    Ok(request)
}

/// Clean up mojibake from UTF-16 terminal output read as UTF-8.
///
/// Windows terminals produce text where every character is interleaved with
/// U+FFFD replacement characters or literal `\u0000` escape sequences.
/// Strips replacement characters, collapses the escape sequences, and drops
/// control characters other than newlines.
pub fn sanitize_text(input: &str) -> String {
    if !input.contains('\u{fffd}') && !input.contains("\\u0000") {
        return input.to_string();
    }
    warn!("sanitizing mis-encoded message content");

    let cleaned: String = input.chars().filter(|c| *c != '\u{fffd}').collect();

    let mut decoded = String::with_capacity(cleaned.len());
    let mut rest = cleaned.as_str();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix("\\u0000") {
            // keep the character the escape was wrapping
            let mut chars = stripped.chars();
            if let Some(c) = chars.next() {
                decoded.push(c);
            }
            rest = chars.as_str();
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                decoded.push(c);
            }
            rest = chars.as_str();
        }
    }

    decoded
        .chars()
        .filter(|c| *c as u32 >= 32 || *c == '\n' || *c == '\r')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Rewrite a buffered o1 response into delta-shaped choices.
///
/// o1 responses carry `message` objects; streaming clients expect `delta`
/// objects. Non-choice fields are preserved.
pub fn o1_choices_to_deltas(data: &Value) -> Value {
    let Some(choices) = data.get("choices").and_then(Value::as_array) else {
        return data.clone();
    };
    if choices.is_empty() {
        return data.clone();
    }

    let converted: Vec<Value> = choices
        .iter()
        .filter_map(|choice| {
            let message = choice.get("message")?;
            let mut delta_choice = json!({
                "index": choice.get("index").cloned().unwrap_or(json!(0)),
                "delta": { "content": message.get("content").cloned().unwrap_or(Value::Null) },
            });
            if let Some(reason) = choice.get("finish_reason") {
                delta_choice["finish_reason"] = reason.clone();
            }
            Some(delta_choice)
        })
        .collect();

    let mut out = data.clone();
    out["choices"] = Value::Array(converted);
    out
}

/// Render a (delta-shaped) response document as SSE events, one per choice,
/// terminated by the `[DONE]` sentinel.
pub fn to_sse_events(data: &Value) -> Vec<String> {
    let mut events = Vec::new();
    if let Some(choices) = data.get("choices").and_then(Value::as_array) {
        for choice in choices {
            let event = json!({
                "id": data.get("id").cloned().unwrap_or(json!("")),
                "created": data.get("created").cloned().unwrap_or(json!(0)),
                "model": data.get("model").cloned().unwrap_or(json!("")),
                "choices": [choice],
            });
            events.push(format!("data: {event}\n\n"));
        }
    }
    events.push("data: [DONE]\n\n".to_string());
    events
}
