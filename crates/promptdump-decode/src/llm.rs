//! LLM API request and response bodies
//!
//! Covers the Ollama native API (`/api/chat`, `/api/generate`), the
//! OpenAI-compatible API served by Ollama and LM Studio, LM Studio's
//! `/api/v0` endpoints and the Anthropic messages API.

use crate::sse;
use crate::{DecodeError, DecodeResult};
use promptdump_core::Request;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// URL fragments of known chat and completion endpoints
pub const LLM_ENDPOINTS: &[&str] = &[
    "/api/chat",
    "/api/generate",
    "/v1/chat/completions",
    "/v1/completions",
    "/api/v0/chat/completions",
    "/api/v0/completions",
    "/v1/messages",
];

/// Whether `request` looks like a call to an LLM endpoint: a JSON body
/// (by content type or by a `model` field) sent to a known URL.
pub fn is_llm_request(request: &Request) -> bool {
    let json = request
        .content_type()
        .is_some_and(|ct| ct.contains("application/json"));
    if !json && !has_model_field(request.body()) {
        return false;
    }

    let url = request.uri.to_string();
    LLM_ENDPOINTS.iter().any(|endpoint| url.contains(endpoint))
}

fn has_model_field(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .map(|v| v.get("model").is_some())
        .unwrap_or(false)
}

/// Message content: a plain string or a list of typed parts
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text of all text parts, concatenated
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts.iter().filter_map(|p| p.text.as_deref()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmFunction {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
    /// An object (Ollama) or a JSON-encoded string (OpenAI)
    pub arguments: Option<Value>,
}

/// A tool definition or a tool call
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmTool {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub function: LlmFunction,
}

impl LlmTool {
    /// `Tool call: name(args)`
    pub fn summary(&self) -> String {
        let args = self
            .function
            .parameters
            .as_ref()
            .or(self.function.arguments.as_ref())
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        format!("Tool call: {}({})", self.function.name, args)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmMessage {
    pub role: String,
    pub content: Option<MessageContent>,
    pub tool_calls: Option<Vec<LlmTool>>,
}

impl LlmMessage {
    pub fn text(&self) -> String {
        self.content.as_ref().map(MessageContent::text).unwrap_or_default()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }

    /// One `Tool call: name(args)` line per call
    pub fn tool_calls_summary(&self) -> String {
        self.tool_calls
            .iter()
            .flatten()
            .map(LlmTool::summary)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Body of a chat or completion request
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmRequest {
    pub model: String,

    // generate
    pub system: Option<MessageContent>,
    pub prompt: Option<String>,

    // chat
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<LlmTool>,
}

/// Parse the body of an LLM request; `None` when it is not one
pub fn parse_request(request: &Request) -> Option<LlmRequest> {
    if !is_llm_request(request) {
        return None;
    }
    match serde_json::from_slice(request.body()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!("Request {} is not a chat body: {}", request.id, e);
            None
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmChoice {
    pub index: u32,
    pub finish_reason: Option<String>,
    pub text: Option<String>,
    pub message: Option<LlmMessage>,
    pub delta: Option<LlmMessage>,
}

/// One response body, NDJSON line or SSE event
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmResponse {
    pub id: Option<String>,
    pub object: Option<String>,
    pub model: Option<String>,

    // /api/chat, /api/generate
    pub response: Option<String>,
    pub done: Option<bool>,
    pub message: Option<LlmMessage>,

    // /v1/messages
    pub content: Option<MessageContent>,
    pub delta: Option<ContentPart>,

    // /v1/chat/completions, /v1/completions
    pub choices: Vec<LlmChoice>,
}

impl LlmResponse {
    /// Generated text, with tool calls summarized inline
    pub fn text(&self) -> String {
        let mut out = String::new();
        if let Some(message) = &self.message {
            push_message(&mut out, message);
        }
        if let Some(content) = &self.content {
            out.push_str(&content.text());
        }
        if let Some(text) = self.delta.as_ref().and_then(|d| d.text.as_deref()) {
            out.push_str(text);
        }
        if let Some(response) = &self.response {
            out.push_str(response);
        }
        for choice in &self.choices {
            if let Some(delta) = &choice.delta {
                out.push_str(&delta.text());
            }
            if let Some(text) = &choice.text {
                out.push_str(text);
            }
            if let Some(message) = &choice.message {
                push_message(&mut out, message);
            }
        }
        out
    }
}

fn push_message(out: &mut String, message: &LlmMessage) {
    out.push_str(&message.text());
    if message.has_tool_calls() {
        out.push_str(&message.tool_calls_summary());
    }
}

/// Parse a single JSON response body
pub fn parse_response(body: &[u8]) -> DecodeResult<LlmResponse> {
    Ok(serde_json::from_slice(body)?)
}

/// Extract the generated text from a response body according to its
/// content type. NDJSON lines and SSE events that fail to parse are skipped.
pub fn response_text(content_type: Option<&str>, body: &[u8]) -> DecodeResult<String> {
    let ct = content_type.unwrap_or_default();

    if ct.starts_with("application/x-ndjson") {
        let text = body
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .filter_map(|line| serde_json::from_slice::<LlmResponse>(line).ok())
            .map(|r| r.text())
            .collect();
        Ok(text)
    } else if ct.starts_with("application/json") {
        Ok(parse_response(body)?.text())
    } else if ct.starts_with("text/event-stream") {
        let mut text = String::new();
        for event in sse::parse_events(body) {
            if event.is_done() || event.data.is_empty() {
                continue;
            }
            match serde_json::from_str::<LlmResponse>(&event.data) {
                Ok(r) => text.push_str(&r.text()),
                Err(e) => debug!("Skipping SSE event: {}", e),
            }
        }
        Ok(text)
    } else {
        Err(DecodeError::UnsupportedContentType(ct.to_string()))
    }
}

/// Split a leading `<think>...</think>` reasoning block from the answer.
/// Returns `(reasoning, answer)`; an unclosed block is all reasoning.
pub fn split_think(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim_start_matches(['\r', '\n', '\t', ' ']);
    if !trimmed.starts_with("<think>") {
        return (None, text);
    }
    match trimmed.find("</think>") {
        Some(pos) => {
            let end = pos + "</think>".len();
            (Some(&trimmed[..end]), &trimmed[end..])
        }
        None => (Some(trimmed), ""),
    }
}
