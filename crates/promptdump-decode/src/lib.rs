//! LLM traffic decoders for promptdump
//!
//! - **llm**: recognizes chat/completion requests and extracts the
//!   generated text from JSON, NDJSON and SSE response bodies
//! - **sse**: Server-Sent Events parsing

pub mod llm;
pub mod sse;

pub use llm::{
    is_llm_request, parse_request, parse_response, response_text, split_think, LlmMessage,
    LlmRequest, LlmResponse, LlmTool, MessageContent,
};
pub use sse::{SseEvent, SseParser};

use thiserror::Error;

/// Decode error type
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported content type: {0:?}")]
    UnsupportedContentType(String),

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DecodeResult<T> = Result<T, DecodeError>;
