//! Bidirectional translation between canonical types and each wire format
//! (spec.md §4.1). Grounded on the request/response struct shapes already
//! present in `src/llm/openai.rs` and `src/llm/anthropic.rs`, split into a
//! pure decode/encode pair instead of the teacher's "build a request and
//! fire it" style.

pub mod anthropic;
pub mod openai_chat;
pub mod openai_responses;

mod finish_reason;
pub use finish_reason::{finish_reason_from_anthropic, finish_reason_from_openai, finish_reason_to_anthropic, finish_reason_to_openai};

use crate::canonical::{CanonicalEvent, CanonicalRequest, CanonicalResponse, SourceApiType};
use crate::error::ApiError;

/// Context a decode-request needs beyond the wire bytes themselves: who is
/// asking, and on what surface (spec.md §3 `source-api-type`, `tenant-id`,
/// inbound User-Agent).
pub struct DecodeContext {
    pub tenant_id: String,
    pub user_agent: Option<String>,
    pub source_api_type: SourceApiType,
}

/// One SSE frame: an optional named `event:` line and its `data:` payload.
/// `render` produces the exact bytes written to the response body.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        SseFrame {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        SseFrame {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn render(&self) -> String {
        match &self.event {
            Some(event) => format!("event: {event}\ndata: {}\n\n", self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

/// Stateful per-stream encoder for the client-facing SSE grammar. Stateful
/// because several frontdoor grammars need monotonic ids/indices across the
/// life of one stream (spec.md §4.1: "Output-item ids are freshly generated
/// per stream; output-indices are assigned monotonically").
pub trait StreamEncoder: Send {
    fn encode(&mut self, event: &CanonicalEvent) -> Vec<SseFrame>;
}

/// The four core operations plus the stream chunk pair (spec.md §4.1).
pub trait Codec: Send + Sync {
    fn decode_request(&self, bytes: &[u8], ctx: DecodeContext) -> Result<CanonicalRequest, ApiError>;
    fn encode_request(&self, request: &CanonicalRequest) -> Result<Vec<u8>, ApiError>;
    fn decode_response(&self, bytes: &[u8]) -> Result<CanonicalResponse, ApiError>;
    fn encode_response(&self, response: &CanonicalResponse) -> Result<Vec<u8>, ApiError>;
    /// Translate one upstream SSE event's `data:` payload into zero or more
    /// canonical events — zero for frames this gateway has no use for
    /// (`ping`, `response.in_progress`, `[DONE]`/sentinel), more than one
    /// when a single wire event carries two canonical facts at once (e.g.
    /// Anthropic's `message_delta` carries both the stop reason and
    /// cumulative usage; OpenAI Responses' `response.completed` carries both
    /// the final status and `usage`). Order matters: spec.md §3/§8 guarantee
    /// `Finish` is never preceded by `Usage`, so callers may rely on this
    /// always yielding `Finish` before `Usage` within one `Vec`.
    fn decode_stream_chunk(&self, sse_data: &str) -> Result<Vec<CanonicalEvent>, ApiError>;
    /// `model` seeds the encoder with the served model name so every frame
    /// of the stream reports it, mirroring what a unary response's `model`
    /// field carries.
    fn new_stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder>;
}
