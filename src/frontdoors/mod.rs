//! HTTP frontdoors: one per client wire format, each a bundle of handlers
//! mounted under a configured path prefix (spec.md §4.4). No direct
//! teacher precedent — `austinjan-km` has no HTTP server — so the axum
//! shape here is grounded on `other_examples/...poly-workshop-llm-gateway-rs`
//! (`Router<Arc<AppState>>`, `Result<Response, Response>` error-as-response,
//! `Body::from_stream` for SSE) per spec.md's "enrich from the rest of the
//! pack" process step.

pub mod anthropic;
pub mod openai_chat;
pub mod openai_responses;

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::canonical::SourceApiType;
use crate::codecs::Codec;
use crate::error::ApiError;
use crate::store::Store;

/// Everything a frontdoor's handlers need besides the wire bytes
/// themselves: where to persist and how to name itself in client-visible
/// output (spec.md §4.4 `HandlerConfig`). Deliberately carries no
/// `Provider` of its own — control flow resolves the tenant-scoped router
/// from the authenticated tenant at request time (spec.md §2 "resolve
/// tenant-scoped router"), which also covers single-tenant mode via the
/// implicit `"default"` tenant's own router.
pub struct HandlerConfig {
    pub store: Arc<dyn Store>,
    pub app_name: String,
    pub base_path: String,
    pub models: Vec<String>,
    /// spec.md §4.4: bounds the `previous_response_id` DAG walk.
    pub max_previous_response_depth: u32,
    /// spec.md §6 `responses_thread_key_path`: a JSON-path-ish dotted
    /// accessor into the inbound request body used to derive a thread key
    /// when the client omits `previous_response_id` explicitly.
    pub thread_key_path: Option<String>,
    pub force_store: bool,
}

/// A frontdoor type registration (spec.md §4.4): a type tag, the api-type
/// it's compatible with, a description, and a factory that builds its
/// route table from a `HandlerConfig`.
pub trait FrontdoorFactory: Send + Sync {
    fn api_type(&self) -> SourceApiType;
    fn description(&self) -> &'static str;
    /// Returns a fully state-erased `Router` (internally bound to an
    /// `Arc<HandlerConfig>` via `.with_state`) ready to be nested under
    /// `config.base_path` by the server.
    fn build(&self, config: HandlerConfig) -> axum::Router;
}

/// Render an `ApiError` into the frontdoor-native error envelope (spec.md
/// §7): OpenAI-family `{"error": {...}}`, Anthropic `{"type":"error",...}`.
pub fn openai_error_response(err: &ApiError) -> Response {
    (
        err.status(),
        axum::Json(serde_json::json!({
            "error": {
                "type": err.kind.openai_type(),
                "code": err.code,
                "message": err.message,
                "param": err.param,
            }
        })),
    )
        .into_response()
}

pub fn anthropic_error_response(err: &ApiError) -> Response {
    (
        err.status(),
        axum::Json(serde_json::json!({
            "type": "error",
            "error": { "type": err.kind.anthropic_type(), "message": err.message },
        })),
    )
        .into_response()
}

/// The inbound `User-Agent` header, forwarded verbatim to the backend
/// adapter so it can pass it upstream (spec.md §4.2).
pub fn inbound_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decode one request body with a codec, attaching the tenant id, user
/// agent, and source-api-type this frontdoor always supplies.
pub fn decode<C: Codec>(
    codec: &C,
    body: &Bytes,
    tenant_id: &str,
    headers: &HeaderMap,
    source_api_type: SourceApiType,
) -> Result<crate::canonical::CanonicalRequest, ApiError> {
    codec.decode_request(
        body,
        crate::codecs::DecodeContext {
            tenant_id: tenant_id.to_string(),
            user_agent: inbound_user_agent(headers),
            source_api_type,
        },
    )
}

/// Standard SSE response headers (spec.md §4.4): `Content-Type:
/// text/event-stream`, `Cache-Control: no-cache`, `Connection:
/// keep-alive`, `X-Accel-Buffering: no`.
pub fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
    headers.insert(axum::http::header::CACHE_CONTROL, "no-cache".parse().unwrap());
    headers.insert(axum::http::header::CONNECTION, "keep-alive".parse().unwrap());
    headers.insert("x-accel-buffering", "no".parse().unwrap());
    headers
}
