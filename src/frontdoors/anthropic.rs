//! Anthropic Messages frontdoor (spec.md §6.2): `POST <base>/v1/messages`,
//! `GET <base>/v1/models`, `POST <base>/v1/messages/count_tokens`.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;

use crate::canonical::SourceApiType;
use crate::codecs::anthropic::AnthropicCodec;
use crate::codecs::{Codec, StreamEncoder};
use crate::tenant::Tenant;

use super::{anthropic_error_response, decode, sse_headers, FrontdoorFactory, HandlerConfig};

pub struct AnthropicFrontdoor;

impl FrontdoorFactory for AnthropicFrontdoor {
    fn api_type(&self) -> SourceApiType {
        SourceApiType::AnthropicMessages
    }

    fn description(&self) -> &'static str {
        "Anthropic Messages-compatible frontdoor"
    }

    fn build(&self, config: HandlerConfig) -> Router {
        Router::new()
            .route("/v1/messages", post(messages))
            .route("/v1/messages/count_tokens", post(count_tokens))
            .route("/v1/models", get(list_models))
            .with_state(Arc::new(config))
    }
}

async fn messages(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let codec = AnthropicCodec;
    let request = match decode(&codec, &body, &tenant.id, &headers, SourceApiType::AnthropicMessages) {
        Ok(r) => r,
        Err(err) => return anthropic_error_response(&err),
    };

    if request.stream {
        stream_message(config, tenant, codec, request).await
    } else {
        unary_message(config, tenant, codec, request).await
    }
}

async fn unary_message(
    _config: Arc<HandlerConfig>,
    tenant: Arc<Tenant>,
    codec: AnthropicCodec,
    request: crate::canonical::CanonicalRequest,
) -> Response {
    match tenant.router.complete(request).await {
        Ok(response) => match codec.encode_response(&response) {
            Ok(bytes) => (
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response(),
            Err(err) => anthropic_error_response(&err),
        },
        Err(err) => anthropic_error_response(&err),
    }
}

/// Anthropic's event grammar is named events, unlike OpenAI's bare `data:`
/// lines — `StreamEncoder::encode` already produces the right `event:` /
/// `data:` pairs per canonical event (message_start, content_block_start,
/// content_block_delta, content_block_stop, message_delta, message_stop).
/// There is no `[DONE]` sentinel in this format; the stream simply ends.
async fn stream_message(
    _config: Arc<HandlerConfig>,
    tenant: Arc<Tenant>,
    codec: AnthropicCodec,
    request: crate::canonical::CanonicalRequest,
) -> Response {
    let model = request.model.clone();
    let upstream = match tenant.router.stream(request).await {
        Ok(stream) => stream,
        Err(err) => return anthropic_error_response(&err),
    };

    let mut encoder = codec.new_stream_encoder(&model);
    let body_stream = async_stream::stream! {
        futures::pin_mut!(upstream);
        while let Some(event) = upstream.next().await {
            match event {
                Ok(event) => {
                    for frame in encoder.encode(&event) {
                        yield Ok::<_, std::io::Error>(bytes::Bytes::from(frame.render()));
                    }
                }
                Err(err) => {
                    let frame = crate::codecs::SseFrame::named(
                        "error",
                        serde_json::to_string(&serde_json::json!({
                            "type": "error",
                            "error": { "type": err.kind.anthropic_type(), "message": err.message }
                        })).unwrap_or_default(),
                    );
                    yield Ok(bytes::Bytes::from(frame.render()));
                    return;
                }
            }
        }
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.headers_mut() = sse_headers();
    response
}

/// Anthropic's token-counting endpoint. No backend exposes an exact
/// tokenizer through this gateway's `Provider` trait, so this returns an
/// estimate grounded on the same whitespace-count heuristic the teacher's
/// context-budget checks used, rather than fail the endpoint outright.
async fn count_tokens(
    Extension(_tenant): Extension<Arc<Tenant>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let codec = AnthropicCodec;
    let request = match decode(&codec, &body, "count-tokens", &headers, SourceApiType::AnthropicMessages) {
        Ok(r) => r,
        Err(err) => return anthropic_error_response(&err),
    };

    let estimate: usize = request
        .messages
        .iter()
        .map(|m| m.content.as_text().unwrap_or_default().split_whitespace().count())
        .sum();

    axum::Json(serde_json::json!({ "input_tokens": estimate })).into_response()
}

async fn list_models(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
) -> Response {
    if !config.models.is_empty() {
        let data: Vec<_> = config
            .models
            .iter()
            .map(|id| serde_json::json!({"id": id, "type": "model", "display_name": id}))
            .collect();
        return axum::Json(serde_json::json!({"data": data})).into_response();
    }

    match tenant.router.list_models().await {
        Ok(models) => {
            let data: Vec<_> = models
                .into_iter()
                .map(|m| serde_json::json!({"id": m.id, "type": "model", "display_name": m.id}))
                .collect();
            axum::Json(serde_json::json!({"data": data})).into_response()
        }
        Err(err) => anthropic_error_response(&err),
    }
}
