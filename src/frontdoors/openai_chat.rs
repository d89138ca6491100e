//! OpenAI Chat Completions frontdoor (spec.md §6.1): `POST
//! <base>/v1/chat/completions`, `GET <base>/v1/models`.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;

use crate::canonical::SourceApiType;
use crate::codecs::openai_chat::OpenAiChatCodec;
use crate::codecs::{Codec, StreamEncoder};
use crate::tenant::Tenant;

use super::{decode, openai_error_response, sse_headers, HandlerConfig, FrontdoorFactory};

pub struct OpenAiChatFrontdoor;

impl FrontdoorFactory for OpenAiChatFrontdoor {
    fn api_type(&self) -> SourceApiType {
        SourceApiType::OpenAiChat
    }

    fn description(&self) -> &'static str {
        "OpenAI Chat Completions-compatible frontdoor"
    }

    fn build(&self, config: HandlerConfig) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/models", get(list_models))
            .with_state(Arc::new(config))
    }
}

async fn chat_completions(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let codec = OpenAiChatCodec;
    let request = match decode(&codec, &body, &tenant.id, &headers, SourceApiType::OpenAiChat) {
        Ok(r) => r,
        Err(err) => return openai_error_response(&err),
    };

    if request.stream {
        stream_completion(config, tenant, codec, request).await
    } else {
        unary_completion(config, tenant, codec, request).await
    }
}

async fn unary_completion(
    _config: Arc<HandlerConfig>,
    tenant: Arc<Tenant>,
    codec: OpenAiChatCodec,
    request: crate::canonical::CanonicalRequest,
) -> Response {
    match tenant.router.complete(request).await {
        Ok(response) => match codec.encode_response(&response) {
            Ok(bytes) => (
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response(),
            Err(err) => openai_error_response(&err),
        },
        Err(err) => openai_error_response(&err),
    }
}

/// Streaming choreography (spec.md §4.4): SSE headers, backend `Stream`,
/// re-encode each canonical event through the frontdoor's own SSE
/// grammar, terminal `data: [DONE]\n\n`. Client disconnect drops this
/// future, which drops the backend stream and its upstream connection —
/// the Rust analogue of "cancel context and drain the channel" spec.md §5
/// describes for a goroutine-based runtime.
async fn stream_completion(
    _config: Arc<HandlerConfig>,
    tenant: Arc<Tenant>,
    codec: OpenAiChatCodec,
    request: crate::canonical::CanonicalRequest,
) -> Response {
    let model = request.model.clone();
    let upstream = match tenant.router.stream(request).await {
        Ok(stream) => stream,
        Err(err) => return openai_error_response(&err),
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
                    let frame = crate::codecs::SseFrame::data(
                        serde_json::to_string(&serde_json::json!({
                            "error": { "type": err.kind.openai_type(), "message": err.message }
                        })).unwrap_or_default(),
                    );
                    yield Ok(bytes::Bytes::from(frame.render()));
                    return;
                }
            }
        }
        yield Ok(bytes::Bytes::from("data: [DONE]\n\n"));
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.headers_mut() = sse_headers();
    response
}

async fn list_models(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
) -> Response {
    if !config.models.is_empty() {
        let data: Vec<_> = config
            .models
            .iter()
            .map(|id| serde_json::json!({"id": id, "object": "model", "owned_by": config.app_name}))
            .collect();
        return axum::Json(serde_json::json!({"object": "list", "data": data})).into_response();
    }

    match tenant.router.list_models().await {
        Ok(models) => {
            let data: Vec<_> = models
                .into_iter()
                .map(|m| serde_json::json!({"id": m.id, "object": "model", "owned_by": m.owned_by}))
                .collect();
            axum::Json(serde_json::json!({"object": "list", "data": data})).into_response()
        }
        Err(err) => openai_error_response(&err),
    }
}
