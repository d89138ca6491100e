//! OpenAI Responses frontdoor (spec.md §6.3): `POST <base>/v1/responses`,
//! `GET <base>/v1/responses/{id}`, `POST <base>/v1/responses/{id}/cancel`,
//! plus the legacy thread surface (`/v1/threads`, `/v1/threads/{id}/messages`,
//! `/v1/threads/{id}/runs`) spec.md §4.4 keeps alongside it.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use uuid::Uuid;

use crate::canonical::{CanonicalRequest, Message, SourceApiType};
use crate::codecs::openai_responses::{self, OpenAiResponsesCodec};
use crate::codecs::{Codec, StreamEncoder};
use crate::error::ApiError;
use crate::store::{resolve_previous_response_chain, Conversation, ResponseStatus, StoredResponse};
use crate::tenant::Tenant;

use super::{decode, openai_error_response, sse_headers, FrontdoorFactory, HandlerConfig};

pub struct OpenAiResponsesFrontdoor;

impl FrontdoorFactory for OpenAiResponsesFrontdoor {
    fn api_type(&self) -> SourceApiType {
        SourceApiType::OpenAiResponses
    }

    fn description(&self) -> &'static str {
        "OpenAI Responses-compatible frontdoor"
    }

    fn build(&self, config: HandlerConfig) -> Router {
        Router::new()
            .route("/v1/responses", post(create_response))
            .route("/v1/responses/{id}", get(get_response))
            .route("/v1/responses/{id}/cancel", post(cancel_response))
            .route("/v1/threads", post(create_thread))
            .route("/v1/threads/{id}/messages", post(append_thread_message))
            .route("/v1/threads/{id}/runs", post(run_thread))
            .route("/v1/models", get(list_models))
            .with_state(Arc::new(config))
    }
}

/// Walk a dotted accessor (e.g. `"metadata.session_id"`) into a decoded
/// JSON body to derive a thread key when the client omits
/// `previous_response_id` explicitly (spec.md §6 `responses_thread_key_path`).
fn extract_thread_key(body: &Bytes, path: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let mut current = &value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    current.as_str().map(str::to_string)
}

/// Resolve the prior-conversation prefix for an inbound request (spec.md
/// §4.4, Open Question: an explicit `previous_response_id` always wins over
/// a thread-key lookup; both namespaces resolve to "the most recent
/// response id for this key"). Returns the prefix messages and the id this
/// new response should record as its own `previous_response_id`, plus the
/// thread key (if any) to update once the new response is saved.
async fn resolve_continuation(
    config: &HandlerConfig,
    tenant: &Tenant,
    body: &Bytes,
) -> Result<(Vec<Message>, Option<String>, Option<String>), ApiError> {
    if let Some(prev_id) = openai_responses::previous_response_id(body) {
        let prefix = resolve_previous_response_chain(
            config.store.as_ref(),
            &tenant.id,
            &prev_id,
            config.max_previous_response_depth,
        )
        .await?;
        return Ok((prefix, Some(prev_id), None));
    }

    if let Some(path) = &config.thread_key_path {
        if let Some(key) = extract_thread_key(body, path) {
            if let Some(prev_id) = config.store.get_thread_key(&tenant.id, &key).await? {
                let prefix = resolve_previous_response_chain(
                    config.store.as_ref(),
                    &tenant.id,
                    &prev_id,
                    config.max_previous_response_depth,
                )
                .await?;
                return Ok((prefix, Some(prev_id), Some(key)));
            }
            return Ok((Vec::new(), None, Some(key)));
        }
    }

    Ok((Vec::new(), None, None))
}

async fn persist_response(
    config: &HandlerConfig,
    tenant: &Tenant,
    previous_response_id: Option<String>,
    thread_key: Option<String>,
    output_messages: Vec<Message>,
    encoded: Vec<u8>,
) -> Result<String, ApiError> {
    let id = format!("resp_{}", Uuid::new_v4().simple());
    config
        .store
        .save_response(StoredResponse {
            id: id.clone(),
            tenant_id: tenant.id.clone(),
            previous_response_id,
            created: chrono::Utc::now().timestamp(),
            status: ResponseStatus::Completed,
            encoded,
            output_messages,
        })
        .await?;

    if let Some(key) = thread_key {
        config.store.set_thread_key(&tenant.id, &key, &id).await?;
    }

    Ok(id)
}

async fn create_response(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let codec = OpenAiResponsesCodec;
    let (prefix, previous_response_id, thread_key) =
        match resolve_continuation(&config, &tenant, &body).await {
            Ok(r) => r,
            Err(err) => return openai_error_response(&err),
        };

    let mut request = match decode(&codec, &body, &tenant.id, &headers, SourceApiType::OpenAiResponses) {
        Ok(r) => r,
        Err(err) => return openai_error_response(&err),
    };
    if !prefix.is_empty() {
        let mut messages = prefix;
        messages.extend(request.messages);
        request.messages = messages;
    }

    if request.stream {
        stream_response(config, tenant, codec, request, previous_response_id, thread_key).await
    } else {
        unary_response(config, tenant, codec, request, previous_response_id, thread_key).await
    }
}

async fn unary_response(
    config: Arc<HandlerConfig>,
    tenant: Arc<Tenant>,
    codec: OpenAiResponsesCodec,
    request: CanonicalRequest,
    previous_response_id: Option<String>,
    thread_key: Option<String>,
) -> Response {
    let response = match tenant.router.complete(request).await {
        Ok(r) => r,
        Err(err) => return openai_error_response(&err),
    };

    let encoded = match codec.encode_response(&response) {
        Ok(bytes) => bytes,
        Err(err) => return openai_error_response(&err),
    };

    let output_messages = vec![response.first_choice().message.clone()];
    if let Err(err) = persist_response(&config, &tenant, previous_response_id, thread_key, output_messages, encoded.clone()).await {
        return openai_error_response(&err);
    }

    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        encoded,
    )
        .into_response()
}

/// Streams the seven-event choreography, accumulating the assistant's text
/// so the completed response can still be persisted for a later
/// `previous_response_id` continuation once the stream ends (spec.md §4.4:
/// a streamed response is a store write like any other).
async fn stream_response(
    config: Arc<HandlerConfig>,
    tenant: Arc<Tenant>,
    codec: OpenAiResponsesCodec,
    request: CanonicalRequest,
    previous_response_id: Option<String>,
    thread_key: Option<String>,
) -> Response {
    let model = request.model.clone();
    let upstream = match tenant.router.stream(request).await {
        Ok(stream) => stream,
        Err(err) => return openai_error_response(&err),
    };

    let mut encoder = codec.new_stream_encoder(&model);
    let body_stream = async_stream::stream! {
        futures::pin_mut!(upstream);
        let mut text = String::new();
        while let Some(event) = upstream.next().await {
            match event {
                Ok(event) => {
                    if let crate::canonical::CanonicalEvent::ContentDelta { text: delta } = &event {
                        text.push_str(delta);
                    }
                    for frame in encoder.encode(&event) {
                        yield Ok::<_, std::io::Error>(bytes::Bytes::from(frame.render()));
                    }
                }
                Err(err) => {
                    let frame = crate::codecs::SseFrame::named(
                        "error",
                        serde_json::to_string(&serde_json::json!({
                            "error": { "type": err.kind.openai_type(), "message": err.message }
                        })).unwrap_or_default(),
                    );
                    yield Ok(bytes::Bytes::from(frame.render()));
                    yield Ok(bytes::Bytes::from("data: [DONE]\n\n"));
                    return;
                }
            }
        }

        let output_messages = vec![Message::assistant(text)];
        let _ = persist_response(&config, &tenant, previous_response_id.clone(), thread_key.clone(), output_messages, Vec::new()).await;

        yield Ok(bytes::Bytes::from("data: [DONE]\n\n"));
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.headers_mut() = sse_headers();
    response
}

async fn get_response(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Path(id): Path<String>,
) -> Response {
    match config.store.get_response(&tenant.id, &id).await {
        Ok(Some(stored)) => (
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            stored.encoded,
        )
            .into_response(),
        Ok(None) => openai_error_response(&ApiError::not_found(format!("response '{id}' not found"))),
        Err(err) => openai_error_response(&err),
    }
}

async fn cancel_response(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Path(id): Path<String>,
) -> Response {
    match config.store.cancel_response(&tenant.id, &id).await {
        Ok(()) => axum::Json(serde_json::json!({ "id": id, "status": "cancelled" })).into_response(),
        Err(err) => openai_error_response(&err),
    }
}

async fn create_thread(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
) -> Response {
    let id = format!("thread_{}", Uuid::new_v4().simple());
    let conversation = Conversation {
        id: id.clone(),
        tenant_id: tenant.id.clone(),
        messages: Vec::new(),
    };
    match config.store.save_conversation(conversation).await {
        Ok(()) => axum::Json(serde_json::json!({ "id": id, "object": "thread" })).into_response(),
        Err(err) => openai_error_response(&err),
    }
}

async fn append_thread_message(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return openai_error_response(&ApiError::invalid_request(format!("invalid JSON: {e}"))),
    };
    let text = payload
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let role = payload.get("role").and_then(|v| v.as_str()).unwrap_or("user");
    let message = if role == "assistant" {
        Message::assistant(text)
    } else {
        Message::user(text)
    };

    match config
        .store
        .append_conversation_messages(&tenant.id, &id, vec![message])
        .await
    {
        Ok(()) => axum::Json(serde_json::json!({ "thread_id": id, "status": "appended" })).into_response(),
        Err(err) => openai_error_response(&err),
    }
}

async fn run_thread(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Path(id): Path<String>,
) -> Response {
    let conversation = match config.store.get_conversation(&tenant.id, &id).await {
        Ok(Some(c)) => c,
        Ok(None) => return openai_error_response(&ApiError::not_found(format!("thread '{id}' not found"))),
        Err(err) => return openai_error_response(&err),
    };

    let default_model = config
        .models
        .first()
        .cloned()
        .unwrap_or_else(|| "gpt-4o".to_string());

    let request = CanonicalRequest {
        tenant_id: tenant.id.clone(),
        model: default_model,
        messages: conversation.messages.clone(),
        system_prompt: None,
        tools: None,
        stream: false,
        max_tokens: 1024,
        temperature: None,
        metadata: Default::default(),
        user_agent: None,
        source_api_type: SourceApiType::OpenAiResponses,
    };

    let response = match tenant.router.complete(request).await {
        Ok(r) => r,
        Err(err) => return openai_error_response(&err),
    };

    let assistant_message = response.first_choice().message.clone();
    if let Err(err) = config
        .store
        .append_conversation_messages(&tenant.id, &id, vec![assistant_message.clone()])
        .await
    {
        return openai_error_response(&err);
    }

    axum::Json(serde_json::json!({
        "thread_id": id,
        "status": "completed",
        "message": { "role": "assistant", "content": assistant_message.content.as_text().unwrap_or_default() },
    }))
    .into_response()
}

async fn list_models(
    State(config): State<Arc<HandlerConfig>>,
    Extension(tenant): Extension<Arc<Tenant>>,
) -> Response {
    if !config.models.is_empty() {
        let data: Vec<_> = config
            .models
            .iter()
            .map(|id| serde_json::json!({"id": id, "object": "model"}))
            .collect();
        return axum::Json(serde_json::json!({"object": "list", "data": data})).into_response();
    }

    match tenant.router.list_models().await {
        Ok(models) => {
            let data: Vec<_> = models
                .into_iter()
                .map(|m| serde_json::json!({"id": m.id, "object": "model"}))
                .collect();
            axum::Json(serde_json::json!({"object": "list", "data": data})).into_response()
        }
        Err(err) => openai_error_response(&err),
    }
}
