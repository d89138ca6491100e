//! OpenAI Responses API backend adapter. Speaks upstream's own seven-event
//! SSE choreography (spec.md §4.1) on the wire and decodes it back down to
//! the same canonical event stream every other backend produces.

use std::pin::Pin;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};

use crate::canonical::{CanonicalEvent, CanonicalRequest, CanonicalResponse};
use crate::codecs::openai_responses::OpenAiResponsesCodec;
use crate::codecs::Codec;
use crate::error::{ApiError, ErrorKind};

use super::{effective_user_agent, BackendConfig, EventStream, ModelDescriptor, Provider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiResponsesBackend {
    client: reqwest::Client,
    config: BackendConfig,
    codec: OpenAiResponsesCodec,
}

impl OpenAiResponsesBackend {
    pub fn new(config: BackendConfig) -> Self {
        OpenAiResponsesBackend {
            client: reqwest::Client::new(),
            config,
            codec: OpenAiResponsesCodec,
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn request_builder(&self, path: &str, request: &CanonicalRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .header("user-agent", effective_user_agent(request))
    }

    async fn error_from_response(&self, response: reqwest::Response) -> ApiError {
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({"error": {"message": "unreadable error body"}}));
        let message = body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("upstream error")
            .to_string();

        let kind = match status.as_u16() {
            401 | 403 => ErrorKind::Server,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimit,
            503 => ErrorKind::Overloaded,
            s if (400..500).contains(&s) => ErrorKind::InvalidRequest,
            _ => ErrorKind::Server,
        };
        ApiError::new(kind, message)
    }
}

#[async_trait]
impl Provider for OpenAiResponsesBackend {
    async fn complete(&self, request: CanonicalRequest) -> Result<CanonicalResponse, ApiError> {
        let body = self.codec.encode_request(&request)?;
        let response = self
            .request_builder("/v1/responses", &request)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }
        let bytes = response.bytes().await?;
        self.codec.decode_response(&bytes)
    }

    async fn stream(&self, request: CanonicalRequest) -> Result<EventStream, ApiError> {
        let body = self.codec.encode_request(&request)?;
        let response = self
            .request_builder("/v1/responses", &request)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let byte_stream = response.bytes_stream();
        let event_stream = byte_stream.eventsource();
        let codec = OpenAiResponsesCodec;

        let output: Pin<Box<dyn Stream<Item = Result<CanonicalEvent, ApiError>> + Send>> = Box::pin(async_stream::stream! {
            futures::pin_mut!(event_stream);
            let mut finished = false;
            let mut usage_sent = false;

            while let Some(event) = event_stream.next().await {
                match event {
                    Ok(event) => match codec.decode_stream_chunk(&event.data) {
                        Ok(canonicals) => {
                            for canonical in canonicals {
                                match canonical {
                                    CanonicalEvent::Finish { reason } => {
                                        finished = true;
                                        yield Ok(CanonicalEvent::Finish { reason });
                                    }
                                    CanonicalEvent::Usage(usage) => {
                                        usage_sent = true;
                                        yield Ok(CanonicalEvent::Usage(usage));
                                    }
                                    other => yield Ok(other),
                                }
                            }
                        }
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    },
                    Err(err) => {
                        yield Err(ApiError::new(ErrorKind::Server, format!("upstream stream error: {err}")));
                        return;
                    }
                }
            }

            if !finished {
                yield Ok(CanonicalEvent::Finish { reason: crate::canonical::FinishReason::Stop });
            }
            if !usage_sent {
                yield Ok(CanonicalEvent::Usage(crate::canonical::Usage::default()));
            }
        });

        Ok(output)
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ApiError> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url()))
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let body: serde_json::Value = response.json().await?;
        let models = body
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let id = m.get("id")?.as_str()?.to_string();
                Some(ModelDescriptor { id, owned_by: "openai".to_string() })
            })
            .collect();
        Ok(models)
    }
}
