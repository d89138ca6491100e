//! Backend adapters: thin HTTP clients for each upstream model-provider API,
//! wrapped behind the `Provider` trait with retry/backoff on overload
//! (spec.md §4.2). Grounded on `src/llm/openai.rs` / `src/llm/anthropic.rs`'s
//! `reqwest::Client` + `eventsource-stream` pattern.

mod anthropic;
mod openai_chat;
mod openai_responses;
mod retry;

pub use anthropic::AnthropicBackend;
pub use openai_chat::OpenAiChatBackend;
pub use openai_responses::OpenAiResponsesBackend;
pub use retry::RetryingProvider;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::canonical::{CanonicalEvent, CanonicalRequest, CanonicalResponse};
use crate::error::ApiError;

/// A model descriptor returned by `list_models`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub owned_by: String,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<CanonicalEvent, ApiError>> + Send>>;

/// The capability set every backend (and the router, which is itself a
/// `Provider`) implements (spec.md §4.2, §4.3).
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(&self, request: CanonicalRequest) -> Result<CanonicalResponse, ApiError>;

    async fn stream(&self, request: CanonicalRequest) -> Result<EventStream, ApiError>;

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ApiError>;
}

/// Construction config shared by every backend adapter (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub supports_responses: bool,
    pub max_retries: u32,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        BackendConfig {
            name: name.into(),
            api_key: api_key.into(),
            base_url: None,
            supports_responses: false,
            max_retries: 2,
        }
    }
}

/// The default User-Agent sent upstream when the inbound client didn't send
/// one (spec.md §4.2 "User-agent pass-through").
pub const DEFAULT_USER_AGENT: &str = concat!("polygate/", env!("CARGO_PKG_VERSION"));

pub(crate) fn effective_user_agent(request: &CanonicalRequest) -> String {
    request
        .user_agent
        .clone()
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
}
