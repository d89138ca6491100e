//! Thread/response store interface (spec.md §3, §4.4, §6 `storage.*`).
//! Per spec.md §1 the store's *implementation* is an external collaborator
//! — sqlite vs. in-memory are interchangeable behind this trait — but the
//! trait contract and a runnable default live here since the rest of the
//! gateway (the Responses frontdoor's DAG walk, thread-key resolution)
//! depends on its shape.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::canonical::Message;
use crate::error::{ApiError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Cancelled,
}

/// A stored prior response, keyed by a stable id, with a back-pointer that
/// forms a DAG of continuations (spec.md §3 `StoredResponse`). `encoded`
/// is the frontdoor-native JSON bytes of the full response, kept verbatim
/// so `GET /v1/responses/{id}` can replay it without re-encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub id: String,
    pub tenant_id: String,
    pub previous_response_id: Option<String>,
    pub created: i64,
    pub status: ResponseStatus,
    pub encoded: Vec<u8>,
    /// The output messages this response produced, in order — what a
    /// later request chaining off this response's id prepends to its own
    /// messages (spec.md §4.4).
    pub output_messages: Vec<Message>,
}

/// An ordered list of messages keyed by id and owned by a tenant (spec.md
/// §3 `Conversation`) — backs the legacy `/v1/threads` surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub messages: Vec<Message>,
}

/// Required safe for concurrent callers from multiple request tasks
/// (spec.md §5); implementations serialize writes internally.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_response(&self, response: StoredResponse) -> Result<(), ApiError>;
    async fn get_response(&self, tenant_id: &str, id: &str) -> Result<Option<StoredResponse>, ApiError>;
    async fn cancel_response(&self, tenant_id: &str, id: &str) -> Result<(), ApiError>;

    async fn save_conversation(&self, conversation: Conversation) -> Result<(), ApiError>;
    async fn get_conversation(&self, tenant_id: &str, id: &str) -> Result<Option<Conversation>, ApiError>;
    async fn append_conversation_messages(
        &self,
        tenant_id: &str,
        id: &str,
        messages: Vec<Message>,
    ) -> Result<(), ApiError>;

    /// Thread key (spec.md §3): maps a logical session to the id of its
    /// most recent stored response.
    async fn set_thread_key(&self, tenant_id: &str, key: &str, response_id: &str) -> Result<(), ApiError>;
    async fn get_thread_key(&self, tenant_id: &str, key: &str) -> Result<Option<String>, ApiError>;
}

/// Walk the stored-response DAG from `start_id` to the root, prepending
/// every prior response's output messages in chronological order (spec.md
/// §4.4). A cycle is a fatal internal error; `max_depth` bounds the walk
/// (config default 100).
pub async fn resolve_previous_response_chain(
    store: &dyn Store,
    tenant_id: &str,
    start_id: &str,
    max_depth: u32,
) -> Result<Vec<Message>, ApiError> {
    let mut chain = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut current = Some(start_id.to_string());
    let mut depth = 0;

    while let Some(id) = current {
        if depth >= max_depth {
            return Err(ApiError::new(
                ErrorKind::Server,
                format!("previous_response_id chain exceeds max depth {max_depth}"),
            ));
        }
        if !seen.insert(id.clone()) {
            return Err(ApiError::new(
                ErrorKind::Server,
                format!("previous_response_id chain contains a cycle at '{id}'"),
            ));
        }

        let stored = store.get_response(tenant_id, &id).await?.ok_or_else(|| {
            ApiError::new(ErrorKind::NotFound, format!("previous response '{id}' not found"))
        })?;

        chain.push(stored.output_messages.clone());
        current = stored.previous_response_id.clone();
        depth += 1;
    }

    // `chain` is newest-first (we walked backwards); reverse to chronological
    // order, then flatten.
    chain.reverse();
    Ok(chain.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Message as Msg;

    async fn seed(store: &MemoryStore, id: &str, prev: Option<&str>, text: &str) {
        store
            .save_response(StoredResponse {
                id: id.to_string(),
                tenant_id: "default".to_string(),
                previous_response_id: prev.map(str::to_string),
                created: 0,
                status: ResponseStatus::Completed,
                encoded: Vec::new(),
                output_messages: vec![Msg::assistant(text)],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn walks_chain_in_chronological_order() {
        let store = MemoryStore::new();
        seed(&store, "r1", None, "first").await;
        seed(&store, "r2", Some("r1"), "second").await;
        seed(&store, "r3", Some("r2"), "third").await;

        let messages = resolve_previous_response_chain(&store, "default", "r3", 100).await.unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.content.as_text().unwrap().to_string()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn missing_previous_response_is_not_found() {
        let store = MemoryStore::new();
        let err = resolve_previous_response_chain(&store, "default", "missing", 100).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn cycle_is_a_server_error() {
        let store = MemoryStore::new();
        seed(&store, "a", Some("b"), "a").await;
        seed(&store, "b", Some("a"), "b").await;
        let err = resolve_previous_response_chain(&store, "default", "a", 100).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Server);
    }

    #[tokio::test]
    async fn depth_bound_is_enforced() {
        let store = MemoryStore::new();
        seed(&store, "r0", None, "0").await;
        for i in 1..5 {
            seed(&store, &format!("r{i}"), Some(&format!("r{}", i - 1)), &i.to_string()).await;
        }
        let err = resolve_previous_response_chain(&store, "default", "r4", 2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Server);
    }
}
