//! In-memory `Store` backend (`storage.type: memory`). Grounded on the
//! teacher's `Arc<RwLock<_>>`-guarded state pattern (`ProviderState` in
//! `src/llm/provider.rs`), generalized to two keyed maps instead of one
//! counters struct.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::ApiError;

use super::{Conversation, StoredResponse, Store};

#[derive(Default)]
struct Tables {
    responses: HashMap<(String, String), StoredResponse>,
    conversations: HashMap<(String, String), Conversation>,
    thread_keys: HashMap<(String, String), String>,
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_response(&self, response: StoredResponse) -> Result<(), ApiError> {
        let key = (response.tenant_id.clone(), response.id.clone());
        self.tables.write().expect("memory store lock poisoned").responses.insert(key, response);
        Ok(())
    }

    async fn get_response(&self, tenant_id: &str, id: &str) -> Result<Option<StoredResponse>, ApiError> {
        let key = (tenant_id.to_string(), id.to_string());
        Ok(self.tables.read().expect("memory store lock poisoned").responses.get(&key).cloned())
    }

    async fn cancel_response(&self, tenant_id: &str, id: &str) -> Result<(), ApiError> {
        let key = (tenant_id.to_string(), id.to_string());
        let mut guard = self.tables.write().expect("memory store lock poisoned");
        if let Some(response) = guard.responses.get_mut(&key) {
            response.status = super::ResponseStatus::Cancelled;
        }
        Ok(())
    }

    async fn save_conversation(&self, conversation: Conversation) -> Result<(), ApiError> {
        let key = (conversation.tenant_id.clone(), conversation.id.clone());
        self.tables.write().expect("memory store lock poisoned").conversations.insert(key, conversation);
        Ok(())
    }

    async fn get_conversation(&self, tenant_id: &str, id: &str) -> Result<Option<Conversation>, ApiError> {
        let key = (tenant_id.to_string(), id.to_string());
        Ok(self.tables.read().expect("memory store lock poisoned").conversations.get(&key).cloned())
    }

    async fn append_conversation_messages(
        &self,
        tenant_id: &str,
        id: &str,
        messages: Vec<crate::canonical::Message>,
    ) -> Result<(), ApiError> {
        let key = (tenant_id.to_string(), id.to_string());
        let mut guard = self.tables.write().expect("memory store lock poisoned");
        let conversation = guard.conversations.entry(key).or_insert_with(|| Conversation {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            messages: Vec::new(),
        });
        conversation.messages.extend(messages);
        Ok(())
    }

    async fn set_thread_key(&self, tenant_id: &str, key: &str, response_id: &str) -> Result<(), ApiError> {
        let map_key = (tenant_id.to_string(), key.to_string());
        self.tables
            .write()
            .expect("memory store lock poisoned")
            .thread_keys
            .insert(map_key, response_id.to_string());
        Ok(())
    }

    async fn get_thread_key(&self, tenant_id: &str, key: &str) -> Result<Option<String>, ApiError> {
        let map_key = (tenant_id.to_string(), key.to_string());
        Ok(self
            .tables
            .read()
            .expect("memory store lock poisoned")
            .thread_keys
            .get(&map_key)
            .cloned())
    }
}
