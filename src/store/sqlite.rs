//! sqlite `Store` backend (`storage.type: sqlite`). Grounded on the
//! `sqlx::sqlite` + `runtime-tokio` pattern used elsewhere in the
//! retrieval pack for on-disk persistence; runtime (not compile-time
//! `query!`) queries throughout since this gateway has no `DATABASE_URL`
//! available at build time.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::canonical::Message;
use crate::error::ApiError;

use super::{Conversation, ResponseStatus, StoredResponse, Store};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str) -> Result<Self, ApiError> {
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| ApiError::server(format!("failed to open sqlite store at '{path}': {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stored_responses (
                tenant_id TEXT NOT NULL,
                id TEXT NOT NULL,
                previous_response_id TEXT,
                created INTEGER NOT NULL,
                status TEXT NOT NULL,
                encoded BLOB NOT NULL,
                output_messages TEXT NOT NULL,
                PRIMARY KEY (tenant_id, id)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| ApiError::server(format!("sqlite migration failed: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                tenant_id TEXT NOT NULL,
                id TEXT NOT NULL,
                messages TEXT NOT NULL,
                PRIMARY KEY (tenant_id, id)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| ApiError::server(format!("sqlite migration failed: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS thread_keys (
                tenant_id TEXT NOT NULL,
                key TEXT NOT NULL,
                response_id TEXT NOT NULL,
                PRIMARY KEY (tenant_id, key)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| ApiError::server(format!("sqlite migration failed: {e}")))?;

        Ok(SqliteStore { pool })
    }

    fn status_str(status: ResponseStatus) -> &'static str {
        match status {
            ResponseStatus::Completed => "completed",
            ResponseStatus::Cancelled => "cancelled",
        }
    }

    fn status_from_str(s: &str) -> ResponseStatus {
        match s {
            "cancelled" => ResponseStatus::Cancelled,
            _ => ResponseStatus::Completed,
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_response(&self, response: StoredResponse) -> Result<(), ApiError> {
        let output_messages = serde_json::to_string(&response.output_messages)?;
        sqlx::query(
            "INSERT INTO stored_responses
                (tenant_id, id, previous_response_id, created, status, encoded, output_messages)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, id) DO UPDATE SET
                previous_response_id = excluded.previous_response_id,
                created = excluded.created,
                status = excluded.status,
                encoded = excluded.encoded,
                output_messages = excluded.output_messages",
        )
        .bind(&response.tenant_id)
        .bind(&response.id)
        .bind(&response.previous_response_id)
        .bind(response.created)
        .bind(Self::status_str(response.status))
        .bind(&response.encoded)
        .bind(output_messages)
        .execute(&self.pool)
        .await
        .map_err(|e| ApiError::server(format!("failed to save response: {e}")))?;
        Ok(())
    }

    async fn get_response(&self, tenant_id: &str, id: &str) -> Result<Option<StoredResponse>, ApiError> {
        let row = sqlx::query(
            "SELECT tenant_id, id, previous_response_id, created, status, encoded, output_messages
             FROM stored_responses WHERE tenant_id = ? AND id = ?",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ApiError::server(format!("failed to load response: {e}")))?;

        let Some(row) = row else { return Ok(None) };
        let output_messages: String = row.try_get("output_messages").map_err(|e| ApiError::server(e.to_string()))?;
        let output_messages: Vec<Message> = serde_json::from_str(&output_messages)?;
        let status: String = row.try_get("status").map_err(|e| ApiError::server(e.to_string()))?;

        Ok(Some(StoredResponse {
            id: row.try_get("id").map_err(|e| ApiError::server(e.to_string()))?,
            tenant_id: row.try_get("tenant_id").map_err(|e| ApiError::server(e.to_string()))?,
            previous_response_id: row.try_get("previous_response_id").map_err(|e| ApiError::server(e.to_string()))?,
            created: row.try_get("created").map_err(|e| ApiError::server(e.to_string()))?,
            status: Self::status_from_str(&status),
            encoded: row.try_get("encoded").map_err(|e| ApiError::server(e.to_string()))?,
            output_messages,
        }))
    }

    async fn cancel_response(&self, tenant_id: &str, id: &str) -> Result<(), ApiError> {
        sqlx::query("UPDATE stored_responses SET status = 'cancelled' WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| ApiError::server(format!("failed to cancel response: {e}")))?;
        Ok(())
    }

    async fn save_conversation(&self, conversation: Conversation) -> Result<(), ApiError> {
        let messages = serde_json::to_string(&conversation.messages)?;
        sqlx::query(
            "INSERT INTO conversations (tenant_id, id, messages) VALUES (?, ?, ?)
             ON CONFLICT(tenant_id, id) DO UPDATE SET messages = excluded.messages",
        )
        .bind(&conversation.tenant_id)
        .bind(&conversation.id)
        .bind(messages)
        .execute(&self.pool)
        .await
        .map_err(|e| ApiError::server(format!("failed to save conversation: {e}")))?;
        Ok(())
    }

    async fn get_conversation(&self, tenant_id: &str, id: &str) -> Result<Option<Conversation>, ApiError> {
        let row = sqlx::query("SELECT tenant_id, id, messages FROM conversations WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ApiError::server(format!("failed to load conversation: {e}")))?;

        let Some(row) = row else { return Ok(None) };
        let messages: String = row.try_get("messages").map_err(|e| ApiError::server(e.to_string()))?;
        Ok(Some(Conversation {
            id: row.try_get("id").map_err(|e| ApiError::server(e.to_string()))?,
            tenant_id: row.try_get("tenant_id").map_err(|e| ApiError::server(e.to_string()))?,
            messages: serde_json::from_str(&messages)?,
        }))
    }

    async fn append_conversation_messages(
        &self,
        tenant_id: &str,
        id: &str,
        messages: Vec<Message>,
    ) -> Result<(), ApiError> {
        let mut conversation = self
            .get_conversation(tenant_id, id)
            .await?
            .unwrap_or_else(|| Conversation { id: id.to_string(), tenant_id: tenant_id.to_string(), messages: Vec::new() });
        conversation.messages.extend(messages);
        self.save_conversation(conversation).await
    }

    async fn set_thread_key(&self, tenant_id: &str, key: &str, response_id: &str) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO thread_keys (tenant_id, key, response_id) VALUES (?, ?, ?)
             ON CONFLICT(tenant_id, key) DO UPDATE SET response_id = excluded.response_id",
        )
        .bind(tenant_id)
        .bind(key)
        .bind(response_id)
        .execute(&self.pool)
        .await
        .map_err(|e| ApiError::server(format!("failed to save thread key: {e}")))?;
        Ok(())
    }

    async fn get_thread_key(&self, tenant_id: &str, key: &str) -> Result<Option<String>, ApiError> {
        let row = sqlx::query("SELECT response_id FROM thread_keys WHERE tenant_id = ? AND key = ?")
            .bind(tenant_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ApiError::server(format!("failed to load thread key: {e}")))?;
        match row {
            Some(row) => Ok(Some(row.try_get("response_id").map_err(|e| ApiError::server(e.to_string()))?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Message as Msg;

    #[tokio::test]
    async fn round_trips_a_stored_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();

        store
            .save_response(StoredResponse {
                id: "resp_1".to_string(),
                tenant_id: "default".to_string(),
                previous_response_id: None,
                created: 1700000000,
                status: ResponseStatus::Completed,
                encoded: b"{}".to_vec(),
                output_messages: vec![Msg::assistant("hi")],
            })
            .await
            .unwrap();

        let loaded = store.get_response("default", "resp_1").await.unwrap().unwrap();
        assert_eq!(loaded.output_messages.len(), 1);
        assert_eq!(loaded.status, ResponseStatus::Completed);

        store.cancel_response("default", "resp_1").await.unwrap();
        let cancelled = store.get_response("default", "resp_1").await.unwrap().unwrap();
        assert_eq!(cancelled.status, ResponseStatus::Cancelled);
    }

    #[tokio::test]
    async fn thread_key_resolves_to_latest_response_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();

        assert!(store.get_thread_key("default", "session-1").await.unwrap().is_none());
        store.set_thread_key("default", "session-1", "resp_1").await.unwrap();
        store.set_thread_key("default", "session-1", "resp_2").await.unwrap();
        assert_eq!(store.get_thread_key("default", "session-1").await.unwrap().as_deref(), Some("resp_2"));
    }
}
