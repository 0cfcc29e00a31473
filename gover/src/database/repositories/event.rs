//! Live event log repository.

use async_trait::async_trait;

use super::SqlxStore;
use crate::Result;
use crate::database::models::LiveEventDbModel;
use crate::database::time::now_ms;

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn create_live_event(&self, event_type: &str, payload: &str) -> Result<i64>;
    /// Newest first.
    async fn list_live_events(
        &self,
        event_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LiveEventDbModel>>;
}

#[async_trait]
impl EventRepository for SqlxStore {
    async fn create_live_event(&self, event_type: &str, payload: &str) -> Result<i64> {
        let payload = if payload.trim().is_empty() {
            "{}"
        } else {
            payload
        };
        let result =
            sqlx::query("INSERT INTO live_events (event_type, payload, created_at) VALUES (?, ?, ?)")
                .bind(event_type)
                .bind(payload)
                .bind(now_ms())
                .execute(&self.write_pool)
                .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_live_events(
        &self,
        event_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LiveEventDbModel>> {
        let limit = limit.clamp(1, 1000);
        let events = match event_type {
            Some(event_type) => {
                sqlx::query_as::<_, LiveEventDbModel>(
                    "SELECT * FROM live_events WHERE event_type = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(event_type)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, LiveEventDbModel>(
                    "SELECT * FROM live_events ORDER BY id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(events)
    }
}
