//! Webhook delivery log repository.

use async_trait::async_trait;

use super::SqlxStore;
use crate::Result;
use crate::database::models::WebhookDeliveryLogDbModel;

#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    async fn create_webhook_delivery_log(&self, entry: &WebhookDeliveryLogDbModel) -> Result<i64>;
    /// Newest first.
    async fn list_webhook_delivery_logs(
        &self,
        webhook_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryLogDbModel>>;
}

#[async_trait]
impl DeliveryLogRepository for SqlxStore {
    async fn create_webhook_delivery_log(&self, entry: &WebhookDeliveryLogDbModel) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_delivery_logs
                (webhook_id, webhook_name, event_type, request_body, response_status,
                 response_body, success, error_message, duration_ms, attempt, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.webhook_id)
        .bind(&entry.webhook_name)
        .bind(&entry.event_type)
        .bind(&entry.request_body)
        .bind(entry.response_status)
        .bind(&entry.response_body)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(entry.duration_ms)
        .bind(entry.attempt)
        .bind(entry.created_at)
        .execute(&self.write_pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_webhook_delivery_logs(
        &self,
        webhook_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryLogDbModel>> {
        let limit = limit.clamp(1, 1000);
        let logs = match webhook_id {
            Some(id) => {
                sqlx::query_as::<_, WebhookDeliveryLogDbModel>(
                    "SELECT * FROM webhook_delivery_logs WHERE webhook_id = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, WebhookDeliveryLogDbModel>(
                    "SELECT * FROM webhook_delivery_logs ORDER BY id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(logs)
    }
}
