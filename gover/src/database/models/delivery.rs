//! Webhook delivery log model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One webhook delivery attempt.
#[derive(Debug, Clone, Default, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDeliveryLogDbModel {
    /// Assigned by the database; ignored on insert.
    pub id: i64,
    pub webhook_id: Option<i64>,
    pub webhook_name: String,
    pub event_type: String,
    pub request_body: String,
    /// HTTP status, 0 when no response was received
    pub response_status: i64,
    /// At most 16 KiB of the response body
    pub response_body: String,
    pub success: bool,
    pub error_message: String,
    pub duration_ms: i64,
    pub attempt: i64,
    pub created_at: i64,
}
