//! Live event log model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const EVENT_TASK_QUEUED: &str = "integration.task.queued";
pub const EVENT_TASK_RETRY: &str = "integration.task.retry";
pub const EVENT_TASK_DEAD: &str = "integration.task.dead";
pub const EVENT_CONSUMER_POLL: &str = "danmaku.consumer.poll";
pub const EVENT_CONSUMER_ERROR: &str = "danmaku.consumer.error";
pub const EVENT_BOT_EXECUTED: &str = "bot.command.executed";
pub const EVENT_BOT_ERROR: &str = "bot.command.error";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEventDbModel {
    pub id: i64,
    pub event_type: String,
    /// JSON payload
    pub payload: String,
    pub created_at: i64,
}
