//! Integration task database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lowest (most urgent) priority value.
pub const MIN_PRIORITY: i64 = 1;
/// Highest (least urgent) priority value.
pub const MAX_PRIORITY: i64 = 1000;
pub const DEFAULT_PRIORITY: i64 = 100;

pub const MIN_MAX_ATTEMPTS: i64 = 1;
pub const MAX_MAX_ATTEMPTS: i64 = 20;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Integration task row.
///
/// `locked_at` is set exactly while `status = running`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IntegrationTaskDbModel {
    pub id: i64,
    /// webhook | bot
    pub task_type: String,
    /// pending | running | succeeded | dead | cancelled
    pub status: String,
    /// 1..=1000, lower runs first
    pub priority: i64,
    /// JSON payload, interpreted per task type
    pub payload: String,
    /// Number of completed tries
    pub attempt: i64,
    pub max_attempts: i64,
    pub next_run_at: i64,
    pub locked_at: Option<i64>,
    pub last_error: String,
    /// Pacing key; empty means unpaced
    pub rate_key: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

impl IntegrationTaskDbModel {
    pub fn task_type(&self) -> Option<TaskType> {
        self.task_type.parse().ok()
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.status.parse().ok()
    }
}

/// Input for `create_integration_task`.
#[derive(Debug, Clone)]
pub struct NewIntegrationTask {
    pub task_type: TaskType,
    pub priority: Option<i64>,
    pub payload: String,
    pub max_attempts: Option<i64>,
    /// Defaults to now.
    pub next_run_at: Option<i64>,
    pub rate_key: String,
}

impl NewIntegrationTask {
    pub fn new(task_type: TaskType, payload: impl Into<String>) -> Self {
        Self {
            task_type,
            priority: None,
            payload: payload.into(),
            max_attempts: None,
            next_run_at: None,
            rate_key: String::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_rate_key(mut self, rate_key: impl Into<String>) -> Self {
        self.rate_key = rate_key.into();
        self
    }

    pub fn with_next_run_at(mut self, next_run_at: i64) -> Self {
        self.next_run_at = Some(next_run_at);
        self
    }

    /// Priority clamped to 1..=1000; missing or non-positive means 100.
    pub fn effective_priority(&self) -> i64 {
        match self.priority {
            Some(p) if p > 0 => p.clamp(MIN_PRIORITY, MAX_PRIORITY),
            _ => DEFAULT_PRIORITY,
        }
    }

    /// Max attempts clamped to 1..=20; missing or non-positive means 3.
    pub fn effective_max_attempts(&self) -> i64 {
        match self.max_attempts {
            Some(n) if n > 0 => n.clamp(MIN_MAX_ATTEMPTS, MAX_MAX_ATTEMPTS),
            _ => DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Payload with blank input replaced by `{}`.
    pub fn effective_payload(&self) -> &str {
        let trimmed = self.payload.trim();
        if trimmed.is_empty() { "{}" } else { trimmed }
    }
}

/// Task types.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Webhook,
    Bot,
}

/// Task status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for `next_run_at`.
    Pending,
    /// Leased by the scheduler.
    Running,
    Succeeded,
    /// Retries exhausted or non-retryable failure.
    Dead,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_strings() {
        assert_eq!(TaskType::Webhook.to_string(), "webhook");
        assert_eq!("bot".parse::<TaskType>().unwrap(), TaskType::Bot);
        assert_eq!(TaskStatus::Cancelled.as_ref(), "cancelled");
        assert!("RUNNING".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_clamps() {
        let task = NewIntegrationTask::new(TaskType::Webhook, "  ")
            .with_priority(5000)
            .with_max_attempts(0);
        assert_eq!(task.effective_priority(), MAX_PRIORITY);
        assert_eq!(task.effective_max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(task.effective_payload(), "{}");

        let task = NewIntegrationTask::new(TaskType::Bot, "{}").with_max_attempts(99);
        assert_eq!(task.effective_priority(), DEFAULT_PRIORITY);
        assert_eq!(task.effective_max_attempts(), MAX_MAX_ATTEMPTS);
    }
}
