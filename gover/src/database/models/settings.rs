//! Singleton settings rows: danmaku consumer, integration queue and features.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Danmaku consumer configuration and persisted cursor.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DanmakuConsumerSettingDbModel {
    pub enabled: bool,
    /// http_polling | bilibili_message_stream
    pub provider: String,
    pub endpoint: String,
    pub auth_token: String,
    /// Provider-specific JSON configuration
    pub config_json: String,
    pub poll_interval_sec: i64,
    pub batch_size: i64,
    pub room_id: i64,
    pub cursor: String,
    pub last_poll_at: Option<i64>,
    pub last_error: String,
    pub updated_at: i64,
}

impl Default for DanmakuConsumerSettingDbModel {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "http_polling".to_string(),
            endpoint: String::new(),
            auth_token: String::new(),
            config_json: "{}".to_string(),
            poll_interval_sec: 3,
            batch_size: 20,
            room_id: 0,
            cursor: String::new(),
            last_poll_at: None,
            last_error: String::new(),
            updated_at: 0,
        }
    }
}

impl DanmakuConsumerSettingDbModel {
    /// Poll interval in seconds, clamped to 1..=300 (default 3).
    pub fn poll_interval_secs(&self) -> u64 {
        if self.poll_interval_sec <= 0 {
            3
        } else {
            self.poll_interval_sec.clamp(1, 300) as u64
        }
    }

    /// Batch size clamped to 1..=500 (default 20).
    pub fn batch_limit(&self) -> i64 {
        if self.batch_size <= 0 {
            20
        } else {
            self.batch_size.clamp(1, 500)
        }
    }
}

/// Integration queue tunables.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationQueueSettingDbModel {
    pub webhook_rate_gap_ms: i64,
    pub bot_rate_gap_ms: i64,
    pub max_workers: i64,
    pub lease_interval_ms: i64,
    pub updated_at: i64,
}

impl Default for IntegrationQueueSettingDbModel {
    fn default() -> Self {
        Self {
            webhook_rate_gap_ms: 300,
            bot_rate_gap_ms: 300,
            max_workers: 3,
            lease_interval_ms: 500,
            updated_at: 0,
        }
    }
}

impl IntegrationQueueSettingDbModel {
    /// Copy with every tunable clamped to its allowed range.
    pub fn clamped(&self) -> Self {
        Self {
            webhook_rate_gap_ms: self.webhook_rate_gap_ms.clamp(0, 60_000),
            bot_rate_gap_ms: self.bot_rate_gap_ms.clamp(0, 60_000),
            max_workers: self.max_workers.clamp(1, 16),
            lease_interval_ms: self.lease_interval_ms.clamp(100, 5_000),
            updated_at: self.updated_at,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.max_workers.clamp(1, 16) as usize
    }

    pub fn lease_interval(&self) -> Duration {
        Duration::from_millis(self.lease_interval_ms.clamp(100, 5_000) as u64)
    }
}

/// Feature flags. A flag is effective only when `simple_mode` is off.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationFeatureSettingDbModel {
    pub simple_mode: bool,
    pub enable_danmaku_consumer: bool,
    pub enable_webhook: bool,
    pub enable_bot: bool,
    pub enable_advanced_stats: bool,
    pub enable_task_queue: bool,
    pub updated_at: i64,
}

impl Default for IntegrationFeatureSettingDbModel {
    fn default() -> Self {
        Self {
            simple_mode: false,
            enable_danmaku_consumer: true,
            enable_webhook: true,
            enable_bot: true,
            enable_advanced_stats: true,
            enable_task_queue: true,
            updated_at: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_clamps() {
        let mut setting = DanmakuConsumerSettingDbModel::default();
        assert_eq!(setting.poll_interval_secs(), 3);
        assert_eq!(setting.batch_limit(), 20);

        setting.poll_interval_sec = 9999;
        setting.batch_size = -4;
        assert_eq!(setting.poll_interval_secs(), 300);
        assert_eq!(setting.batch_limit(), 20);
    }

    #[test]
    fn test_queue_clamps() {
        let setting = IntegrationQueueSettingDbModel {
            webhook_rate_gap_ms: -1,
            bot_rate_gap_ms: 120_000,
            max_workers: 64,
            lease_interval_ms: 10,
            updated_at: 0,
        };
        let clamped = setting.clamped();
        assert_eq!(clamped.webhook_rate_gap_ms, 0);
        assert_eq!(clamped.bot_rate_gap_ms, 60_000);
        assert_eq!(clamped.max_workers, 16);
        assert_eq!(setting.worker_count(), 16);
        assert_eq!(setting.lease_interval(), Duration::from_millis(100));
    }
}
