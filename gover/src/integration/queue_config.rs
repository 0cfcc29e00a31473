//! Cached integration queue tunables.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::database::models::{IntegrationQueueSettingDbModel, TaskType};
use crate::database::repositories::SettingsRepository;

const QUEUE_CACHE_TTL: Duration = Duration::from_secs(10);

/// Gap used when the stored value is negative.
/// Queue settings with a 10 second TTL.
///
/// Store failures fall back to the last loaded value, or the defaults.
pub struct QueueSettingsCache {
    settings: Arc<dyn SettingsRepository>,
    cache: Mutex<Option<(IntegrationQueueSettingDbModel, Instant)>>,
    ttl: Duration,
}

impl QueueSettingsCache {
    pub fn new(settings: Arc<dyn SettingsRepository>) -> Self {
        Self {
            settings,
            cache: Mutex::new(None),
            ttl: QUEUE_CACHE_TTL,
        }
    }

    /// Clamped settings, reloaded when the cache is stale.
    pub async fn get(&self) -> IntegrationQueueSettingDbModel {
        let stale = {
            let cache = self.cache.lock();
            match cache.as_ref() {
                Some((setting, loaded_at)) if loaded_at.elapsed() < self.ttl => {
                    return setting.clone();
                }
                Some((setting, _)) => Some(setting.clone()),
                None => None,
            }
        };
        self.load(stale).await
    }

    /// Force a reload, ignoring the TTL.
    pub async fn reload(&self) -> IntegrationQueueSettingDbModel {
        let previous = self.cache.lock().as_ref().map(|(s, _)| s.clone());
        self.load(previous).await
    }

    async fn load(
        &self,
        previous: Option<IntegrationQueueSettingDbModel>,
    ) -> IntegrationQueueSettingDbModel {
        let setting = match self.settings.get_integration_queue_setting().await {
            Ok(setting) => setting.clamped(),
            Err(e) => {
                warn!(error = %e, "Failed to load integration queue settings");
                previous.unwrap_or_default()
            }
        };
        *self.cache.lock() = Some((setting.clone(), Instant::now()));
        setting
    }

    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }

    /// Minimum dispatch gap for tasks of `task_type`.
    pub async fn gap_for(&self, task_type: TaskType) -> Duration {
        rate_gap(&self.get().await, task_type)
    }
}

pub fn rate_gap(setting: &IntegrationQueueSettingDbModel, task_type: TaskType) -> Duration {
    let gap_ms = match task_type {
        TaskType::Webhook => setting.webhook_rate_gap_ms,
        TaskType::Bot => setting.bot_rate_gap_ms,
    };
    Duration::from_millis(gap_ms.clamp(0, 60_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_gap() {
        let mut setting = IntegrationQueueSettingDbModel {
            webhook_rate_gap_ms: 1000,
            bot_rate_gap_ms: 0,
            ..Default::default()
        };
        assert_eq!(rate_gap(&setting, TaskType::Webhook), Duration::from_secs(1));
        assert_eq!(rate_gap(&setting, TaskType::Bot), Duration::ZERO);

        setting.bot_rate_gap_ms = -5;
        assert_eq!(rate_gap(&setting, TaskType::Bot), Duration::ZERO);
        setting.webhook_rate_gap_ms = 600_000;
        assert_eq!(rate_gap(&setting, TaskType::Webhook), Duration::from_secs(60));
    }
}
