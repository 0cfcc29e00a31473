//! Feature flags with a short-lived in-process cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;
use crate::database::models::IntegrationFeatureSettingDbModel;
use crate::database::repositories::SettingsRepository;

const FEATURE_CACHE_TTL: Duration = Duration::from_secs(10);

/// Gated features.
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
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    DanmakuConsumer,
    Webhook,
    Bot,
    AdvancedStats,
    TaskQueue,
}

impl Feature {
    /// Effective value of this feature for a stored flag row.
    ///
    /// A missing row disables everything; `simple_mode` overrides every flag.
    pub fn enabled_in(self, row: Option<&IntegrationFeatureSettingDbModel>) -> bool {
        let Some(row) = row else {
            return false;
        };
        if row.simple_mode {
            return false;
        }
        match self {
            Self::DanmakuConsumer => row.enable_danmaku_consumer,
            Self::Webhook => row.enable_webhook,
            Self::Bot => row.enable_bot,
            Self::AdvancedStats => row.enable_advanced_stats,
            Self::TaskQueue => row.enable_task_queue,
        }
    }
}

struct CachedFlags {
    row: Option<IntegrationFeatureSettingDbModel>,
    loaded_at: Instant,
}

/// Reads the feature row through a 10 second cache.
pub struct FeatureGate {
    settings: Arc<dyn SettingsRepository>,
    cache: Mutex<Option<CachedFlags>>,
    ttl: Duration,
}

impl FeatureGate {
    pub fn new(settings: Arc<dyn SettingsRepository>) -> Self {
        Self::with_ttl(settings, FEATURE_CACHE_TTL)
    }

    pub fn with_ttl(settings: Arc<dyn SettingsRepository>, ttl: Duration) -> Self {
        Self {
            settings,
            cache: Mutex::new(None),
            ttl,
        }
    }

    /// Current flag row, `None` when it does not exist.
    pub async fn flags(&self) -> Result<Option<IntegrationFeatureSettingDbModel>> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref()
                && cached.loaded_at.elapsed() < self.ttl
            {
                return Ok(cached.row.clone());
            }
        }

        let row = self.settings.get_integration_feature_setting().await?;
        *self.cache.lock() = Some(CachedFlags {
            row: row.clone(),
            loaded_at: Instant::now(),
        });
        Ok(row)
    }

    /// Whether `feature` is effectively enabled. Store errors read as disabled.
    pub async fn enabled(&self, feature: Feature) -> bool {
        match self.flags().await {
            Ok(row) => feature.enabled_in(row.as_ref()),
            Err(e) => {
                warn!(feature = %feature, error = %e, "Failed to load feature flags");
                false
            }
        }
    }

    /// Drop the cached row so the next read hits the store.
    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_mode_overrides_flags() {
        let mut row = IntegrationFeatureSettingDbModel::default();
        assert!(Feature::Webhook.enabled_in(Some(&row)));

        row.simple_mode = true;
        for feature in [
            Feature::DanmakuConsumer,
            Feature::Webhook,
            Feature::Bot,
            Feature::AdvancedStats,
            Feature::TaskQueue,
        ] {
            assert!(!feature.enabled_in(Some(&row)));
        }
    }

    #[test]
    fn test_missing_row_disables() {
        assert!(!Feature::TaskQueue.enabled_in(None));
    }

    #[test]
    fn test_individual_flag() {
        let row = IntegrationFeatureSettingDbModel {
            enable_bot: false,
            ..Default::default()
        };
        assert!(!Feature::Bot.enabled_in(Some(&row)));
        assert!(Feature::Webhook.enabled_in(Some(&row)));
        assert_eq!(Feature::DanmakuConsumer.to_string(), "danmaku_consumer");
    }
}
