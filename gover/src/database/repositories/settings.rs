//! Singleton settings repository.
//!
//! Each settings table holds at most one row with `id = 1`. Saves are upserts.

use async_trait::async_trait;

use super::SqlxStore;
use crate::Result;
use crate::database::models::{
    DanmakuConsumerSettingDbModel, IntegrationFeatureSettingDbModel,
    IntegrationQueueSettingDbModel,
};
use crate::database::time::now_ms;

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Returns the defaults when no row was saved yet.
    async fn get_danmaku_consumer_setting(&self) -> Result<DanmakuConsumerSettingDbModel>;
    async fn save_danmaku_consumer_setting(
        &self,
        setting: &DanmakuConsumerSettingDbModel,
    ) -> Result<()>;
    /// Persist the cursor and runtime fields written after every poll.
    async fn update_danmaku_consumer_runtime(
        &self,
        cursor: &str,
        last_error: &str,
        at: i64,
    ) -> Result<()>;

    /// Returns the defaults when no row was saved yet.
    async fn get_integration_queue_setting(&self) -> Result<IntegrationQueueSettingDbModel>;
    async fn save_integration_queue_setting(
        &self,
        setting: &IntegrationQueueSettingDbModel,
    ) -> Result<()>;

    /// `None` when the row is missing, which disables every feature.
    async fn get_integration_feature_setting(
        &self,
    ) -> Result<Option<IntegrationFeatureSettingDbModel>>;
    async fn save_integration_feature_setting(
        &self,
        setting: &IntegrationFeatureSettingDbModel,
    ) -> Result<()>;
}

#[async_trait]
impl SettingsRepository for SqlxStore {
    async fn get_danmaku_consumer_setting(&self) -> Result<DanmakuConsumerSettingDbModel> {
        let setting = sqlx::query_as::<_, DanmakuConsumerSettingDbModel>(
            "SELECT * FROM danmaku_consumer_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(setting.unwrap_or_default())
    }

    async fn save_danmaku_consumer_setting(
        &self,
        setting: &DanmakuConsumerSettingDbModel,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO danmaku_consumer_settings
                (id, enabled, provider, endpoint, auth_token, config_json, poll_interval_sec,
                 batch_size, room_id, cursor, last_poll_at, last_error, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                provider = excluded.provider,
                endpoint = excluded.endpoint,
                auth_token = excluded.auth_token,
                config_json = excluded.config_json,
                poll_interval_sec = excluded.poll_interval_sec,
                batch_size = excluded.batch_size,
                room_id = excluded.room_id,
                cursor = excluded.cursor,
                last_poll_at = excluded.last_poll_at,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(setting.enabled)
        .bind(setting.provider.trim())
        .bind(setting.endpoint.trim())
        .bind(&setting.auth_token)
        .bind(if setting.config_json.trim().is_empty() {
            "{}"
        } else {
            setting.config_json.as_str()
        })
        .bind(setting.poll_interval_secs() as i64)
        .bind(setting.batch_limit())
        .bind(setting.room_id)
        .bind(&setting.cursor)
        .bind(setting.last_poll_at)
        .bind(&setting.last_error)
        .bind(now_ms())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn update_danmaku_consumer_runtime(
        &self,
        cursor: &str,
        last_error: &str,
        at: i64,
    ) -> Result<()> {
        // The row may not exist yet when the consumer runs on defaults.
        sqlx::query(
            r#"
            INSERT INTO danmaku_consumer_settings (id, cursor, last_error, last_poll_at, updated_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                cursor = excluded.cursor,
                last_error = excluded.last_error,
                last_poll_at = excluded.last_poll_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(cursor)
        .bind(last_error)
        .bind(at)
        .bind(at)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn get_integration_queue_setting(&self) -> Result<IntegrationQueueSettingDbModel> {
        let setting = sqlx::query_as::<_, IntegrationQueueSettingDbModel>(
            "SELECT * FROM integration_queue_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(setting.unwrap_or_default())
    }

    async fn save_integration_queue_setting(
        &self,
        setting: &IntegrationQueueSettingDbModel,
    ) -> Result<()> {
        let setting = setting.clamped();
        sqlx::query(
            r#"
            INSERT INTO integration_queue_settings
                (id, webhook_rate_gap_ms, bot_rate_gap_ms, max_workers, lease_interval_ms, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                webhook_rate_gap_ms = excluded.webhook_rate_gap_ms,
                bot_rate_gap_ms = excluded.bot_rate_gap_ms,
                max_workers = excluded.max_workers,
                lease_interval_ms = excluded.lease_interval_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(setting.webhook_rate_gap_ms)
        .bind(setting.bot_rate_gap_ms)
        .bind(setting.max_workers)
        .bind(setting.lease_interval_ms)
        .bind(now_ms())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    async fn get_integration_feature_setting(
        &self,
    ) -> Result<Option<IntegrationFeatureSettingDbModel>> {
        let setting = sqlx::query_as::<_, IntegrationFeatureSettingDbModel>(
            "SELECT * FROM integration_feature_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(setting)
    }

    async fn save_integration_feature_setting(
        &self,
        setting: &IntegrationFeatureSettingDbModel,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO integration_feature_settings
                (id, simple_mode, enable_danmaku_consumer, enable_webhook, enable_bot,
                 enable_advanced_stats, enable_task_queue, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                simple_mode = excluded.simple_mode,
                enable_danmaku_consumer = excluded.enable_danmaku_consumer,
                enable_webhook = excluded.enable_webhook,
                enable_bot = excluded.enable_bot,
                enable_advanced_stats = excluded.enable_advanced_stats,
                enable_task_queue = excluded.enable_task_queue,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(setting.simple_mode)
        .bind(setting.enable_danmaku_consumer)
        .bind(setting.enable_webhook)
        .bind(setting.enable_bot)
        .bind(setting.enable_advanced_stats)
        .bind(setting.enable_task_queue)
        .bind(now_ms())
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }
}
