//! Integration service: the long-lived owner of queue state.
//!
//! Holds the store handle, feature gate, queue settings cache, rate limiter
//! and executor registry. The scheduler and workers borrow it through an
//! `Arc`; nothing here lives in module-level statics.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use super::executor::ExecutorRegistry;
use super::feature::{Feature, FeatureGate};
use super::payload::{BotTaskPayload, WebhookTaskPayload, raw_json};
use super::queue_config::QueueSettingsCache;
use super::rate_limiter::KeyedRateLimiter;
use crate::database::models::{
    EVENT_TASK_QUEUED, IntegrationFeatureSettingDbModel, IntegrationQueueSettingDbModel,
    IntegrationTaskDbModel, NewIntegrationTask, TaskStatus, TaskType,
};
use crate::database::repositories::Store;
use crate::{Error, Result};

/// Request to enqueue a webhook delivery.
#[derive(Debug, Clone, Default)]
pub struct EnqueueWebhook {
    pub webhook_id: Option<i64>,
    pub webhook_name: String,
    pub url: String,
    pub secret: String,
    pub event_type: String,
    /// Raw JSON request body. Blank means `{}`.
    pub payload: String,
    pub priority: Option<i64>,
    pub max_attempts: Option<i64>,
    /// Defaults to `webhook:<id>` or `webhook:<host>`.
    pub rate_key: Option<String>,
}

/// Request to enqueue a bot command.
#[derive(Debug, Clone, Default)]
pub struct EnqueueBot {
    pub provider: String,
    pub command: String,
    /// Raw JSON parameters. Blank means `{}`.
    pub params: String,
    pub priority: Option<i64>,
    pub max_attempts: Option<i64>,
    /// Defaults to `bot:<provider>`.
    pub rate_key: Option<String>,
}

fn explicit_rate_key(rate_key: Option<&str>) -> Option<String> {
    rate_key
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

pub struct IntegrationService {
    store: Arc<dyn Store>,
    features: Arc<FeatureGate>,
    queue: QueueSettingsCache,
    limiter: KeyedRateLimiter,
    executors: ExecutorRegistry,
}

impl IntegrationService {
    pub fn new(store: Arc<dyn Store>, executors: ExecutorRegistry) -> Self {
        let features = Arc::new(FeatureGate::new(store.clone()));
        Self::with_feature_gate(store, features, executors)
    }

    pub fn with_feature_gate(
        store: Arc<dyn Store>,
        features: Arc<FeatureGate>,
        executors: ExecutorRegistry,
    ) -> Self {
        Self {
            queue: QueueSettingsCache::new(store.clone()),
            store,
            features,
            limiter: KeyedRateLimiter::new(),
            executors,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn features(&self) -> &Arc<FeatureGate> {
        &self.features
    }

    pub(crate) fn queue(&self) -> &QueueSettingsCache {
        &self.queue
    }

    pub(crate) fn limiter(&self) -> &KeyedRateLimiter {
        &self.limiter
    }

    pub(crate) fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// Fail with [`Error::FeatureDisabled`] unless both the task queue and
    /// `feature` are enabled.
    async fn ensure_enabled(&self, feature: Feature) -> Result<()> {
        for feature in [Feature::TaskQueue, feature] {
            if !self.features.enabled(feature).await {
                return Err(Error::FeatureDisabled(feature));
            }
        }
        Ok(())
    }

    pub async fn enqueue_webhook_task(&self, request: EnqueueWebhook) -> Result<i64> {
        let url = Url::parse(request.url.trim())
            .map_err(|e| Error::validation(format!("invalid webhook url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::validation(format!(
                "unsupported webhook url scheme: {}",
                url.scheme()
            )));
        }
        let body = raw_json(&request.payload)
            .map_err(|e| Error::validation(format!("invalid webhook payload: {e}")))?;

        self.ensure_enabled(Feature::Webhook).await?;

        let rate_key = explicit_rate_key(request.rate_key.as_deref()).unwrap_or_else(|| {
            match request.webhook_id {
                Some(id) => format!("webhook:{id}"),
                None => format!("webhook:{}", url.host_str().unwrap_or_default()),
            }
        });

        let payload = WebhookTaskPayload {
            webhook_id: request.webhook_id,
            webhook_name: request.webhook_name,
            url: url.to_string(),
            secret: request.secret,
            event_type: request.event_type,
            payload: Some(body),
        };

        let mut task = NewIntegrationTask::new(TaskType::Webhook, serde_json::to_string(&payload)?)
            .with_rate_key(rate_key);
        task.priority = request.priority;
        task.max_attempts = request.max_attempts;
        self.create_task(task).await
    }

    pub async fn enqueue_bot_task(&self, request: EnqueueBot) -> Result<i64> {
        let provider = request.provider.trim();
        let command = request.command.trim();
        if provider.is_empty() {
            return Err(Error::validation("bot provider is required"));
        }
        if command.is_empty() {
            return Err(Error::validation("bot command is required"));
        }
        let params = raw_json(&request.params)
            .map_err(|e| Error::validation(format!("invalid bot params: {e}")))?;

        self.ensure_enabled(Feature::Bot).await?;

        let rate_key = explicit_rate_key(request.rate_key.as_deref())
            .unwrap_or_else(|| format!("bot:{provider}"));
        let payload = BotTaskPayload {
            provider: provider.to_string(),
            command: command.to_string(),
            params: Some(params),
        };

        let mut task = NewIntegrationTask::new(TaskType::Bot, serde_json::to_string(&payload)?)
            .with_rate_key(rate_key);
        task.priority = request.priority;
        task.max_attempts = request.max_attempts;
        self.create_task(task).await
    }

    async fn create_task(&self, task: NewIntegrationTask) -> Result<i64> {
        let id = self.store.create_integration_task(&task).await?;
        info!(
            task_id = id,
            task_type = %task.task_type,
            rate_key = %task.rate_key,
            "Integration task queued"
        );
        self.emit(
            EVENT_TASK_QUEUED,
            json!({
                "taskId": id,
                "taskType": task.task_type,
                "priority": task.effective_priority(),
                "maxAttempts": task.effective_max_attempts(),
                "rateKey": task.rate_key,
            }),
        )
        .await;
        Ok(id)
    }

    /// Re-run a dead or cancelled task from its first attempt.
    pub async fn retry_task(&self, id: i64) -> Result<()> {
        self.store.retry_integration_task(id).await?;
        info!(task_id = id, "Integration task re-queued manually");
        Ok(())
    }

    pub async fn cancel_task(&self, id: i64) -> Result<()> {
        self.store.cancel_integration_task(id).await?;
        info!(task_id = id, "Integration task cancelled");
        Ok(())
    }

    pub async fn get_task(&self, id: i64) -> Result<IntegrationTaskDbModel> {
        self.store.get_integration_task(id).await
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<IntegrationTaskDbModel>> {
        self.store.list_integration_tasks(status, limit).await
    }

    /// Current queue tunables, clamped.
    pub async fn queue_settings(&self) -> IntegrationQueueSettingDbModel {
        self.queue.get().await
    }

    /// Worker count and lease interval changes apply on the next start.
    pub async fn save_queue_settings(&self, setting: &IntegrationQueueSettingDbModel) -> Result<()> {
        self.store.save_integration_queue_setting(setting).await?;
        self.queue.invalidate();
        Ok(())
    }

    pub async fn save_feature_settings(
        &self,
        setting: &IntegrationFeatureSettingDbModel,
    ) -> Result<()> {
        self.store.save_integration_feature_setting(setting).await?;
        self.features.invalidate();
        Ok(())
    }

    /// Best-effort event log write.
    pub(crate) async fn emit(&self, event_type: &str, payload: Value) {
        match self
            .store
            .create_live_event(event_type, &payload.to_string())
            .await
        {
            Ok(_) => debug!(event_type, "Live event recorded"),
            Err(e) => warn!(event_type, error = %e, "Failed to record live event"),
        }
    }
}
