//! Danmaku ingest consumer.
//!
//! A single loop ticks every second. When the `danmaku_consumer` feature and
//! the stored setting allow it, and the poll interval has elapsed, it runs
//! one poll against the configured provider, dispatches every message and
//! persists the advanced cursor.

pub mod dispatch;
pub mod http_polling;
pub mod json_path;
pub mod message_stream;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::models::{
    DanmakuConsumerSettingDbModel, EVENT_CONSUMER_ERROR, EVENT_CONSUMER_POLL,
};
use crate::database::repositories::Store;
use crate::database::time::now_ms;
use crate::integration::{Feature, FeatureGate};
use crate::utils::truncate_chars;
use crate::{Error, Result};

pub use dispatch::{DanmakuDispatcher, DanmakuMessage, KeywordRuleDispatcher, NoopDispatcher};
pub use http_polling::{HttpPollingProvider, PROVIDER_HTTP_POLLING};
pub use message_stream::{MessageStreamProvider, PROVIDER_MESSAGE_STREAM};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Stored consumer `lastError` values are truncated to this many characters.
pub const MAX_CONSUMER_ERROR_CHARS: usize = 1000;

/// Default `source` of messages from `provider`.
pub fn provider_source(provider: &str) -> String {
    format!("consumer.{provider}")
}

/// Result of one provider poll.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    /// Items returned by the provider.
    pub fetched: usize,
    /// Messages dispatched without error.
    pub processed: usize,
    /// Rules matched across all messages.
    pub matched: usize,
    pub cursor: String,
    /// Summary of per-message dispatch failures.
    pub dispatch_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<danmaku::PollSummary>,
}

/// In-process consumer state, rebuilt on every start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRuntime {
    pub running: bool,
    pub last_poll_at: Option<i64>,
    pub last_cursor: String,
    pub last_error: String,
    pub last_fetched: usize,
    pub last_processed: usize,
    pub last_matched: usize,
    pub updated_at: i64,
}

/// What a consumer tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerTick {
    /// The `danmaku_consumer` feature is off.
    FeatureDisabled,
    /// The setting is disabled or incomplete.
    Inactive,
    /// The poll interval has not elapsed.
    NotDue,
    Polled,
    Failed,
    Cancelled,
}

/// Whether `setting` carries everything its provider needs.
pub fn config_complete(setting: &DanmakuConsumerSettingDbModel) -> bool {
    match setting.provider.trim() {
        PROVIDER_HTTP_POLLING => !setting.endpoint.trim().is_empty(),
        PROVIDER_MESSAGE_STREAM => message_stream::resolve_room_id(setting).is_some(),
        _ => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Persisted cookie for the message-stream provider.
    pub cookie_file: Option<PathBuf>,
}

pub struct DanmakuConsumer {
    store: Arc<dyn Store>,
    features: Arc<FeatureGate>,
    dispatcher: Arc<dyn DanmakuDispatcher>,
    http_polling: HttpPollingProvider,
    message_stream: MessageStreamProvider,
    runtime: Mutex<ConsumerRuntime>,
    next_poll_at: Mutex<Option<Instant>>,
}

impl DanmakuConsumer {
    pub fn new(
        store: Arc<dyn Store>,
        features: Arc<FeatureGate>,
        dispatcher: Arc<dyn DanmakuDispatcher>,
        options: ConsumerOptions,
    ) -> Result<Self> {
        Ok(Self {
            store,
            features,
            dispatcher,
            http_polling: HttpPollingProvider::new()?,
            message_stream: MessageStreamProvider::new(options.cookie_file)?,
            runtime: Mutex::new(ConsumerRuntime::default()),
            next_poll_at: Mutex::new(None),
        })
    }

    /// Snapshot of the in-process runtime state.
    pub fn runtime(&self) -> ConsumerRuntime {
        self.runtime.lock().clone()
    }

    fn set_running(&self, running: bool) {
        let mut runtime = self.runtime.lock();
        if runtime.running != running {
            runtime.running = running;
            runtime.updated_at = now_ms();
        }
    }

    /// Tick every second until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Danmaku consumer started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(&cancel).await;
                }
            }
        }
        self.set_running(false);
        info!("Danmaku consumer stopped");
    }

    pub async fn tick(&self, cancel: &CancellationToken) -> ConsumerTick {
        if !self.features.enabled(Feature::DanmakuConsumer).await {
            self.set_running(false);
            return ConsumerTick::FeatureDisabled;
        }

        let setting = match self.store.get_danmaku_consumer_setting().await {
            Ok(setting) => setting,
            Err(e) => {
                warn!(error = %e, "Failed to load danmaku consumer setting");
                return ConsumerTick::Failed;
            }
        };
        if !setting.enabled || !config_complete(&setting) {
            self.set_running(false);
            return ConsumerTick::Inactive;
        }
        self.set_running(true);

        let now = Instant::now();
        if self.next_poll_at.lock().is_some_and(|at| now < at) {
            return ConsumerTick::NotDue;
        }

        let result = self.poll_once(&setting, cancel).await;
        *self.next_poll_at.lock() =
            Some(Instant::now() + Duration::from_secs(setting.poll_interval_secs()));

        match result {
            Ok(report) => {
                self.record_success(&setting, report).await;
                ConsumerTick::Polled
            }
            Err(e) if e.is_cancelled() => {
                debug!("Danmaku poll cancelled");
                ConsumerTick::Cancelled
            }
            Err(e) => {
                self.record_failure(&setting, &e).await;
                ConsumerTick::Failed
            }
        }
    }

    /// Run one poll with the provider named by `setting`.
    pub async fn poll_once(
        &self,
        setting: &DanmakuConsumerSettingDbModel,
        cancel: &CancellationToken,
    ) -> Result<PollReport> {
        let dispatcher = self.dispatcher.as_ref();
        match setting.provider.trim() {
            PROVIDER_HTTP_POLLING => {
                self.http_polling
                    .poll_once(setting, dispatcher, cancel)
                    .await
            }
            PROVIDER_MESSAGE_STREAM => {
                self.message_stream
                    .poll_once(setting, dispatcher, cancel)
                    .await
            }
            other => Err(Error::config(format!(
                "unsupported danmaku provider: {other}"
            ))),
        }
    }

    async fn record_success(&self, setting: &DanmakuConsumerSettingDbModel, report: PollReport) {
        let at = now_ms();
        let last_error = report
            .dispatch_error
            .as_deref()
            .map(|e| truncate_chars(e, MAX_CONSUMER_ERROR_CHARS))
            .unwrap_or_default();

        if let Err(e) = self
            .store
            .update_danmaku_consumer_runtime(&report.cursor, &last_error, at)
            .await
        {
            warn!(error = %e, "Failed to persist danmaku consumer cursor");
        }

        {
            let mut runtime = self.runtime.lock();
            runtime.last_poll_at = Some(at);
            runtime.last_cursor = report.cursor.clone();
            runtime.last_error = last_error;
            runtime.last_fetched = report.fetched;
            runtime.last_processed = report.processed;
            runtime.last_matched = report.matched;
            runtime.updated_at = at;
        }

        debug!(
            provider = %setting.provider,
            fetched = report.fetched,
            processed = report.processed,
            matched = report.matched,
            cursor = %report.cursor,
            "Danmaku poll completed"
        );
        let mut payload = json!({
            "provider": setting.provider,
            "fetched": report.fetched,
            "processed": report.processed,
            "matched": report.matched,
            "cursor": report.cursor,
        });
        if let (Some(stream), Value::Object(map)) = (&report.stream, &mut payload) {
            map.insert("stream".to_string(), json!(stream));
        }
        self.emit(EVENT_CONSUMER_POLL, payload).await;
    }

    /// Persist a failed poll. The cursor is left unchanged.
    ///
    /// Runs to completion even when shutdown is in progress.
    async fn record_failure(&self, setting: &DanmakuConsumerSettingDbModel, error: &Error) {
        let at = now_ms();
        let message = truncate_chars(&error.to_string(), MAX_CONSUMER_ERROR_CHARS);
        warn!(provider = %setting.provider, error = %message, "Danmaku poll failed");

        if let Err(e) = self
            .store
            .update_danmaku_consumer_runtime(&setting.cursor, &message, at)
            .await
        {
            warn!(error = %e, "Failed to persist danmaku consumer error");
        }

        {
            let mut runtime = self.runtime.lock();
            runtime.last_poll_at = Some(at);
            runtime.last_cursor = setting.cursor.clone();
            runtime.last_error = message.clone();
            runtime.last_fetched = 0;
            runtime.last_processed = 0;
            runtime.last_matched = 0;
            runtime.updated_at = at;
        }

        self.emit(
            EVENT_CONSUMER_ERROR,
            json!({
                "provider": setting.provider,
                "error": message,
                "cursor": setting.cursor,
            }),
        )
        .await;
    }

    async fn emit(&self, event_type: &str, payload: Value) {
        if let Err(e) = self
            .store
            .create_live_event(event_type, &payload.to_string())
            .await
        {
            warn!(event_type, error = %e, "Failed to record consumer event");
        }
    }
}
