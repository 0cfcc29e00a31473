//! Message-stream provider: one bounded WebSocket session per poll.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use danmaku::{ChatRecord, ChatSink, MessageStreamClient, MessageStreamConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::dispatch::{DanmakuDispatcher, DanmakuMessage};
use super::{PollReport, provider_source};
use crate::database::models::DanmakuConsumerSettingDbModel;
use crate::database::time::now_ms;
use crate::{Error, Result};

pub const PROVIDER_MESSAGE_STREAM: &str = "bilibili_message_stream";

const TOKEN_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Room id from the setting, else from the provider config.
pub fn resolve_room_id(setting: &DanmakuConsumerSettingDbModel) -> Option<i64> {
    if setting.room_id > 0 {
        return Some(setting.room_id);
    }
    MessageStreamConfig::from_json(&setting.config_json)
        .ok()
        .map(|config| config.room_id)
        .filter(|id| *id > 0)
}

/// Dispatches decoded chat records as they arrive.
struct DispatchSink<'a> {
    dispatcher: &'a dyn DanmakuDispatcher,
    source: String,
    previous_cursor: String,
    cursor: Option<String>,
    index: usize,
    processed: usize,
    matched: usize,
    failures: Vec<String>,
}

#[async_trait]
impl<'a> ChatSink for DispatchSink<'a> {
    async fn accept(&mut self, record: ChatRecord) -> bool {
        let cursor = record.cursor(&self.previous_cursor, self.index);
        self.index += 1;

        let message = DanmakuMessage {
            room_id: record.room_id,
            uid: record.uid.to_string(),
            uname: record.uname,
            content: record.content,
            source: self.source.clone(),
            raw_payload: record.raw,
            received_at: now_ms(),
        };
        match self.dispatcher.dispatch(&message).await {
            Ok(matched) => {
                self.processed += 1;
                self.matched += matched;
            }
            Err(e) => {
                warn!(room_id = message.room_id, error = %e, "Failed to dispatch danmaku");
                self.failures.push(e.to_string());
            }
        }
        self.cursor = Some(cursor);
        true
    }
}

pub struct MessageStreamProvider {
    client: MessageStreamClient,
    cookie_file: Option<PathBuf>,
}

impl MessageStreamProvider {
    pub fn new(cookie_file: Option<PathBuf>) -> Result<Self> {
        let http = danmaku::http::build_client(TOKEN_HTTP_TIMEOUT)?;
        Ok(Self {
            client: MessageStreamClient::new(http),
            cookie_file,
        })
    }

    async fn load_cookie(&self) -> Option<String> {
        let path = self.cookie_file.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Some(content.trim().to_string()).filter(|c| !c.is_empty()),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Cookie file not readable");
                None
            }
        }
    }

    pub async fn poll_once(
        &self,
        setting: &DanmakuConsumerSettingDbModel,
        dispatcher: &dyn DanmakuDispatcher,
        cancel: &CancellationToken,
    ) -> Result<PollReport> {
        let config = MessageStreamConfig::from_json(&setting.config_json)
            .map_err(|e| Error::config(format!("invalid message stream config: {e}")))?;
        let room_id = resolve_room_id(setting)
            .ok_or_else(|| Error::config("message stream requires roomId > 0"))?;

        let cookie = if config.use_cookie {
            self.load_cookie().await
        } else {
            None
        };
        let read_window = config.read_window(setting.poll_interval_secs());

        let mut sink = DispatchSink {
            dispatcher,
            source: provider_source(PROVIDER_MESSAGE_STREAM),
            previous_cursor: setting.cursor.clone(),
            cursor: None,
            index: 0,
            processed: 0,
            matched: 0,
            failures: Vec::new(),
        };

        let summary = self
            .client
            .poll(
                room_id,
                &config,
                read_window,
                cookie.as_deref(),
                &mut sink,
                cancel,
            )
            .await?;

        // Cancelled or interrupted sessions still report the records they dispatched.
        let dispatch_error = sink
            .failures
            .first()
            .map(|first| format!("{} dispatch failure(s): {first}", sink.failures.len()))
            .or_else(|| {
                summary
                    .transport_error
                    .as_ref()
                    .map(|e| format!("stream interrupted: {e}"))
            });
        Ok(PollReport {
            fetched: summary.fetched,
            processed: sink.processed,
            matched: sink.matched,
            cursor: sink.cursor.unwrap_or_else(|| setting.cursor.clone()),
            dispatch_error,
            stream: Some(summary),
        })
    }
}
