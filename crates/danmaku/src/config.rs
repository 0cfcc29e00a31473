//! Message-stream provider configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TOKEN_ENDPOINT: &str =
    "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo";

/// Settings for one message-stream session.
///
/// Deserialized from the consumer's `configJson`; every field is optional and
/// the accessors clamp to the supported ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageStreamConfig {
    pub room_id: i64,
    pub token_endpoint: String,
    pub nav_endpoint: Option<String>,
    pub use_wbi: bool,
    pub use_cookie: bool,
    pub uid: i64,
    pub protover: i64,
    pub platform: String,
    #[serde(rename = "type")]
    pub auth_type: i64,
    pub web_location: String,
    pub ws_host: Option<String>,
    pub ws_port: Option<u16>,
    pub ws_path: String,
    pub prefer_wss: bool,
    pub connect_timeout_sec: u64,
    pub read_window_sec: Option<u64>,
    pub heartbeat_sec: u64,
    pub max_messages: usize,
    pub include_commands: Vec<String>,
    pub exclude_commands: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub buvid3: Option<String>,
}

impl Default for MessageStreamConfig {
    fn default() -> Self {
        Self {
            room_id: 0,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            nav_endpoint: None,
            use_wbi: true,
            use_cookie: true,
            uid: 0,
            protover: 3,
            platform: "web".to_string(),
            auth_type: 2,
            web_location: "444.8".to_string(),
            ws_host: None,
            ws_port: None,
            ws_path: "/sub".to_string(),
            prefer_wss: true,
            connect_timeout_sec: 10,
            read_window_sec: None,
            heartbeat_sec: 30,
            max_messages: 50,
            include_commands: Vec::new(),
            exclude_commands: Vec::new(),
            headers: BTreeMap::new(),
            buvid3: None,
        }
    }
}

impl MessageStreamConfig {
    /// Parse `configJson`; blank input yields the defaults.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec.clamp(1, 60))
    }

    /// Read window; defaults to `max(8, 2 * poll_interval_sec)`.
    pub fn read_window(&self, poll_interval_sec: u64) -> Duration {
        let secs = self
            .read_window_sec
            .unwrap_or_else(|| poll_interval_sec.saturating_mul(2).max(8));
        Duration::from_secs(secs.clamp(2, 300))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sec.clamp(10, 60))
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages.clamp(1, 2000)
    }

    pub fn token_endpoint(&self) -> &str {
        let endpoint = self.token_endpoint.trim();
        if endpoint.is_empty() {
            DEFAULT_TOKEN_ENDPOINT
        } else {
            endpoint
        }
    }

    pub fn ws_path(&self) -> String {
        let path = self.ws_path.trim();
        match path {
            "" => "/sub".to_string(),
            p if p.starts_with('/') => p.to_string(),
            p => format!("/{p}"),
        }
    }

    /// Whether `command` passes the include/exclude lists.
    ///
    /// Matching is exact on the normalized (uppercase) command.
    pub fn accepts_command(&self, command: &str) -> bool {
        let matches = |list: &[String]| list.iter().any(|c| c.trim().eq_ignore_ascii_case(command));
        if !self.include_commands.is_empty() && !matches(&self.include_commands) {
            return false;
        }
        !matches(&self.exclude_commands)
    }
}
