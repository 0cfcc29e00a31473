//! HTTP polling provider.
//!
//! One poll issues one request built from the consumer setting and its
//! `configJson`, maps the response items to [`DanmakuMessage`]s through
//! configurable JSON paths, dispatches them and derives the next cursor.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::dispatch::{DanmakuDispatcher, DanmakuMessage};
use super::json_path::{PathCandidates, scalar_string};
use super::{PollReport, provider_source};
use crate::database::models::DanmakuConsumerSettingDbModel;
use crate::database::time::now_ms;
use crate::utils::truncate_chars;
use crate::{Error, Result};

pub const PROVIDER_HTTP_POLLING: &str = "http_polling";

const CONSUMER_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;
const MAX_ERROR_BODY_CHARS: usize = 400;

const DEFAULT_ITEMS_PATHS: &str =
    "items|messages|records|list|data.items|data.messages|data.records|data.list|data";
const DEFAULT_ROOM_ID_PATHS: &str = "roomId|room_id|roomid|room.id";
const DEFAULT_UID_PATHS: &str = "uid|userId|user_id|user.id|sender.uid";
const DEFAULT_UNAME_PATHS: &str = "uname|username|userName|nickname|user.name|sender.uname";
const DEFAULT_CONTENT_PATHS: &str = "content|message|msg|text|danmaku";
const DEFAULT_SOURCE_PATHS: &str = "source";
const DEFAULT_RESPONSE_CURSOR_PATHS: &str =
    "nextCursor|next_cursor|cursor|data.nextCursor|data.next_cursor|data.cursor";
const DEFAULT_ITEM_CURSOR_PATHS: &str = "cursor|id|msgId|msg_id";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    #[default]
    Bearer,
    Header,
    Query,
    Body,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Header, query or body field name.
    pub name: String,
    /// Value prefix. Defaults to `Bearer ` in bearer mode and to nothing
    /// otherwise.
    pub prefix: Option<String>,
    /// Overrides the setting's `authToken`.
    pub token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldLocation {
    #[default]
    Query,
    Body,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorMode {
    #[default]
    Cursor,
    Offset,
    Page,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PagingConfig {
    pub cursor_field: String,
    pub cursor_in: FieldLocation,
    pub cursor_mode: CursorMode,
    pub response_cursor_path: String,
    pub item_cursor_path: String,
    pub start_cursor: String,
    pub limit_field: String,
    pub limit_in: FieldLocation,
    pub room_id_field: String,
    pub room_id_in: FieldLocation,
    pub page_step: i64,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            cursor_field: "cursor".to_string(),
            cursor_in: FieldLocation::Query,
            cursor_mode: CursorMode::Cursor,
            response_cursor_path: String::new(),
            item_cursor_path: String::new(),
            start_cursor: String::new(),
            limit_field: "limit".to_string(),
            limit_in: FieldLocation::Query,
            room_id_field: "roomId".to_string(),
            room_id_in: FieldLocation::Query,
            page_step: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MappingConfig {
    pub items_path: String,
    pub room_id_path: String,
    pub uid_path: String,
    pub uname_path: String,
    pub content_path: String,
    pub raw_payload_path: String,
    pub source_path: String,
}

/// `configJson` of an `http_polling` consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpPollingConfig {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, Value>,
    pub body: Map<String, Value>,
    pub auth: AuthConfig,
    pub paging: PagingConfig,
    pub mapping: MappingConfig,
}

impl Default for HttpPollingConfig {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: Map::new(),
            auth: AuthConfig::default(),
            paging: PagingConfig::default(),
            mapping: MappingConfig::default(),
        }
    }
}

impl HttpPollingConfig {
    /// Blank input yields the defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| Error::config(format!("invalid http polling config: {e}")))
    }
}

/// Response mapping with every candidate list parsed once per poll.
struct ItemMapping {
    items: PathCandidates,
    room_id: PathCandidates,
    uid: PathCandidates,
    uname: PathCandidates,
    content: PathCandidates,
    raw_payload: PathCandidates,
    source: PathCandidates,
    response_cursor: PathCandidates,
    item_cursor: PathCandidates,
}

impl ItemMapping {
    fn new(config: &HttpPollingConfig) -> Result<Self> {
        let parse = |configured: &str, defaults: &str| {
            PathCandidates::parse(configured, defaults).map_err(|e| Error::config(e.to_string()))
        };
        let m = &config.mapping;
        let p = &config.paging;
        // Cursor path defaults only make sense for opaque cursors; offsets and
        // pages fall back to arithmetic instead.
        let (response_defaults, item_defaults) = match p.cursor_mode {
            CursorMode::Cursor => (DEFAULT_RESPONSE_CURSOR_PATHS, DEFAULT_ITEM_CURSOR_PATHS),
            CursorMode::Offset | CursorMode::Page => ("", ""),
        };
        Ok(Self {
            items: parse(&m.items_path, DEFAULT_ITEMS_PATHS)?,
            room_id: parse(&m.room_id_path, DEFAULT_ROOM_ID_PATHS)?,
            uid: parse(&m.uid_path, DEFAULT_UID_PATHS)?,
            uname: parse(&m.uname_path, DEFAULT_UNAME_PATHS)?,
            content: parse(&m.content_path, DEFAULT_CONTENT_PATHS)?,
            raw_payload: parse(&m.raw_payload_path, "")?,
            source: parse(&m.source_path, DEFAULT_SOURCE_PATHS)?,
            response_cursor: parse(&p.response_cursor_path, response_defaults)?,
            item_cursor: parse(&p.item_cursor_path, item_defaults)?,
        })
    }

    fn items<'a>(&self, root: &'a Value) -> &'a [Value] {
        if let Some(items) = self.items.first_array(root) {
            return items;
        }
        root.as_array().map(Vec::as_slice).unwrap_or(&[])
    }

    fn message(&self, item: &Value, fallback_room_id: i64) -> Option<DanmakuMessage> {
        let room_id = self
            .room_id
            .first_i64(item)
            .filter(|id| *id > 0)
            .unwrap_or(fallback_room_id);
        let content = self.content.first_string(item).unwrap_or_default();
        if room_id <= 0 || content.is_empty() {
            return None;
        }

        let raw_payload = match self.raw_payload.first(item) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => item.to_string(),
        };
        Some(DanmakuMessage {
            room_id,
            uid: self.uid.first_string(item).unwrap_or_default(),
            uname: self.uname.first_string(item).unwrap_or_default(),
            content,
            source: self
                .source
                .first_string(item)
                .unwrap_or_else(|| provider_source(PROVIDER_HTTP_POLLING)),
            raw_payload,
            received_at: now_ms(),
        })
    }
}

/// Cursor sent with the request: the stored one, else the configured start.
fn request_cursor(config: &HttpPollingConfig, stored: &str) -> String {
    let stored = stored.trim();
    if !stored.is_empty() {
        return stored.to_string();
    }
    let start = config.paging.start_cursor.trim();
    if !start.is_empty() {
        return start.to_string();
    }
    match config.paging.cursor_mode {
        CursorMode::Cursor => String::new(),
        CursorMode::Offset => "0".to_string(),
        CursorMode::Page => "1".to_string(),
    }
}

/// Next cursor after a poll.
///
/// Response level path first, then the item path on the last dispatched
/// item, then offset/page arithmetic, else the current cursor.
fn next_cursor(
    config: &HttpPollingConfig,
    mapping: &ItemMapping,
    response: &Value,
    last_item: Option<&Value>,
    fetched: usize,
    current: &str,
) -> String {
    if let Some(cursor) = mapping.response_cursor.first_string(response) {
        return cursor;
    }
    if let Some(cursor) = last_item.and_then(|item| mapping.item_cursor.first_string(item)) {
        return cursor;
    }
    if fetched > 0 {
        let base = current.trim().parse::<i64>().unwrap_or(0);
        match config.paging.cursor_mode {
            CursorMode::Offset => return (base + fetched as i64).to_string(),
            CursorMode::Page => return (base + config.paging.page_step.max(1)).to_string(),
            CursorMode::Cursor => {}
        }
    }
    current.to_string()
}

/// A request ready to send.
#[derive(Debug)]
struct PreparedRequest {
    method: Method,
    url: Url,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Option<Map<String, Value>>,
}

fn header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| Error::config(format!("invalid header name '{name}': {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::config(format!("invalid header value for '{name}': {e}")))?;
    Ok((name, value))
}

fn prepare_request(
    setting: &DanmakuConsumerSettingDbModel,
    config: &HttpPollingConfig,
    cursor: &str,
) -> Result<PreparedRequest> {
    let mut url = Url::parse(setting.endpoint.trim())
        .map_err(|e| Error::config(format!("invalid consumer endpoint: {e}")))?;
    let method = match config.method.trim().to_ascii_uppercase().as_str() {
        "" | "GET" => Method::GET,
        "POST" => Method::POST,
        other => {
            return Err(Error::config(format!("unsupported http method: {other}")));
        }
    };

    let mut query: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut set_query = |key: &str, value: String| {
        query.retain(|(k, _)| k != key);
        query.push((key.to_string(), value));
    };
    for (key, value) in &config.query {
        if let Some(value) = scalar_string(value) {
            set_query(key, value);
        }
    }

    let mut body = config.body.clone();
    let mut headers = Vec::new();
    for (name, value) in &config.headers {
        headers.push(header(name, value)?);
    }

    let paging = &config.paging;
    let mut place = |location: FieldLocation, field: &str, value: Value| {
        let field = field.trim();
        if field.is_empty() {
            return;
        }
        match location {
            FieldLocation::Query => {
                if let Some(value) = scalar_string(&value) {
                    set_query(field, value);
                }
            }
            FieldLocation::Body => {
                body.insert(field.to_string(), value);
            }
        }
    };

    if !cursor.is_empty() {
        let value = match paging.cursor_mode {
            CursorMode::Cursor => Value::String(cursor.to_string()),
            CursorMode::Offset | CursorMode::Page => cursor
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(cursor.to_string())),
        };
        place(paging.cursor_in, &paging.cursor_field, value);
    }
    place(paging.limit_in, &paging.limit_field, Value::from(setting.batch_limit()));
    if setting.room_id > 0 {
        place(paging.room_id_in, &paging.room_id_field, Value::from(setting.room_id));
    }

    let token = if config.auth.token.trim().is_empty() {
        setting.auth_token.trim()
    } else {
        config.auth.token.trim()
    };
    if !token.is_empty() {
        let prefix = config.auth.prefix.as_deref();
        let name = config.auth.name.trim();
        match config.auth.mode {
            AuthMode::None => {}
            AuthMode::Bearer => {
                let value = format!("{}{token}", prefix.unwrap_or("Bearer "));
                headers.push(header(AUTHORIZATION.as_str(), &value)?);
            }
            AuthMode::Header => {
                let name = if name.is_empty() { AUTHORIZATION.as_str() } else { name };
                headers.push(header(name, &format!("{}{token}", prefix.unwrap_or("")))?);
            }
            AuthMode::Query => {
                let name = if name.is_empty() { "token" } else { name };
                place(FieldLocation::Query, name, Value::String(token.to_string()));
            }
            AuthMode::Body => {
                let name = if name.is_empty() { "token" } else { name };
                place(FieldLocation::Body, name, Value::String(token.to_string()));
            }
        }
    }

    if method == Method::GET && !body.is_empty() {
        return Err(Error::config(
            "GET requests cannot carry body fields; use POST or move them to the query",
        ));
    }

    if query.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(query.iter());
    }

    Ok(PreparedRequest {
        body: (method == Method::POST).then_some(body),
        method,
        url,
        headers,
    })
}

pub struct HttpPollingProvider {
    client: Client,
}

impl HttpPollingProvider {
    pub fn new() -> Result<Self> {
        let client = danmaku::http::build_client(CONSUMER_HTTP_TIMEOUT)?;
        Ok(Self { client })
    }

    /// Run one poll. Request and parse failures are returned as errors;
    /// per-item dispatch failures are reported in [`PollReport::dispatch_error`].
    pub async fn poll_once(
        &self,
        setting: &DanmakuConsumerSettingDbModel,
        dispatcher: &dyn DanmakuDispatcher,
        cancel: &CancellationToken,
    ) -> Result<PollReport> {
        let config = HttpPollingConfig::from_json(&setting.config_json)?;
        let mapping = ItemMapping::new(&config)?;
        let cursor = request_cursor(&config, &setting.cursor);
        let prepared = prepare_request(setting, &config, &cursor)?;

        debug!(method = %prepared.method, url = %prepared.url, "Polling danmaku endpoint");
        let mut request = self.client.request(prepared.method, prepared.url);
        for (name, value) in prepared.headers {
            request = request.header(name, value);
        }
        if let Some(body) = prepared.body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(Value::Object(body).to_string());
        }

        let (status, body) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = async {
                let response = request.send().await?;
                let status = response.status();
                let body = danmaku::http::read_limited(response, MAX_RESPONSE_BYTES).await?;
                Ok::<_, Error>((status, body))
            } => result?,
        };

        if !status.is_success() {
            return Err(Error::Other(format!(
                "status={status} body={}",
                truncate_chars(body.text().trim(), MAX_ERROR_BODY_CHARS)
            )));
        }
        if body.truncated {
            return Err(Error::Other(format!(
                "response body exceeds {MAX_RESPONSE_BYTES} bytes"
            )));
        }

        let root: Value = serde_json::from_slice(&body.bytes)?;
        let items = mapping.items(&root);

        let mut report = PollReport {
            fetched: items.len(),
            ..Default::default()
        };
        let mut failures = Vec::new();
        let mut last_item = None;
        for item in items {
            let Some(message) = mapping.message(item, setting.room_id) else {
                continue;
            };
            last_item = Some(item);
            match dispatcher.dispatch(&message).await {
                Ok(matched) => {
                    report.processed += 1;
                    report.matched += matched;
                }
                Err(e) => {
                    warn!(room_id = message.room_id, error = %e, "Failed to dispatch danmaku");
                    failures.push(e.to_string());
                }
            }
        }

        report.cursor = next_cursor(&config, &mapping, &root, last_item, items.len(), &cursor);
        if let Some(first) = failures.first() {
            report.dispatch_error = Some(format!(
                "{} dispatch failure(s): {first}",
                failures.len()
            ));
        }
        Ok(report)
    }
}
