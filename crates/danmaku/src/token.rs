//! Danmu-info token acquisition and WebSocket endpoint selection.

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::MessageStreamConfig;
use crate::error::{DanmakuError, Result};
use crate::http::{DEFAULT_UA, read_limited};
use crate::wbi::WbiSigner;

/// Upper bound for the danmu-info response body.
pub const MAX_TOKEN_BODY_BYTES: usize = 4 * 1024 * 1024;

pub const FALLBACK_WS_HOST: &str = "broadcastlv.chat.bilibili.com";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DanmuHost {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub ws_port: u16,
    #[serde(default)]
    pub wss_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DanmuInfo {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub host_list: Vec<DanmuHost>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<DanmuInfo>,
}

/// Fetch the auth token and gateway hosts for `room_id`.
///
/// The query is WBI-signed when `signer` is given.
pub async fn fetch_danmu_info(
    client: &Client,
    config: &MessageStreamConfig,
    room_id: i64,
    cookie: Option<&str>,
    signer: Option<&WbiSigner>,
) -> Result<DanmuInfo> {
    let mut url = Url::parse(config.token_endpoint())
        .map_err(|e| DanmakuError::other(format!("invalid token endpoint: {e}")))?;

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), "id" | "type" | "web_location"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.push(("id".to_string(), room_id.to_string()));
    params.push(("type".to_string(), "0".to_string()));
    params.push(("web_location".to_string(), config.web_location.clone()));

    match signer {
        Some(signer) => {
            let signed = signer.sign(params, cookie).await?;
            url.set_query(Some(&signed));
        }
        None => {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    debug!(room_id, url = %url, "Fetching danmu info");

    let mut request = client
        .get(url)
        .timeout(config.connect_timeout())
        .header(reqwest::header::USER_AGENT, DEFAULT_UA)
        .header(reqwest::header::REFERER, "https://live.bilibili.com");
    if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
        request = request.header(reqwest::header::COOKIE, cookie);
    }

    let response = request.send().await?;
    let status = response.status();
    let body = read_limited(response, MAX_TOKEN_BODY_BYTES).await?;
    if body.truncated {
        return Err(DanmakuError::decode(format!(
            "danmu info body exceeds {MAX_TOKEN_BODY_BYTES} bytes"
        )));
    }
    if !status.is_success() {
        return Err(DanmakuError::connection(format!(
            "danmu info request failed: status={status}"
        )));
    }

    parse_danmu_info(&body.bytes)
}

/// Parse the `{code, message, data}` envelope.
pub fn parse_danmu_info(body: &[u8]) -> Result<DanmuInfo> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    if envelope.code != 0 {
        return Err(DanmakuError::Api {
            code: envelope.code,
            message: envelope.message,
        });
    }

    let info = envelope
        .data
        .ok_or_else(|| DanmakuError::protocol("danmu info has no data"))?;
    if info.token.trim().is_empty() {
        return Err(DanmakuError::protocol("danmu info returned an empty token"));
    }
    Ok(info)
}

/// Choose the gateway URL for a session.
pub fn select_ws_url(config: &MessageStreamConfig, info: &DanmuInfo) -> Result<Url> {
    let scheme = if config.prefer_wss { "wss" } else { "ws" };
    let first = info.host_list.iter().find(|h| !h.host.trim().is_empty());

    let override_host = config
        .ws_host
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty());

    let (host, entry) = match override_host {
        Some(host) => (host, None),
        None => match first {
            Some(entry) => (entry.host.trim(), Some(entry)),
            None => (FALLBACK_WS_HOST, None),
        },
    };

    let port = config
        .ws_port
        .filter(|p| *p > 0)
        .unwrap_or_else(|| pick_port(entry, config.prefer_wss));

    let raw = format!("{scheme}://{host}:{port}{}", config.ws_path());
    Url::parse(&raw).map_err(|e| DanmakuError::other(format!("invalid websocket url {raw}: {e}")))
}

fn pick_port(entry: Option<&DanmuHost>, prefer_wss: bool) -> u16 {
    let (wss, ws) = entry.map(|e| (e.wss_port, e.ws_port)).unwrap_or((0, 0));
    let ordered = if prefer_wss { [wss, ws] } else { [ws, wss] };
    ordered
        .into_iter()
        .find(|p| *p > 0)
        .unwrap_or(if prefer_wss { 443 } else { 80 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> DanmuInfo {
        parse_danmu_info(
            br#"{"code":0,"message":"0","data":{"token":"tok","host_list":[
                {"host":"zj-cn-live-comet.chat.bilibili.com","port":2243,"wss_port":2245,"ws_port":2244}
            ]}}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_envelope() {
        let info = info();
        assert_eq!(info.token, "tok");
        assert_eq!(info.host_list[0].wss_port, 2245);
    }

    #[test]
    fn test_parse_rejects_error_code() {
        let err = parse_danmu_info(br#"{"code":-352,"message":"risk control"}"#).unwrap_err();
        assert!(matches!(err, DanmakuError::Api { code: -352, .. }));
    }

    #[test]
    fn test_parse_rejects_empty_token() {
        let err = parse_danmu_info(br#"{"code":0,"data":{"token":"","host_list":[]}}"#);
        assert!(matches!(err, Err(DanmakuError::Protocol(_))));
    }

    #[test]
    fn test_select_prefers_wss_port() {
        let url = select_ws_url(&MessageStreamConfig::default(), &info()).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://zj-cn-live-comet.chat.bilibili.com:2245/sub"
        );
    }

    #[test]
    fn test_select_plain_ws() {
        let config = MessageStreamConfig {
            prefer_wss: false,
            ..Default::default()
        };
        let url = select_ws_url(&config, &info()).unwrap();
        assert_eq!(url.as_str(), "ws://zj-cn-live-comet.chat.bilibili.com:2244/sub");
    }

    #[test]
    fn test_select_override_and_fallback() {
        let config = MessageStreamConfig {
            ws_host: Some("127.0.0.1".into()),
            ws_port: Some(9000),
            prefer_wss: false,
            ..Default::default()
        };
        let url = select_ws_url(&config, &info()).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/sub");

        let url = select_ws_url(&MessageStreamConfig::default(), &DanmuInfo::default()).unwrap();
        assert_eq!(url.host_str(), Some(FALLBACK_WS_HOST));
        assert_eq!(url.port_or_known_default(), Some(443));
    }
}
