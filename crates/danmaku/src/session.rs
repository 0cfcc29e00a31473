//! Message-stream session: state machine and the bounded read loop.
//!
//! One call to [`MessageStreamClient::poll`] runs a complete session:
//! token fetch, WebSocket handshake, auth, heartbeats and a read window during
//! which chat records are handed to a [`ChatSink`]. The connection is always
//! closed before `poll` returns.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::MessageStreamConfig;
use crate::cookie::{build_cookie_header, extract_cookie_value, generate_fake_buvid3};
use crate::error::{DanmakuError, Result};
use crate::http::{DEFAULT_UA, install_rustls_provider};
use crate::message::{ChatRecord, command_of};
use crate::packet::{Packet, decode_frame, op, ver};
use crate::token::{fetch_danmu_info, select_ws_url};
use crate::wbi::{DEFAULT_NAV_URL, WbiSigner};

/// Per-frame read deadline inside the read window.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(2);

const ORIGIN: &str = "https://live.bilibili.com";

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Streaming,
    Closing,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Streaming)
                | (Connecting | Authenticating | Streaming, Closing)
                | (Closing, Idle)
        )
    }

    /// Whether op=5 message packets are processed in this state.
    pub fn accepts_messages(self) -> bool {
        matches!(self, SessionState::Authenticating | SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Counters collected over one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub ws_url: String,
    /// Chat records handed to the sink.
    pub fetched: usize,
    pub command_counts: BTreeMap<String, u64>,
    pub auth_code: Option<i64>,
    pub heartbeats: u64,
    pub frames: u64,
    pub decode_errors: u64,
    /// The session ended because the caller cancelled it.
    pub cancelled: bool,
    /// Transport failure that cut a streaming session short.
    pub transport_error: Option<String>,
}

/// Receives chat records as they are decoded.
#[async_trait]
pub trait ChatSink: Send {
    /// Handle one record. Returning `false` ends the session early.
    async fn accept(&mut self, record: ChatRecord) -> bool;
}

#[async_trait]
impl ChatSink for Vec<ChatRecord> {
    async fn accept(&mut self, record: ChatRecord) -> bool {
        self.push(record);
        true
    }
}

/// Protocol-level session bookkeeping, independent of the socket.
#[derive(Debug)]
pub struct Session {
    room_id: i64,
    state: SessionState,
    summary: PollSummary,
}

impl Session {
    pub fn new(room_id: i64) -> Self {
        Self {
            room_id,
            state: SessionState::Idle,
            summary: PollSummary::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn summary(&self) -> &PollSummary {
        &self.summary
    }

    pub fn into_summary(self) -> PollSummary {
        self.summary
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DanmakuError::protocol(format!(
                "invalid session transition {} -> {}",
                self.state, next
            )));
        }
        trace!(room_id = self.room_id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        Ok(())
    }

    /// Decode one binary frame and return the chat records it carries.
    ///
    /// Malformed frames and message bodies are counted and skipped. A
    /// non-zero auth reply moves the session to `Closing` and is returned as
    /// an error.
    pub fn handle_frame(
        &mut self,
        data: &[u8],
        config: &MessageStreamConfig,
    ) -> Result<Vec<ChatRecord>> {
        let packets = match decode_frame(data) {
            Ok(packets) => packets,
            Err(e) => {
                self.summary.decode_errors += 1;
                warn!(room_id = self.room_id, error = %e, "Skipping undecodable frame");
                return Ok(Vec::new());
            }
        };
        self.summary.frames += 1;

        let mut records = Vec::new();
        for packet in packets {
            match packet.operation {
                op::AUTH_REPLY => self.handle_auth_reply(&packet)?,
                op::HEARTBEAT_REPLY => {
                    trace!(room_id = self.room_id, "Heartbeat reply");
                }
                op::MESSAGE if self.state.accepts_messages() => {
                    if let Some(record) = self.handle_message(&packet, config) {
                        records.push(record);
                    }
                }
                other => {
                    trace!(room_id = self.room_id, operation = other, state = %self.state, "Ignoring packet");
                }
            }
        }
        Ok(records)
    }

    fn handle_auth_reply(&mut self, packet: &Packet) -> Result<()> {
        let code = packet
            .body_json::<Value>()
            .ok()
            .and_then(|v| v.get("code").and_then(Value::as_i64))
            .unwrap_or(0);
        self.summary.auth_code = Some(code);

        if code != 0 {
            self.transition(SessionState::Closing)?;
            return Err(DanmakuError::protocol(format!("auth rejected with code {code}")));
        }
        if self.state == SessionState::Authenticating {
            self.transition(SessionState::Streaming)?;
            debug!(room_id = self.room_id, "Authenticated");
        }
        Ok(())
    }

    fn handle_message(&mut self, packet: &Packet, config: &MessageStreamConfig) -> Option<ChatRecord> {
        let message: Value = match packet.body_json() {
            Ok(v) => v,
            Err(e) => {
                self.summary.decode_errors += 1;
                debug!(room_id = self.room_id, error = %e, "Skipping invalid message body");
                return None;
            }
        };

        let command = command_of(&message)?;
        *self.summary.command_counts.entry(command.clone()).or_default() += 1;

        if !config.accepts_command(&command) || !command.starts_with("DANMU_MSG") {
            return None;
        }
        ChatRecord::from_danmu_msg(self.room_id, &command, &message)
    }
}

/// Build the op=7 auth packet.
pub fn auth_packet(uid: i64, room_id: i64, token: &str, config: &MessageStreamConfig) -> Packet {
    let body = json!({
        "uid": uid,
        "roomid": room_id,
        "protover": config.protover,
        "platform": config.platform,
        "type": config.auth_type,
        "key": token,
    });
    Packet::new(ver::PLAIN, op::AUTH, body.to_string().into_bytes())
}

/// Uid sent in the auth packet: the configured uid, otherwise `DedeUserID`
/// from a logged-in cookie.
pub fn resolve_uid(config: &MessageStreamConfig, cookie: Option<&str>) -> i64 {
    if config.uid > 0 {
        return config.uid;
    }
    cookie
        .filter(|c| extract_cookie_value(c, "SESSDATA").is_some())
        .and_then(|c| extract_cookie_value(c, "DedeUserID"))
        .and_then(|id| id.parse().ok())
        .unwrap_or(0)
}

/// Client for message-stream polls. Owns the WBI key caches.
pub struct MessageStreamClient {
    http: Client,
    signers: Mutex<BTreeMap<String, Arc<WbiSigner>>>,
}

impl MessageStreamClient {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            signers: Mutex::new(BTreeMap::new()),
        }
    }

    fn signer_for(&self, nav_url: &str) -> Arc<WbiSigner> {
        self.signers
            .lock()
            .entry(nav_url.to_string())
            .or_insert_with(|| Arc::new(WbiSigner::new(self.http.clone()).with_nav_url(nav_url)))
            .clone()
    }

    /// Run one session against `room_id` for at most `read_window`.
    pub async fn poll(
        &self,
        room_id: i64,
        config: &MessageStreamConfig,
        read_window: Duration,
        cookie: Option<&str>,
        sink: &mut dyn ChatSink,
        cancel: &CancellationToken,
    ) -> Result<PollSummary> {
        if room_id <= 0 {
            return Err(DanmakuError::other("message stream requires roomId > 0"));
        }
        install_rustls_provider();

        let cookie = cookie
            .filter(|_| config.use_cookie)
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let buvid3 = config
            .buvid3
            .clone()
            .filter(|b| !b.trim().is_empty())
            .or_else(|| cookie.and_then(|c| extract_cookie_value(c, "buvid3")))
            .unwrap_or_else(generate_fake_buvid3);
        let cookie_header = build_cookie_header(cookie, &buvid3);

        let mut session = Session::new(room_id);
        session.transition(SessionState::Connecting)?;

        let signer = config.use_wbi.then(|| {
            self.signer_for(config.nav_endpoint.as_deref().unwrap_or(DEFAULT_NAV_URL))
        });
        let info = tokio::select! {
            _ = cancel.cancelled() => return Err(DanmakuError::Cancelled),
            info = fetch_danmu_info(&self.http, config, room_id, Some(&cookie_header), signer.as_deref()) => info?,
        };

        let url = select_ws_url(config, &info)?;
        session.summary.ws_url = url.to_string();

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(DEFAULT_UA));
        headers.insert(header::ORIGIN, HeaderValue::from_static(ORIGIN));
        if let Ok(referer) = HeaderValue::from_str(&format!("{ORIGIN}/{room_id}")) {
            headers.insert(header::REFERER, referer);
        }
        if let Ok(value) = HeaderValue::from_str(&cookie_header) {
            headers.insert(header::COOKIE, value);
        }
        for (name, value) in &config.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid header"),
            }
        }

        debug!(room_id, url = %url, "Connecting to message stream");
        let connect = tokio::time::timeout(config.connect_timeout(), connect_async(request));
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(DanmakuError::Cancelled),
            res = connect => match res {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => return Err(DanmakuError::connection(format!("websocket handshake failed: {e}"))),
                Err(_) => return Err(DanmakuError::Timeout(format!("websocket handshake to {url}"))),
            },
        };

        session.transition(SessionState::Authenticating)?;
        let uid = resolve_uid(config, cookie);
        let auth = auth_packet(uid, room_id, &info.token, config);
        stream.send(Message::Binary(auth.encode().into())).await?;

        let result = self
            .read_loop(&mut session, &mut stream, config, read_window, sink, cancel)
            .await;

        if session.state() != SessionState::Closing {
            session.transition(SessionState::Closing)?;
        }
        if let Err(e) = stream.close(None).await {
            trace!(room_id, error = %e, "Close handshake failed");
        }
        session.transition(SessionState::Idle)?;

        result?;
        let summary = session.into_summary();
        info!(
            room_id,
            fetched = summary.fetched,
            frames = summary.frames,
            heartbeats = summary.heartbeats,
            "Message stream poll finished"
        );
        Ok(summary)
    }

    async fn read_loop<S>(
        &self,
        session: &mut Session,
        stream: &mut S,
        config: &MessageStreamConfig,
        read_window: Duration,
        sink: &mut dyn ChatSink,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let max_messages = config.max_messages();
        let deadline = Instant::now() + read_window;
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    session.summary.cancelled = true;
                    return Ok(());
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = heartbeat.tick() => {
                    let sent = stream.send(Message::Binary(Packet::heartbeat().encode().into())).await;
                    if let Err(e) = sent {
                        return interrupted(session, e);
                    }
                    session.summary.heartbeats += 1;
                }
                next = tokio::time::timeout(FRAME_READ_TIMEOUT, stream.next()) => {
                    let message = match next {
                        Err(_) => continue,
                        Ok(None) => return closed_by_server(session),
                        Ok(Some(Ok(message))) => message,
                        Ok(Some(Err(e))) => return interrupted(session, e),
                    };

                    match message {
                        Message::Binary(data) => {
                            for record in session.handle_frame(&data, config)? {
                                session.summary.fetched += 1;
                                let more = sink.accept(record).await;
                                if !more || session.summary.fetched >= max_messages {
                                    return Ok(());
                                }
                            }
                        }
                        Message::Close(frame) => {
                            debug!(room_id = session.room_id, ?frame, "Server sent close");
                            return closed_by_server(session);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Ends a streaming session on a transport error, keeping what was read.
/// Before the auth reply the error is returned as is.
fn interrupted(session: &mut Session, e: tokio_tungstenite::tungstenite::Error) -> Result<()> {
    if session.state() != SessionState::Streaming {
        return Err(e.into());
    }
    warn!(
        room_id = session.room_id,
        fetched = session.summary.fetched,
        error = %e,
        "Stream interrupted, ending window early"
    );
    session.summary.transport_error = Some(e.to_string());
    Ok(())
}

fn closed_by_server(session: &Session) -> Result<()> {
    if session.state() == SessionState::Authenticating {
        return Err(DanmakuError::connection("stream closed before auth reply"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode_compressed;

    fn danmu(content: &str, uid: i64) -> Packet {
        let body = json!({
            "cmd": "DANMU_MSG",
            "info": [[0, 1, 25, 16777215, 1700000000000i64], content, [uid, "user"]]
        });
        Packet::new(ver::PLAIN, op::MESSAGE, body.to_string().into_bytes())
    }

    fn authenticating(room_id: i64) -> Session {
        let mut session = Session::new(room_id);
        session.transition(SessionState::Connecting).unwrap();
        session.transition(SessionState::Authenticating).unwrap();
        session
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Streaming.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Authenticating));

        let mut session = Session::new(1);
        assert!(session.transition(Streaming).is_err());
        assert_eq!(session.state(), Idle);
    }

    #[test]
    fn test_auth_reply_moves_to_streaming() {
        let mut session = authenticating(1);
        let reply = Packet::new(ver::PLAIN, op::AUTH_REPLY, br#"{"code":0}"#.to_vec());
        let records = session
            .handle_frame(&reply.encode(), &MessageStreamConfig::default())
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.summary().auth_code, Some(0));
    }

    #[test]
    fn test_auth_rejection_closes() {
        let mut session = authenticating(1);
        let reply = Packet::new(ver::PLAIN, op::AUTH_REPLY, br#"{"code":-101}"#.to_vec());
        let err = session
            .handle_frame(&reply.encode(), &MessageStreamConfig::default())
            .unwrap_err();
        assert!(matches!(err, DanmakuError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn test_zlib_frame_yields_two_records() {
        let mut session = authenticating(99);
        let frame = encode_compressed(&[danmu("first", 1), danmu("second", 2)], ver::ZLIB, op::MESSAGE)
            .unwrap()
            .encode();

        let records = session
            .handle_frame(&frame, &MessageStreamConfig::default())
            .unwrap();
        let contents: Vec<_> = records.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);
        assert!(records.iter().all(|r| r.room_id == 99));
        assert_eq!(session.summary().command_counts.get("DANMU_MSG"), Some(&2));
    }

    #[test]
    fn test_messages_ignored_before_auth() {
        let mut session = Session::new(1);
        session.transition(SessionState::Connecting).unwrap();
        let records = session
            .handle_frame(&danmu("early", 1).encode(), &MessageStreamConfig::default())
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_filters_and_decode_errors() {
        let mut session = authenticating(1);
        let config = MessageStreamConfig {
            exclude_commands: vec!["DANMU_MSG".into()],
            ..Default::default()
        };
        let gift = Packet::new(
            ver::PLAIN,
            op::MESSAGE,
            br#"{"cmd":"SEND_GIFT","data":{}}"#.to_vec(),
        );
        let bad = Packet::new(ver::PLAIN, op::MESSAGE, b"not json".to_vec());
        let mut frame = danmu("x", 1).encode();
        frame.extend(gift.encode());
        frame.extend(bad.encode());

        assert!(session.handle_frame(&frame, &config).unwrap().is_empty());
        assert_eq!(session.summary().decode_errors, 1);
        assert_eq!(session.summary().command_counts.len(), 2);

        assert!(session.handle_frame(&[0, 0, 0], &config).unwrap().is_empty());
        assert_eq!(session.summary().decode_errors, 2);
    }

    #[test]
    fn test_auth_packet_and_uid() {
        let config = MessageStreamConfig::default();
        let packet = auth_packet(0, 5, "tok", &config);
        assert_eq!(packet.operation, op::AUTH);
        assert_eq!(packet.version, ver::PLAIN);
        let body: Value = packet.body_json().unwrap();
        assert_eq!(body["roomid"], 5);
        assert_eq!(body["protover"], 3);
        assert_eq!(body["key"], "tok");

        assert_eq!(resolve_uid(&config, Some("DedeUserID=7")), 0);
        assert_eq!(resolve_uid(&config, Some("SESSDATA=x; DedeUserID=7")), 7);
        let fixed = MessageStreamConfig {
            uid: 3,
            ..Default::default()
        };
        assert_eq!(resolve_uid(&fixed, Some("SESSDATA=x; DedeUserID=7")), 3);
    }
}
