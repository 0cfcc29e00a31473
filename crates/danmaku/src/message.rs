//! Chat records extracted from op=5 message packets.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

/// Normalize the `cmd` field: the uppercase prefix before any `:`.
///
/// `"DANMU_MSG:4:0:2:2:2:0"` becomes `"DANMU_MSG"`.
pub fn normalize_command(cmd: &str) -> String {
    cmd.split(':').next().unwrap_or_default().trim().to_uppercase()
}

/// Command of a decoded message body, if it has one.
pub fn command_of(message: &Value) -> Option<String> {
    message
        .get("cmd")
        .and_then(Value::as_str)
        .map(normalize_command)
        .filter(|c| !c.is_empty())
}

/// A single chat message from the live room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub room_id: i64,
    pub uid: i64,
    pub uname: String,
    pub content: String,
    pub command: String,
    pub color: Option<u32>,
    pub msg_id: Option<String>,
    /// Milliseconds since the epoch as reported by the server.
    pub send_time: Option<i64>,
    /// The message JSON as received.
    pub raw: String,
}

impl ChatRecord {
    /// Extract a chat record from a `DANMU_MSG` body.
    ///
    /// Layout: `info[1]` content, `info[2][0]` uid, `info[2][1]` name,
    /// `info[0][3]` color, `info[0][4]` send time.
    pub fn from_danmu_msg(room_id: i64, command: &str, message: &Value) -> Option<Self> {
        let info = message.get("info")?.as_array()?;
        let content = info.get(1)?.as_str()?.trim().to_string();

        let user = info.get(2).and_then(Value::as_array);
        let uid = user
            .and_then(|u| u.first())
            .and_then(as_i64_lenient)
            .unwrap_or(0);
        let uname = user
            .and_then(|u| u.get(1))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let meta = info.first().and_then(Value::as_array);
        let color = meta
            .and_then(|m| m.get(3))
            .and_then(Value::as_u64)
            .map(|c| c as u32);

        let msg_id = message
            .get("msg_id")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.trim().is_empty());

        let send_time = message
            .get("send_time")
            .and_then(as_i64_lenient)
            .or_else(|| meta.and_then(|m| m.get(4)).and_then(as_i64_lenient))
            .filter(|t| *t > 0);

        Some(Self {
            room_id,
            uid,
            uname,
            content,
            command: command.to_string(),
            color,
            msg_id,
            send_time,
            raw: message.to_string(),
        })
    }

    /// Cursor identifying this record.
    ///
    /// Preference: `msg_id`, then `send_time`, then `<previous>.<index>`,
    /// then the current time in nanoseconds.
    pub fn cursor(&self, previous: &str, index: usize) -> String {
        if let Some(id) = &self.msg_id {
            return id.clone();
        }
        if let Some(ts) = self.send_time {
            return ts.to_string();
        }
        if !previous.trim().is_empty() {
            return format!("{}.{index}", previous.trim());
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().to_string())
            .unwrap_or_else(|_| index.to_string())
    }
}

fn as_i64_lenient(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "cmd": "DANMU_MSG:4:0:2:2:2:0",
            "info": [
                [0, 1, 25, 16777215, 1700000000123i64, 0],
                " hello world ",
                [12345, "viewer"],
            ]
        })
    }

    #[test]
    fn test_normalize_command() {
        assert_eq!(normalize_command("danmu_msg:4:0"), "DANMU_MSG");
        assert_eq!(command_of(&sample()).as_deref(), Some("DANMU_MSG"));
        assert_eq!(command_of(&json!({"data": 1})), None);
    }

    #[test]
    fn test_from_danmu_msg() {
        let record = ChatRecord::from_danmu_msg(7, "DANMU_MSG", &sample()).unwrap();
        assert_eq!(record.room_id, 7);
        assert_eq!(record.uid, 12345);
        assert_eq!(record.uname, "viewer");
        assert_eq!(record.content, "hello world");
        assert_eq!(record.color, Some(16777215));
        assert_eq!(record.send_time, Some(1700000000123));
        assert_eq!(record.msg_id, None);
    }

    #[test]
    fn test_missing_info_is_none() {
        assert!(ChatRecord::from_danmu_msg(1, "DANMU_MSG", &json!({"cmd": "DANMU_MSG"})).is_none());
    }

    #[test]
    fn test_cursor_preference() {
        let mut record = ChatRecord::from_danmu_msg(1, "DANMU_MSG", &sample()).unwrap();
        assert_eq!(record.cursor("prev", 3), "1700000000123");

        record.msg_id = Some("m-1".into());
        assert_eq!(record.cursor("prev", 3), "m-1");

        record.msg_id = None;
        record.send_time = None;
        assert_eq!(record.cursor("prev", 3), "prev.3");
        assert!(record.cursor("", 3).parse::<u128>().is_ok());
    }
}
