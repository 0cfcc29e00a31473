//! Task payloads stored as JSON in `integration_tasks.payload`.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Payload of a `webhook` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<i64>,
    #[serde(default)]
    pub webhook_name: String,
    pub url: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub event_type: String,
    /// Request body, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl WebhookTaskPayload {
    /// Canonical request body: the trimmed raw payload, or `{}` when empty.
    pub fn body(&self) -> String {
        let raw = self.payload.as_deref().map(RawValue::get).unwrap_or("");
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            "{}".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// Payload of a `bot` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotTaskPayload {
    pub provider: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
}

impl BotTaskPayload {
    /// Command parameters as a JSON value; missing params read as `{}`.
    pub fn params_value(&self) -> serde_json::Result<serde_json::Value> {
        match self.params.as_deref() {
            Some(raw) => serde_json::from_str(raw.get()),
            None => Ok(serde_json::Value::Object(Default::default())),
        }
    }
}

/// Wrap an arbitrary JSON string as a raw value, rejecting invalid JSON.
pub fn raw_json(value: &str) -> serde_json::Result<Box<RawValue>> {
    let trimmed = value.trim();
    RawValue::from_string(if trimmed.is_empty() {
        "{}".to_string()
    } else {
        trimmed.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_body_is_preserved() {
        let payload: WebhookTaskPayload = serde_json::from_str(
            r#"{"webhookId":7,"webhookName":"n","url":"http://x","secret":"s","eventType":"e","payload":{"k":1}}"#,
        )
        .unwrap();
        assert_eq!(payload.body(), r#"{"k":1}"#);
        assert_eq!(payload.webhook_id, Some(7));

        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains(r#""payload":{"k":1}"#));
    }

    #[test]
    fn test_webhook_body_defaults() {
        let payload: WebhookTaskPayload =
            serde_json::from_str(r#"{"url":"http://x","payload":null}"#).unwrap();
        assert_eq!(payload.body(), "{}");
        assert!(payload.secret.is_empty());
    }

    #[test]
    fn test_bot_params() {
        let payload: BotTaskPayload =
            serde_json::from_str(r#"{"provider":"ptz","command":"ptz.stop"}"#).unwrap();
        assert_eq!(payload.params_value().unwrap(), serde_json::json!({}));
        assert!(raw_json("not json").is_err());
        assert_eq!(raw_json(" ").unwrap().get(), "{}");
    }
}
