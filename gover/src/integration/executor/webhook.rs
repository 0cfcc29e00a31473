//! Webhook delivery executor.
//!
//! Posts the task's raw JSON payload, signs it when a secret is configured,
//! and writes one delivery log row per attempt whatever the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{TaskExecutor, TaskFailure};
use crate::database::models::{IntegrationTaskDbModel, TaskType, WebhookDeliveryLogDbModel};
use crate::database::repositories::DeliveryLogRepository;
use crate::database::time::now_ms;
use crate::integration::payload::WebhookTaskPayload;
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the lowercase hex HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Gover-Signature";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(12);
const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024;
const WEBHOOK_USER_AGENT: &str = concat!("gover-webhook/", env!("CARGO_PKG_VERSION"));

/// Lowercase hex HMAC-SHA256 of `body`, `None` when `secret` is empty.
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Check a received signature header in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(header.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// Whether an error message reads like a transient network failure.
pub(crate) fn transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["timeout", "timed out", "connection reset", "temporarily"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || transient_message(&err.to_string())
}

pub struct WebhookExecutor {
    client: Client,
    logs: Arc<dyn DeliveryLogRepository>,
}

impl WebhookExecutor {
    pub fn new(logs: Arc<dyn DeliveryLogRepository>) -> Result<Self> {
        let client = danmaku::http::build_client(WEBHOOK_TIMEOUT)?;
        Ok(Self { client, logs })
    }

    async fn record(&self, entry: WebhookDeliveryLogDbModel) {
        if let Err(e) = self.logs.create_webhook_delivery_log(&entry).await {
            warn!(webhook = %entry.webhook_name, error = %e, "Failed to write webhook delivery log");
        }
    }
}

#[async_trait]
impl TaskExecutor for WebhookExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Webhook
    }

    async fn execute(
        &self,
        task: &IntegrationTaskDbModel,
        attempt: i64,
    ) -> std::result::Result<(), TaskFailure> {
        let payload: WebhookTaskPayload = serde_json::from_str(&task.payload)
            .map_err(|e| TaskFailure::permanent(format!("invalid webhook payload: {e}")))?;
        if payload.url.trim().is_empty() {
            return Err(TaskFailure::permanent("webhook url is empty"));
        }

        let body = payload.body();
        let mut entry = WebhookDeliveryLogDbModel {
            webhook_id: payload.webhook_id,
            webhook_name: payload.webhook_name.clone(),
            event_type: payload.event_type.clone(),
            request_body: body.clone(),
            attempt,
            created_at: now_ms(),
            ..Default::default()
        };

        let mut request = self
            .client
            .post(payload.url.trim())
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, WEBHOOK_USER_AGENT);
        if let Some(signature) = sign_body(&payload.secret, body.as_bytes()) {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let started = Instant::now();
        let result = request.body(body).send().await;

        let outcome = match result {
            Ok(response) => {
                let status = response.status();
                entry.response_status = i64::from(status.as_u16());
                match danmaku::http::read_limited(response, MAX_RESPONSE_BODY_BYTES).await {
                    Ok(limited) => entry.response_body = limited.text().trim().to_string(),
                    Err(e) => debug!(error = %e, "Failed to read webhook response body"),
                }

                if status.is_success() {
                    entry.success = true;
                    Ok(())
                } else {
                    let message = format!("status={status}");
                    entry.error_message = message.clone();
                    Err(TaskFailure {
                        message,
                        retryable: retryable_status(status),
                    })
                }
            }
            Err(e) => {
                let message = e.to_string();
                entry.error_message = message.clone();
                Err(TaskFailure {
                    retryable: retryable_error(&e),
                    message,
                })
            }
        };

        entry.duration_ms = started.elapsed().as_millis() as i64;
        debug!(
            task_id = task.id,
            attempt,
            status = entry.response_status,
            duration_ms = entry.duration_ms,
            "Webhook delivered"
        );
        self.record(entry).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_hmac() {
        let signature = sign_body("s3cr3t", br#"{"k":1}"#).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let mut mac = HmacSha256::new_from_slice(b"s3cr3t").unwrap();
        mac.update(br#"{"k":1}"#);
        assert_eq!(signature, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn test_no_signature_without_secret() {
        assert!(sign_body("", b"{}").is_none());
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"k":1}"#;
        let signature = sign_body("s3cr3t", body).unwrap();
        assert!(verify_signature("s3cr3t", body, &signature));
        assert!(verify_signature("s3cr3t", body, &signature.to_uppercase()));
        assert!(!verify_signature("other", body, &signature));
        assert!(!verify_signature("s3cr3t", b"{}", &signature));
        assert!(!verify_signature("s3cr3t", body, "zz"));
        assert!(!verify_signature("", body, &signature));
    }

    #[test]
    fn test_retryable_status() {
        assert!(retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!retryable_status(reqwest::StatusCode::NOT_FOUND));
        assert!(!retryable_status(reqwest::StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_transient_messages() {
        assert!(transient_message("operation timeout"));
        assert!(transient_message("Connection reset by peer"));
        assert!(transient_message("service temporarily unavailable"));
        assert!(!transient_message("invalid certificate"));
    }
}
