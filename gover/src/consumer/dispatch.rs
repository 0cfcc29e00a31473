//! Chat message dispatch.
//!
//! The consumer hands every normalized message to a [`DanmakuDispatcher`].
//! [`KeywordRuleDispatcher`] is the built-in implementation: it matches
//! keyword rules and enqueues webhook or bot tasks.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::integration::{EnqueueBot, EnqueueWebhook, IntegrationService};
use crate::{Error, Result};

/// A chat message normalized from any provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DanmakuMessage {
    pub room_id: i64,
    pub uid: String,
    pub uname: String,
    pub content: String,
    /// `consumer.<provider>` unless the provider supplied one.
    pub source: String,
    /// Original item as JSON.
    pub raw_payload: String,
    pub received_at: i64,
}

/// Evaluates chat rules for a message.
#[async_trait]
pub trait DanmakuDispatcher: Send + Sync {
    /// Returns the number of rules that matched.
    async fn dispatch(&self, message: &DanmakuMessage) -> Result<usize>;
}

/// Accepts everything, matches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

#[async_trait]
impl DanmakuDispatcher for NoopDispatcher {
    async fn dispatch(&self, _message: &DanmakuMessage) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleAction {
    #[serde(rename_all = "camelCase")]
    Webhook {
        #[serde(default)]
        webhook_id: Option<i64>,
        #[serde(default)]
        webhook_name: String,
        url: String,
        #[serde(default)]
        secret: String,
        #[serde(default = "default_webhook_event")]
        event_type: String,
    },
    #[serde(rename_all = "camelCase")]
    Bot {
        provider: String,
        command: String,
        #[serde(default)]
        params: Value,
    },
}

fn default_webhook_event() -> String {
    "danmaku.keyword".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordRule {
    pub keyword: String,
    /// Restrict the rule to one room.
    #[serde(default)]
    pub room_id: Option<i64>,
    #[serde(default)]
    pub priority: Option<i64>,
    pub action: RuleAction,
}

impl KeywordRule {
    /// Case-insensitive substring match, optionally scoped to a room.
    pub fn matches(&self, message: &DanmakuMessage) -> bool {
        let keyword = self.keyword.trim();
        if keyword.is_empty() {
            return false;
        }
        if let Some(room_id) = self.room_id
            && room_id > 0
            && room_id != message.room_id
        {
            return false;
        }
        message
            .content
            .to_lowercase()
            .contains(&keyword.to_lowercase())
    }
}

pub struct KeywordRuleDispatcher {
    rules: Vec<KeywordRule>,
    service: Arc<IntegrationService>,
}

impl KeywordRuleDispatcher {
    pub fn new(rules: Vec<KeywordRule>, service: Arc<IntegrationService>) -> Self {
        Self { rules, service }
    }

    /// Parse a JSON array of rules.
    pub fn from_json(raw: &str, service: Arc<IntegrationService>) -> Result<Self> {
        let rules: Vec<KeywordRule> = serde_json::from_str(raw)?;
        Ok(Self::new(rules, service))
    }

    pub async fn from_file(path: &Path, service: Arc<IntegrationService>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let dispatcher = Self::from_json(&raw, service)?;
        info!(
            path = %path.display(),
            rules = dispatcher.rules.len(),
            "Loaded danmaku keyword rules"
        );
        Ok(dispatcher)
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }

    async fn run_action(&self, rule: &KeywordRule, message: &DanmakuMessage) -> Result<i64> {
        match &rule.action {
            RuleAction::Webhook {
                webhook_id,
                webhook_name,
                url,
                secret,
                event_type,
            } => {
                let body = json!({
                    "keyword": rule.keyword,
                    "message": message,
                });
                self.service
                    .enqueue_webhook_task(EnqueueWebhook {
                        webhook_id: *webhook_id,
                        webhook_name: webhook_name.clone(),
                        url: url.clone(),
                        secret: secret.clone(),
                        event_type: event_type.clone(),
                        payload: body.to_string(),
                        priority: rule.priority,
                        ..Default::default()
                    })
                    .await
            }
            RuleAction::Bot {
                provider,
                command,
                params,
            } => {
                let params = if params.is_null() {
                    String::new()
                } else {
                    params.to_string()
                };
                self.service
                    .enqueue_bot_task(EnqueueBot {
                        provider: provider.clone(),
                        command: command.clone(),
                        params,
                        priority: rule.priority,
                        ..Default::default()
                    })
                    .await
            }
        }
    }
}

#[async_trait]
impl DanmakuDispatcher for KeywordRuleDispatcher {
    async fn dispatch(&self, message: &DanmakuMessage) -> Result<usize> {
        let mut matched = 0;
        let mut failures = Vec::new();
        for rule in self.rules.iter().filter(|rule| rule.matches(message)) {
            matched += 1;
            match self.run_action(rule, message).await {
                Ok(task_id) => debug!(task_id, keyword = %rule.keyword, "Keyword rule fired"),
                Err(e) => failures.push(format!("{}: {e}", rule.keyword)),
            }
        }
        if !failures.is_empty() {
            return Err(Error::Other(format!(
                "{} rule action(s) failed: {}",
                failures.len(),
                failures.join("; ")
            )));
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(room_id: i64, content: &str) -> DanmakuMessage {
        DanmakuMessage {
            room_id,
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rule_matching() {
        let rules: Vec<KeywordRule> = serde_json::from_str(
            r#"[
                {"keyword": "Hello", "action": {"type": "webhook", "url": "http://127.0.0.1/h"}},
                {"keyword": "left", "roomId": 9, "action": {"type": "bot", "provider": "ptz", "command": "ptz.move", "params": {"pan": -0.5}}}
            ]"#,
        )
        .unwrap();

        assert!(rules[0].matches(&message(1, "oh hello there")));
        assert!(!rules[0].matches(&message(1, "bye")));
        assert!(rules[1].matches(&message(9, "turn LEFT")));
        assert!(!rules[1].matches(&message(8, "turn left")));

        match &rules[0].action {
            RuleAction::Webhook { event_type, .. } => assert_eq!(event_type, "danmaku.keyword"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_blank_keyword_never_matches() {
        let rule = KeywordRule {
            keyword: "  ".into(),
            room_id: None,
            priority: None,
            action: RuleAction::Bot {
                provider: "ptz".into(),
                command: "ptz.stop".into(),
                params: Value::Null,
            },
        };
        assert!(!rule.matches(&message(1, "anything")));
    }
}
