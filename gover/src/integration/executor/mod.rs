//! Per-type task executors.
//!
//! Executors never surface [`crate::Error`] to the worker. Every failure is
//! reduced to a [`TaskFailure`] whose `retryable` flag drives the retry or
//! dead-letter decision.

pub mod bot;
pub mod webhook;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::database::models::{IntegrationTaskDbModel, TaskType};

pub use bot::{
    BotCommandError, BotCommandRunner, BotExecutor, LiveStopper, LogOnlyController,
    PtzBotExecutor, PtzCommander, StreamController,
};
pub use webhook::{SIGNATURE_HEADER, WebhookExecutor, sign_body, verify_signature};

/// Failed task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub message: String,
    pub retryable: bool,
}

impl TaskFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Runs one task of a given type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Execute `task`. `attempt` is the 1-based number of this try.
    async fn execute(
        &self,
        task: &IntegrationTaskDbModel,
        attempt: i64,
    ) -> std::result::Result<(), TaskFailure>;
}

/// Executors keyed by the task type they handle.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(executor);
        self
    }

    /// Register `executor`, replacing any previous one for its type.
    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(executor.task_type(), executor);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }
}
