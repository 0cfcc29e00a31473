//! Worker loop: pace, execute and record the outcome of leased tasks.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::TaskFailure;
use super::service::IntegrationService;
use crate::database::models::{EVENT_TASK_DEAD, EVENT_TASK_RETRY, IntegrationTaskDbModel};
use crate::database::time::{ms_after, now_ms};

/// Deadline for a single executor call.
pub const TASK_EXECUTION_TIMEOUT: Duration = Duration::from_secs(25);

/// Shared receiving end of the task channel.
pub type TaskReceiver = Arc<Mutex<mpsc::Receiver<IntegrationTaskDbModel>>>;

/// Delay before retry number `attempt`: `2^min(attempt, 6)` seconds.
pub fn retry_backoff(attempt: i64) -> Duration {
    Duration::from_secs(1u64 << attempt.clamp(0, 6))
}

/// What happened to a processed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Retry { next_run_at: i64 },
    Dead,
    /// Handed back to pending without consuming an attempt.
    Released,
}

impl IntegrationService {
    /// Run one leased task to an outcome and persist it.
    pub async fn process_task(
        &self,
        task: IntegrationTaskDbModel,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let attempt = task.attempt + 1;

        let Some(task_type) = task.task_type() else {
            let failure = TaskFailure::permanent(format!("unknown task type: {}", task.task_type));
            return self.record_outcome(&task, attempt, Err(failure)).await;
        };

        let gap = self.queue().gap_for(task_type).await;
        if !self.limiter().wait(&task.rate_key, gap, cancel).await {
            self.release_leased(std::iter::once(task.id)).await;
            return TaskOutcome::Released;
        }

        let Some(executor) = self.executors().get(task_type) else {
            let failure = TaskFailure::permanent(format!("no executor for task type: {task_type}"));
            return self.record_outcome(&task, attempt, Err(failure)).await;
        };

        debug!(task_id = task.id, task_type = %task_type, attempt, "Executing integration task");
        let result = tokio::time::timeout(TASK_EXECUTION_TIMEOUT, executor.execute(&task, attempt))
            .await
            .unwrap_or_else(|_| {
                Err(TaskFailure::retryable(format!(
                    "task execution timeout after {}s",
                    TASK_EXECUTION_TIMEOUT.as_secs()
                )))
            });

        self.record_outcome(&task, attempt, result).await
    }

    async fn record_outcome(
        &self,
        task: &IntegrationTaskDbModel,
        attempt: i64,
        result: std::result::Result<(), TaskFailure>,
    ) -> TaskOutcome {
        let store = self.store();
        match result {
            Ok(()) => {
                match store.mark_integration_task_succeeded(task.id, attempt).await {
                    Ok(true) => info!(task_id = task.id, attempt, "Integration task succeeded"),
                    Ok(false) => debug!(task_id = task.id, "Task left running state before success was recorded"),
                    Err(e) => error!(task_id = task.id, error = %e, "Failed to mark task succeeded"),
                }
                TaskOutcome::Succeeded
            }
            Err(failure) if failure.retryable && attempt < task.max_attempts => {
                let next_run_at = ms_after(retry_backoff(attempt));
                match store
                    .mark_integration_task_retry(task.id, attempt, next_run_at, &failure.message)
                    .await
                {
                    Ok(true) => {
                        warn!(
                            task_id = task.id,
                            attempt,
                            max_attempts = task.max_attempts,
                            error = %failure.message,
                            "Integration task failed, retry scheduled"
                        );
                        self.emit(
                            EVENT_TASK_RETRY,
                            json!({
                                "taskId": task.id,
                                "taskType": task.task_type,
                                "attempt": attempt,
                                "maxAttempts": task.max_attempts,
                                "nextRunAt": next_run_at,
                                "error": failure.message,
                            }),
                        )
                        .await;
                    }
                    Ok(false) => debug!(task_id = task.id, "Task left running state before retry was recorded"),
                    Err(e) => error!(task_id = task.id, error = %e, "Failed to schedule task retry"),
                }
                TaskOutcome::Retry { next_run_at }
            }
            Err(failure) => {
                match store
                    .mark_integration_task_dead(task.id, attempt, &failure.message)
                    .await
                {
                    Ok(true) => {
                        error!(
                            task_id = task.id,
                            attempt,
                            retryable = failure.retryable,
                            error = %failure.message,
                            "Integration task dead"
                        );
                        self.emit(
                            EVENT_TASK_DEAD,
                            json!({
                                "taskId": task.id,
                                "taskType": task.task_type,
                                "attempt": attempt,
                                "maxAttempts": task.max_attempts,
                                "error": failure.message,
                                "at": now_ms(),
                            }),
                        )
                        .await;
                    }
                    Ok(false) => debug!(task_id = task.id, "Task left running state before failure was recorded"),
                    Err(e) => error!(task_id = task.id, error = %e, "Failed to mark task dead"),
                }
                TaskOutcome::Dead
            }
        }
    }
}

/// Receive and process tasks until the channel closes.
///
/// After cancellation the remaining buffered tasks are released instead of
/// executed.
pub async fn run_worker(
    worker_id: usize,
    service: Arc<IntegrationService>,
    rx: TaskReceiver,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Integration worker started");
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            break;
        };

        if cancel.is_cancelled() {
            service.release_leased(std::iter::once(task.id)).await;
            continue;
        }

        let outcome = service.process_task(task, &cancel).await;
        debug!(worker_id, ?outcome, "Integration task processed");
    }
    debug!(worker_id, "Integration worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff() {
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(2), Duration::from_secs(4));
        assert_eq!(retry_backoff(6), Duration::from_secs(64));
        assert_eq!(retry_backoff(19), Duration::from_secs(64));
    }
}
