//! Integration task repository.
//!
//! Every status change is a guarded `UPDATE ... WHERE status = ?` so a
//! concurrent cancel is never overwritten by a worker finishing late.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use super::SqlxStore;
use crate::database::models::{IntegrationTaskDbModel, NewIntegrationTask, TaskStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{begin_immediate, time::now_ms};
use crate::utils::truncate_chars;
use crate::{Error, Result};

/// Upper bound for a single lease call.
pub const MAX_LEASE_LIMIT: i64 = 200;

/// Stored `last_error` values are truncated to this many characters.
pub const MAX_LAST_ERROR_CHARS: usize = 2000;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_integration_task(&self, task: &NewIntegrationTask) -> Result<i64>;
    async fn get_integration_task(&self, id: i64) -> Result<IntegrationTaskDbModel>;
    async fn list_integration_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<IntegrationTaskDbModel>>;
    async fn count_integration_tasks_by_status(&self) -> Result<BTreeMap<String, i64>>;

    /// Atomically move up to `limit` due tasks from pending to running.
    async fn lease_integration_tasks(&self, limit: i64) -> Result<Vec<IntegrationTaskDbModel>>;

    // Terminal transitions, guarded on status = running. `Ok(false)` means
    // the row was no longer running.
    async fn mark_integration_task_succeeded(&self, id: i64, attempt: i64) -> Result<bool>;
    async fn mark_integration_task_retry(
        &self,
        id: i64,
        attempt: i64,
        next_run_at: i64,
        error: &str,
    ) -> Result<bool>;
    async fn mark_integration_task_dead(&self, id: i64, attempt: i64, error: &str)
    -> Result<bool>;
    /// Hand a leased task back without consuming an attempt.
    async fn release_integration_task(&self, id: i64) -> Result<bool>;

    /// dead | cancelled -> pending, attempt reset.
    async fn retry_integration_task(&self, id: i64) -> Result<()>;
    /// pending | running -> cancelled.
    async fn cancel_integration_task(&self, id: i64) -> Result<()>;

    /// Return running tasks locked before `locked_before` to pending.
    async fn requeue_stale_integration_tasks(&self, locked_before: i64) -> Result<u64>;
    /// Delete finished tasks older than `finished_before`.
    async fn cleanup_finished_integration_tasks(&self, finished_before: i64) -> Result<u64>;
}

impl SqlxStore {
    async fn lease_once(&self, limit: i64) -> Result<Vec<IntegrationTaskDbModel>> {
        let now = now_ms();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let candidates = sqlx::query_as::<_, IntegrationTaskDbModel>(
            r#"
            SELECT * FROM integration_tasks
            WHERE status = 'pending' AND next_run_at <= ?
            ORDER BY priority ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut leased = Vec::with_capacity(candidates.len());
        for mut task in candidates {
            let result = sqlx::query(
                r#"
                UPDATE integration_tasks
                SET status = 'running', locked_at = ?, updated_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(task.id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                task.status = TaskStatus::Running.to_string();
                task.locked_at = Some(now);
                task.updated_at = now;
                leased.push(task);
            }
        }

        tx.commit().await?;
        Ok(leased)
    }

    async fn transition_error(&self, id: i64, to: TaskStatus) -> Error {
        match self.get_integration_task(id).await {
            Ok(task) => Error::InvalidStateTransition {
                from: task.status,
                to: to.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskRepository for SqlxStore {
    async fn create_integration_task(&self, task: &NewIntegrationTask) -> Result<i64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO integration_tasks
                (task_type, status, priority, payload, attempt, max_attempts,
                 next_run_at, last_error, rate_key, created_at, updated_at)
            VALUES (?, 'pending', ?, ?, 0, ?, ?, '', ?, ?, ?)
            "#,
        )
        .bind(task.task_type.as_ref())
        .bind(task.effective_priority())
        .bind(task.effective_payload())
        .bind(task.effective_max_attempts())
        .bind(task.next_run_at.unwrap_or(now))
        .bind(task.rate_key.trim())
        .bind(now)
        .bind(now)
        .execute(&self.write_pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_integration_task(&self, id: i64) -> Result<IntegrationTaskDbModel> {
        sqlx::query_as::<_, IntegrationTaskDbModel>("SELECT * FROM integration_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("IntegrationTask", id.to_string()))
    }

    async fn list_integration_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<IntegrationTaskDbModel>> {
        let limit = limit.clamp(1, 1000);
        let tasks = match status {
            Some(status) => {
                sqlx::query_as::<_, IntegrationTaskDbModel>(
                    "SELECT * FROM integration_tasks WHERE status = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(status.as_ref())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, IntegrationTaskDbModel>(
                    "SELECT * FROM integration_tasks ORDER BY id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(tasks)
    }

    async fn count_integration_tasks_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM integration_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn lease_integration_tasks(&self, limit: i64) -> Result<Vec<IntegrationTaskDbModel>> {
        let limit = limit.clamp(1, MAX_LEASE_LIMIT);
        let leased = retry_on_sqlite_busy("lease_integration_tasks", || self.lease_once(limit)).await?;
        if !leased.is_empty() {
            debug!(count = leased.len(), "Leased integration tasks");
        }
        Ok(leased)
    }

    async fn mark_integration_task_succeeded(&self, id: i64, attempt: i64) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE integration_tasks
            SET status = 'succeeded', attempt = MAX(attempt, ?), last_error = '',
                locked_at = NULL, finished_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(attempt)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_integration_task_retry(
        &self,
        id: i64,
        attempt: i64,
        next_run_at: i64,
        error: &str,
    ) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE integration_tasks
            SET status = 'pending', attempt = MAX(attempt, ?), next_run_at = ?, last_error = ?,
                locked_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(attempt)
        .bind(next_run_at)
        .bind(truncate_chars(error, MAX_LAST_ERROR_CHARS))
        .bind(now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_integration_task_dead(
        &self,
        id: i64,
        attempt: i64,
        error: &str,
    ) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE integration_tasks
            SET status = 'dead', attempt = MAX(attempt, ?), last_error = ?,
                locked_at = NULL, finished_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(attempt)
        .bind(truncate_chars(error, MAX_LAST_ERROR_CHARS))
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_integration_task(&self, id: i64) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE integration_tasks
            SET status = 'pending', locked_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn retry_integration_task(&self, id: i64) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE integration_tasks
            SET status = 'pending', attempt = 0, last_error = '', next_run_at = ?,
                locked_at = NULL, finished_at = NULL, updated_at = ?
            WHERE id = ? AND status IN ('dead', 'cancelled')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Pending).await);
        }
        Ok(())
    }

    async fn cancel_integration_task(&self, id: i64) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE integration_tasks
            SET status = 'cancelled', locked_at = NULL, finished_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.write_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Cancelled).await);
        }
        Ok(())
    }

    async fn requeue_stale_integration_tasks(&self, locked_before: i64) -> Result<u64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE integration_tasks
            SET status = 'pending', locked_at = NULL, updated_at = ?
            WHERE status = 'running' AND locked_at < ?
            "#,
        )
        .bind(now)
        .bind(locked_before)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_finished_integration_tasks(&self, finished_before: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM integration_tasks
            WHERE status IN ('succeeded', 'dead', 'cancelled') AND finished_at < ?
            "#,
        )
        .bind(finished_before)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected())
    }
}
