//! Lease loop feeding the worker channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::feature::Feature;
use super::rate_limiter::RATE_ENTRY_TTL;
use super::service::IntegrationService;
use crate::database::models::IntegrationTaskDbModel;

/// Tasks leased per tick.
pub const LEASE_BATCH: i64 = 48;

/// Capacity of the scheduler to worker channel.
pub const TASK_CHANNEL_CAPACITY: usize = 128;

impl IntegrationService {
    /// One scheduler tick: lease due tasks and hand them to the workers.
    ///
    /// Returns the number of tasks handed over. Tasks that could not be
    /// delivered because of shutdown are released back to pending.
    pub async fn scheduler_tick(
        &self,
        tx: &mpsc::Sender<IntegrationTaskDbModel>,
        cancel: &CancellationToken,
    ) -> usize {
        let sent = if self.features().enabled(Feature::TaskQueue).await {
            self.lease_and_dispatch(tx, cancel).await
        } else {
            0
        };

        let evicted = self.limiter().evict_older_than(RATE_ENTRY_TTL);
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate limit entries");
        }
        sent
    }

    async fn lease_and_dispatch(
        &self,
        tx: &mpsc::Sender<IntegrationTaskDbModel>,
        cancel: &CancellationToken,
    ) -> usize {
        let tasks = match self.store().lease_integration_tasks(LEASE_BATCH).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to lease integration tasks");
                return 0;
            }
        };

        let total = tasks.len();
        let mut pending = tasks.into_iter();
        let mut sent = 0;
        while let Some(task) = pending.next() {
            let id = task.id;
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                result = tx.send(task) => result.is_ok(),
            };
            if !delivered {
                self.release_leased(std::iter::once(id).chain(pending.by_ref().map(|t| t.id)))
                    .await;
                break;
            }
            sent += 1;
        }

        if total > 0 {
            debug!(leased = total, sent, "Scheduler tick");
        }
        sent
    }

    pub(crate) async fn release_leased(&self, ids: impl Iterator<Item = i64>) {
        for id in ids {
            match self.store().release_integration_task(id).await {
                Ok(true) => debug!(task_id = id, "Released leased task"),
                Ok(false) => {}
                Err(e) => warn!(task_id = id, error = %e, "Failed to release leased task"),
            }
        }
    }
}

/// Tick until cancelled. Dropping `tx` on return closes the worker channel.
pub async fn run_scheduler(
    service: Arc<IntegrationService>,
    tx: mpsc::Sender<IntegrationTaskDbModel>,
    cancel: CancellationToken,
) {
    info!("Integration scheduler started");
    loop {
        service.scheduler_tick(&tx, &cancel).await;

        let interval = service.queue().get().await.lease_interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Integration scheduler stopped");
}
