//! Runtime lifecycle: scheduler, workers and the danmaku consumer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::scheduler::{TASK_CHANNEL_CAPACITY, run_scheduler};
use super::service::IntegrationService;
use super::worker::run_worker;
use crate::consumer::DanmakuConsumer;

/// Upper bound for [`IntegrationRuntime::stop`].
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IntegrationRuntime {
    service: Arc<IntegrationService>,
    consumer: Option<Arc<DanmakuConsumer>>,
    cancellation_token: Mutex<CancellationToken>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl IntegrationRuntime {
    pub fn new(service: Arc<IntegrationService>, consumer: Option<Arc<DanmakuConsumer>>) -> Self {
        Self {
            service,
            consumer,
            cancellation_token: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &Arc<IntegrationService> {
        &self.service
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Spawn the scheduler, the workers and the consumer loop.
    ///
    /// Queue settings are reloaded here; worker count and lease interval
    /// changes take effect on the next start. Calling `start` while running
    /// is a no-op.
    pub async fn start(&self) {
        if self.is_running() {
            warn!("Integration runtime already running");
            return;
        }

        let settings = self.service.queue().reload().await;
        let workers = settings.worker_count();
        let cancel = CancellationToken::new();
        *self.cancellation_token.lock() = cancel.clone();

        let (tx, rx) = mpsc::channel(TASK_CHANNEL_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut join_set = JoinSet::new();

        join_set.spawn(run_scheduler(self.service.clone(), tx, cancel.clone()));
        for worker_id in 0..workers {
            join_set.spawn(run_worker(
                worker_id,
                self.service.clone(),
                rx.clone(),
                cancel.clone(),
            ));
        }
        if let Some(consumer) = &self.consumer {
            join_set.spawn(consumer.clone().run(cancel.clone()));
        }

        *self.tasks.lock() = Some(join_set);
        info!(
            workers,
            lease_interval_ms = settings.lease_interval().as_millis() as u64,
            consumer = self.consumer.is_some(),
            "Integration runtime started"
        );
    }

    /// Cancel every loop and wait for them, aborting stragglers after
    /// [`SHUTDOWN_TIMEOUT`].
    pub async fn stop(&self) {
        self.cancellation_token.lock().cancel();

        let join_set = { self.tasks.lock().take() };
        let Some(mut join_set) = join_set else {
            return;
        };

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Integration runtime task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = join_set.len(),
                "Integration runtime did not stop in time, aborting"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }
        info!("Integration runtime stopped");
    }
}
