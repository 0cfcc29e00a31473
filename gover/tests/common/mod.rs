#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tempfile::TempDir;

use gover::database::models::{IntegrationTaskDbModel, TaskStatus};
use gover::database::repositories::{SqlxStore, TaskRepository};
use gover::database::{DbPool, init_pool, init_write_pool, run_migrations};
use gover::integration::executor::{
    BotExecutor, LogOnlyController, PtzBotExecutor, WebhookExecutor,
};
use gover::integration::{ExecutorRegistry, IntegrationService};

pub struct TestDb {
    pub store: Arc<SqlxStore>,
    pub pool: DbPool,
    // Keeps the database file alive.
    _dir: TempDir,
}

pub async fn setup_db() -> TestDb {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("gover.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = init_pool(&db_url).await.unwrap();
    let write_pool = init_write_pool(&db_url).await.unwrap();
    run_migrations(&pool).await.unwrap();

    TestDb {
        store: Arc::new(SqlxStore::new(pool.clone(), write_pool)),
        pool,
        _dir: dir,
    }
}

pub fn build_service(store: &Arc<SqlxStore>) -> Arc<IntegrationService> {
    let controller = Arc::new(LogOnlyController);
    let runner = Arc::new(PtzBotExecutor::new(
        controller.clone(),
        controller.clone(),
        controller,
    ));
    let executors = ExecutorRegistry::new()
        .with(Arc::new(WebhookExecutor::new(store.clone()).unwrap()))
        .with(Arc::new(BotExecutor::new(runner, store.clone())));
    Arc::new(IntegrationService::new(store.clone(), executors))
}

/// Serve `router` on an ephemeral local port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Poll the task until it reaches `status` or `timeout` elapses.
pub async fn wait_for_status(
    store: &SqlxStore,
    id: i64,
    status: TaskStatus,
    timeout: Duration,
) -> IntegrationTaskDbModel {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = store.get_integration_task(id).await.unwrap();
        if task.status() == Some(status) {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task {id} stuck in {} waiting for {status}", task.status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
