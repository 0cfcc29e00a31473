mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;

use gover::Error;
use gover::database::models::{NewIntegrationTask, TaskStatus, TaskType};
use gover::database::repositories::TaskRepository;
use gover::database::time::now_ms;

#[tokio::test]
async fn lease_orders_by_priority_then_id() {
    let db = common::setup_db().await;
    let store = &db.store;

    let mut ids = Vec::new();
    for priority in [300, 100, 100, 200] {
        let task = NewIntegrationTask::new(TaskType::Webhook, "{}").with_priority(priority);
        ids.push(store.create_integration_task(&task).await.unwrap());
    }

    let leased = store.lease_integration_tasks(10).await.unwrap();
    let order: Vec<i64> = leased.iter().map(|t| t.id).collect();
    assert_eq!(order, vec![ids[1], ids[2], ids[3], ids[0]]);

    for task in &leased {
        assert_eq!(task.status(), Some(TaskStatus::Running));
        assert!(task.locked_at.is_some());
    }
    assert!(store.lease_integration_tasks(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn lease_skips_future_tasks() {
    let db = common::setup_db().await;
    let store = &db.store;

    let due = store
        .create_integration_task(&NewIntegrationTask::new(TaskType::Bot, "{}"))
        .await
        .unwrap();
    store
        .create_integration_task(
            &NewIntegrationTask::new(TaskType::Bot, "{}").with_next_run_at(now_ms() + 60_000),
        )
        .await
        .unwrap();

    let leased = store.lease_integration_tasks(10).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, due);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_leases_are_disjoint() {
    const TASKS: usize = 60;

    let db = common::setup_db().await;
    for _ in 0..TASKS {
        db.store
            .create_integration_task(&NewIntegrationTask::new(TaskType::Webhook, "{}"))
            .await
            .unwrap();
    }

    let mut set = JoinSet::new();
    for _ in 0..6 {
        let store = Arc::clone(&db.store);
        set.spawn(async move {
            let mut ids = Vec::new();
            loop {
                let leased = store.lease_integration_tasks(7).await.unwrap();
                if leased.is_empty() {
                    break;
                }
                ids.extend(leased.into_iter().map(|t| t.id));
            }
            ids
        });
    }

    let mut seen = HashSet::new();
    while let Some(result) = set.join_next().await {
        for id in result.unwrap() {
            assert!(seen.insert(id), "task {id} leased twice");
        }
    }
    assert_eq!(seen.len(), TASKS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_interleave_with_leases_without_loss() {
    const TASKS: usize = 40;

    let db = common::setup_db().await;
    let produced = Arc::new(AtomicBool::new(false));

    let mut set = JoinSet::new();
    for _ in 0..4 {
        let store = Arc::clone(&db.store);
        let produced = Arc::clone(&produced);
        set.spawn(async move {
            let mut finished = Vec::new();
            loop {
                let done = produced.load(Ordering::Acquire);
                let leased = store.lease_integration_tasks(3).await.unwrap();
                if leased.is_empty() {
                    if done {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                for task in leased {
                    assert!(store.mark_integration_task_succeeded(task.id, 1).await.unwrap());
                    finished.push(task.id);
                }
            }
            finished
        });
    }

    for _ in 0..TASKS {
        db.store
            .create_integration_task(&NewIntegrationTask::new(TaskType::Bot, "{}"))
            .await
            .unwrap();
    }
    produced.store(true, Ordering::Release);

    let mut seen = HashSet::new();
    while let Some(result) = set.join_next().await {
        for id in result.unwrap() {
            assert!(seen.insert(id), "task {id} finished twice");
        }
    }
    assert_eq!(seen.len(), TASKS);

    let counts = db.store.count_integration_tasks_by_status().await.unwrap();
    assert_eq!(counts.get("succeeded"), Some(&(TASKS as i64)));
    assert_eq!(counts.get("running"), None);
}

#[tokio::test]
async fn guarded_marks_ignore_cancelled_rows() {
    let db = common::setup_db().await;
    let store = &db.store;

    let id = store
        .create_integration_task(&NewIntegrationTask::new(TaskType::Webhook, "{}"))
        .await
        .unwrap();
    store.lease_integration_tasks(1).await.unwrap();
    store.cancel_integration_task(id).await.unwrap();

    assert!(!store.mark_integration_task_succeeded(id, 1).await.unwrap());
    assert!(!store.mark_integration_task_dead(id, 1, "late").await.unwrap());

    let task = store.get_integration_task(id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Cancelled));
    assert!(task.finished_at.is_some());
    assert!(task.locked_at.is_none());
}

#[tokio::test]
async fn retry_and_cancel_transitions() {
    let db = common::setup_db().await;
    let store = &db.store;

    let id = store
        .create_integration_task(&NewIntegrationTask::new(TaskType::Webhook, "{}"))
        .await
        .unwrap();

    let err = store.retry_integration_task(id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    store.lease_integration_tasks(1).await.unwrap();
    assert!(store.mark_integration_task_dead(id, 3, "boom").await.unwrap());

    let err = store.cancel_integration_task(id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));

    store.retry_integration_task(id).await.unwrap();
    let task = store.get_integration_task(id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Pending));
    assert_eq!(task.attempt, 0);
    assert!(task.last_error.is_empty());
    assert!(task.finished_at.is_none());

    let err = store.cancel_integration_task(9999).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn last_error_is_truncated() {
    let db = common::setup_db().await;
    let store = &db.store;

    let id = store
        .create_integration_task(&NewIntegrationTask::new(TaskType::Webhook, "{}"))
        .await
        .unwrap();
    store.lease_integration_tasks(1).await.unwrap();
    let long = "x".repeat(5000);
    assert!(store
        .mark_integration_task_retry(id, 1, now_ms(), &long)
        .await
        .unwrap());

    let task = store.get_integration_task(id).await.unwrap();
    assert_eq!(task.last_error.chars().count(), 2000);
    assert_eq!(task.attempt, 1);
}

#[tokio::test]
async fn maintenance_requeue_and_cleanup() {
    let db = common::setup_db().await;
    let store = &db.store;

    let stuck = store
        .create_integration_task(&NewIntegrationTask::new(TaskType::Bot, "{}"))
        .await
        .unwrap();
    let done = store
        .create_integration_task(&NewIntegrationTask::new(TaskType::Bot, "{}"))
        .await
        .unwrap();
    store.lease_integration_tasks(10).await.unwrap();
    assert!(store.mark_integration_task_succeeded(done, 1).await.unwrap());

    let cutoff = now_ms() + 1;
    assert_eq!(store.requeue_stale_integration_tasks(cutoff).await.unwrap(), 1);
    let task = store.get_integration_task(stuck).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Pending));

    assert_eq!(
        store.cleanup_finished_integration_tasks(cutoff).await.unwrap(),
        1
    );
    assert!(matches!(
        store.get_integration_task(done).await,
        Err(Error::NotFound { .. })
    ));

    let counts = store.count_integration_tasks_by_status().await.unwrap();
    assert_eq!(counts.get("pending"), Some(&1));
    assert_eq!(counts.get("succeeded"), None);
}
