mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use gover::Error;
use gover::database::models::{
    EVENT_TASK_DEAD, EVENT_TASK_QUEUED, EVENT_TASK_RETRY, IntegrationFeatureSettingDbModel,
    IntegrationQueueSettingDbModel, TaskStatus,
};
use gover::database::repositories::{DeliveryLogRepository, EventRepository, TaskRepository};
use gover::database::time::now_ms;
use gover::integration::executor::{SIGNATURE_HEADER, sign_body, verify_signature};
use gover::integration::{EnqueueWebhook, Feature, TaskOutcome};

type Received = Arc<Mutex<Vec<(Option<String>, String)>>>;

async fn ok_hook(State(received): State<Received>, headers: HeaderMap, body: String) -> StatusCode {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    received.lock().push((signature, body));
    StatusCode::OK
}

async fn failing_hook() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

fn request(url: String, payload: &str) -> EnqueueWebhook {
    EnqueueWebhook {
        webhook_id: Some(42),
        webhook_name: "alerts".to_string(),
        url,
        secret: "s3cr3t".to_string(),
        event_type: "live.start".to_string(),
        payload: payload.to_string(),
        max_attempts: Some(3),
        ..Default::default()
    }
}

#[tokio::test]
async fn webhook_delivered_once_with_signature() {
    let db = common::setup_db().await;
    let service = common::build_service(&db.store);

    let received = Received::default();
    let router = Router::new()
        .route("/hook", post(ok_hook))
        .with_state(received.clone());
    let addr = common::spawn_server(router).await;

    let id = service
        .enqueue_webhook_task(request(format!("http://{addr}/hook"), r#"{"k":1}"#))
        .await
        .unwrap();

    let task = service.get_task(id).await.unwrap();
    assert_eq!(task.rate_key, "webhook:42");
    assert_eq!(task.max_attempts, 3);

    let mut leased = db.store.lease_integration_tasks(10).await.unwrap();
    assert_eq!(leased.len(), 1);
    let outcome = service
        .process_task(leased.remove(0), &CancellationToken::new())
        .await;
    assert_eq!(outcome, TaskOutcome::Succeeded);

    let task = service.get_task(id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Succeeded));
    assert_eq!(task.attempt, 1);
    assert!(task.finished_at.is_some());
    assert!(task.locked_at.is_none());

    let received = received.lock().clone();
    assert_eq!(received.len(), 1);
    let (signature, body) = &received[0];
    assert_eq!(body, r#"{"k":1}"#);
    let signature = signature.as_deref().unwrap();
    assert_eq!(Some(signature.to_string()), sign_body("s3cr3t", body.as_bytes()));
    assert!(verify_signature("s3cr3t", body.as_bytes(), signature));

    let logs = db.store.list_webhook_delivery_logs(Some(42), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].response_status, 200);
    assert!(logs[0].success);
    assert_eq!(logs[0].attempt, 1);
    assert_eq!(logs[0].request_body, r#"{"k":1}"#);

    let queued = db
        .store
        .list_live_events(Some(EVENT_TASK_QUEUED), 10)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
}

#[tokio::test]
async fn webhook_retries_then_dies() {
    let db = common::setup_db().await;
    let service = common::build_service(&db.store);
    service
        .save_queue_settings(&IntegrationQueueSettingDbModel {
            webhook_rate_gap_ms: 0,
            ..Default::default()
        })
        .await
        .unwrap();

    let addr = common::spawn_server(Router::new().route("/hook", post(failing_hook))).await;
    let id = service
        .enqueue_webhook_task(request(format!("http://{addr}/hook"), r#"{"k":1}"#))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    for attempt in 1..=2i64 {
        let mut leased = db.store.lease_integration_tasks(10).await.unwrap();
        assert_eq!(leased.len(), 1, "attempt {attempt} was not leased");
        let before = now_ms();
        let outcome = service.process_task(leased.remove(0), &cancel).await;

        let TaskOutcome::Retry { next_run_at } = outcome else {
            panic!("expected retry on attempt {attempt}, got {outcome:?}");
        };
        let expected = 1000 * (1i64 << attempt);
        let delay = next_run_at - before;
        assert!(
            delay >= expected && delay < expected + 1500,
            "attempt {attempt}: delay {delay}ms, expected about {expected}ms"
        );

        let task = service.get_task(id).await.unwrap();
        assert_eq!(task.status(), Some(TaskStatus::Pending));
        assert_eq!(task.attempt, attempt);
        assert!(db.store.lease_integration_tasks(10).await.unwrap().is_empty());

        sqlx::query("UPDATE integration_tasks SET next_run_at = 0 WHERE id = ?")
            .bind(id)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    let mut leased = db.store.lease_integration_tasks(10).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(
        service.process_task(leased.remove(0), &cancel).await,
        TaskOutcome::Dead
    );

    let task = service.get_task(id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Dead));
    assert_eq!(task.attempt, 3);
    assert!(
        task.last_error.contains("status=500 Internal Server Error"),
        "unexpected last_error: {}",
        task.last_error
    );

    let mut attempts: Vec<i64> = db
        .store
        .list_webhook_delivery_logs(Some(42), 10)
        .await
        .unwrap()
        .iter()
        .map(|log| {
            assert_eq!(log.response_status, 500);
            assert!(!log.success);
            log.attempt
        })
        .collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2, 3]);

    let retries = db.store.list_live_events(Some(EVENT_TASK_RETRY), 10).await.unwrap();
    assert_eq!(retries.len(), 2);
    let dead = db.store.list_live_events(Some(EVENT_TASK_DEAD), 10).await.unwrap();
    assert_eq!(dead.len(), 1);

    service.retry_task(id).await.unwrap();
    let task = service.get_task(id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Pending));
    assert_eq!(task.attempt, 0);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let db = common::setup_db().await;
    let service = common::build_service(&db.store);

    // No route for /missing, so the stub answers 404.
    let addr = common::spawn_server(Router::new().route("/hook", post(failing_hook))).await;
    let id = service
        .enqueue_webhook_task(request(format!("http://{addr}/missing"), "{}"))
        .await
        .unwrap();

    let mut leased = db.store.lease_integration_tasks(10).await.unwrap();
    let outcome = service
        .process_task(leased.remove(0), &CancellationToken::new())
        .await;
    assert_eq!(outcome, TaskOutcome::Dead);

    let task = service.get_task(id).await.unwrap();
    assert_eq!(task.attempt, 1);
    assert!(task.last_error.contains("status=404"));
}

#[tokio::test]
async fn enqueue_validates_and_respects_features() {
    let db = common::setup_db().await;
    let service = common::build_service(&db.store);

    let err = service
        .enqueue_webhook_task(request("ftp://example.test/hook".to_string(), "{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = service
        .enqueue_webhook_task(request("http://example.test/hook".to_string(), "{oops"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    service
        .save_feature_settings(&IntegrationFeatureSettingDbModel {
            enable_webhook: false,
            ..Default::default()
        })
        .await
        .unwrap();
    let err = service
        .enqueue_webhook_task(request("http://example.test/hook".to_string(), "{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FeatureDisabled(Feature::Webhook)));

    service
        .save_feature_settings(&IntegrationFeatureSettingDbModel {
            simple_mode: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let err = service
        .enqueue_webhook_task(request("http://example.test/hook".to_string(), "{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FeatureDisabled(Feature::TaskQueue)));

    assert!(service.list_tasks(None, 10).await.unwrap().is_empty());
}
