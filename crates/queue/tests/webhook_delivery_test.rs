//! Webhook delivery against a mock receiver
//!
//! Run with: cargo test -p taskrelay-queue --test webhook_delivery_test

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use taskrelay_queue::{
    build_delivery, DeliveryError, DeliveryFailure, DeliveryMode, DeliveryOutcome,
    FallbackPolicy, InMemoryKvStore, QueueConfig, TaskId, TaskPayload, TaskQueue, TaskRecord,
};

fn queue_for(server: &MockServer, fallback: FallbackPolicy, timeout: Duration) -> Arc<TaskQueue> {
    let config = QueueConfig::default()
        .with_delivery(DeliveryMode::Webhook {
            url: format!("{}/hooks/tasks", server.uri()),
            timeout,
        })
        .with_fallback(fallback);
    Arc::new(TaskQueue::new(Arc::new(InMemoryKvStore::new()), config))
}

fn task(queue: &TaskQueue, id: &str) -> TaskRecord {
    queue
        .shaper()
        .shape(
            TaskPayload::new("chat_message", "discord", "deploy finished")
                .with_id(id)
                .with_priority("high"),
        )
        .unwrap()
}

#[tokio::test]
async fn webhook_success_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/tasks"))
        .and(body_partial_json(serde_json::json!({
            "id": "t1",
            "type": "chat_message",
            "priority": "high"
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let queue = queue_for(&server, FallbackPolicy::Reject, Duration::from_secs(2));
    let delivery = build_delivery(queue.clone(), None).unwrap();
    assert_eq!(delivery.mode(), "webhook");

    let outcome = delivery.deliver(task(&queue, "t1")).await.unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Accepted(_)));

    // Nothing went through the KV queue
    assert!(queue
        .get_request(&TaskId::parse("t1").unwrap())
        .await
        .unwrap()
        .is_none());
    assert!(delivery.claim("worker-a").await.unwrap().is_none());
}

#[tokio::test]
async fn webhook_http_error_is_rejected_with_reason() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("receiver down"))
        .mount(&server)
        .await;

    let queue = queue_for(&server, FallbackPolicy::Reject, Duration::from_secs(2));
    let delivery = build_delivery(queue.clone(), None).unwrap();

    let err = delivery.deliver(task(&queue, "t1")).await.unwrap_err();
    assert_eq!(
        err.reason(),
        Some(DeliveryFailure::HttpError { status: Some(500) })
    );
    assert!(matches!(err, DeliveryError::Failed { mode: "webhook", .. }));
}

#[tokio::test]
async fn webhook_failure_falls_back_to_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let queue = queue_for(&server, FallbackPolicy::QueueFallback, Duration::from_secs(2));
    let delivery = build_delivery(queue.clone(), None).unwrap();

    let outcome = delivery.deliver(task(&queue, "t1")).await.unwrap();
    assert!(outcome.is_degraded());
    assert!(matches!(
        outcome,
        DeliveryOutcome::Degraded {
            reason: DeliveryFailure::HttpError { status: Some(502) },
            ..
        }
    ));

    // A polling worker can pick it up
    let claimed = queue.claim("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.task.id, outcome.acceptance().id);
}

#[tokio::test]
async fn webhook_timeout_is_typed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let queue = queue_for(&server, FallbackPolicy::Reject, Duration::from_millis(200));
    let delivery = build_delivery(queue.clone(), None).unwrap();

    let err = delivery.deliver(task(&queue, "t1")).await.unwrap_err();
    assert_eq!(err.reason(), Some(DeliveryFailure::Timeout));
}
