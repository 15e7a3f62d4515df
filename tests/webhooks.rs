// tests/webhooks.rs — availability notification delivery modes and the
// result-callback dispatcher, against wiremock endpoints.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use codeq::callbacks::{CallbackConfig, CallbackDispatcher};
use codeq::metrics::CoreMetrics;
use codeq::model::{DeliveryMode, NewTask, TaskResult, TaskStatus};
use codeq::notify::{signing, Notifier, NotifierConfig};
use codeq::subscriptions::{build_subscription, MemorySubscriptionStore, NewSubscription, SubscriptionStore};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn metrics() -> Arc<CoreMetrics> {
    Arc::new(CoreMetrics::new())
}

async fn mock_endpoint() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

async fn subscribe(
    store: &MemorySubscriptionStore,
    url: &str,
    mode: DeliveryMode,
    group: Option<&str>,
    min_interval: u64,
) -> String {
    let sub = build_subscription(
        NewSubscription {
            callback_url: url.into(),
            event_types: vec!["build".into()],
            delivery_mode: Some(mode),
            group_id: group.map(|g| g.to_string()),
            min_interval_seconds: min_interval,
            ttl_seconds: 600,
        },
        Utc::now(),
    )
    .unwrap();
    store.create(sub.clone()).await.unwrap();
    sub.id
}

async fn wait_for_requests(server: &MockServer, expected: usize) -> Vec<wiremock::Request> {
    for _ in 0..50 {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= expected {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    server.received_requests().await.unwrap_or_default()
}

fn notifier(store: Arc<MemorySubscriptionStore>, secret: Option<&str>) -> Notifier {
    Notifier::new(
        store,
        NotifierConfig {
            claim_url: "http://scheduler.local/v1/codeq/tasks/claim".into(),
            secret: secret.map(|s| s.to_string()),
        },
        metrics(),
    )
}

#[tokio::test]
async fn fanout_delivers_to_every_live_subscriber_with_signature() {
    let store = Arc::new(MemorySubscriptionStore::new());
    let a = mock_endpoint().await;
    let b = mock_endpoint().await;
    subscribe(&store, &a.uri(), DeliveryMode::Fanout, None, 0).await;
    subscribe(&store, &b.uri(), DeliveryMode::Fanout, None, 0).await;

    notifier(store, Some("topsecret"))
        .queue_non_empty("build", 4)
        .await;

    for server in [&a, &b] {
        let requests = wait_for_requests(server, 1).await;
        assert_eq!(requests.len(), 1);
        let request = &requests[0];

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["eventType"], "build");
        assert_eq!(body["available"], true);
        assert_eq!(body["queueDepth"], 4);
        assert!(body["claimUrl"].as_str().unwrap().contains("/tasks/claim"));
        assert!(body["notificationId"].as_str().is_some());

        let ts: i64 = request
            .headers
            .get(signing::TIMESTAMP_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let sig = request
            .headers
            .get(signing::SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        let raw = std::str::from_utf8(&request.body).unwrap();
        assert!(signing::verify("topsecret", ts, raw, sig));
    }
}

#[tokio::test]
async fn group_mode_rotates_between_members() {
    let store = Arc::new(MemorySubscriptionStore::new());
    let a = mock_endpoint().await;
    let b = mock_endpoint().await;
    subscribe(&store, &a.uri(), DeliveryMode::Group, Some("pool"), 0).await;
    subscribe(&store, &b.uri(), DeliveryMode::Group, Some("pool"), 0).await;

    let notifier = notifier(store, None);
    notifier.queue_non_empty("build", 1).await;
    notifier.queue_non_empty("build", 2).await;

    let a_requests = wait_for_requests(&a, 1).await;
    let b_requests = wait_for_requests(&b, 1).await;
    assert_eq!(
        a_requests.len() + b_requests.len(),
        2,
        "round-robin should pick one member per hint"
    );
    assert_eq!(a_requests.len(), 1);
    assert_eq!(b_requests.len(), 1);
}

#[tokio::test]
async fn hash_mode_picks_exactly_one() {
    let store = Arc::new(MemorySubscriptionStore::new());
    let a = mock_endpoint().await;
    let b = mock_endpoint().await;
    subscribe(&store, &a.uri(), DeliveryMode::Hash, None, 0).await;
    subscribe(&store, &b.uri(), DeliveryMode::Hash, None, 0).await;

    notifier(store, None).queue_non_empty("build", 1).await;

    let total = wait_for_requests(&a, 0).await.len() + wait_for_requests(&b, 0).await.len();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn per_subscription_rate_limit_suppresses_repeat_sends() {
    let store = Arc::new(MemorySubscriptionStore::new());
    let a = mock_endpoint().await;
    subscribe(&store, &a.uri(), DeliveryMode::Fanout, None, 60).await;

    let notifier = notifier(store, None);
    notifier.queue_non_empty("build", 1).await;
    notifier.queue_non_empty("build", 2).await;

    let requests = wait_for_requests(&a, 1).await;
    assert_eq!(requests.len(), 1, "second hint lands inside minIntervalSeconds");
}

#[tokio::test]
async fn expired_subscription_gets_nothing() {
    let store = Arc::new(MemorySubscriptionStore::new());
    let a = mock_endpoint().await;
    let id = subscribe(&store, &a.uri(), DeliveryMode::Fanout, None, 0).await;
    // Push the expiry into the past via a negative-TTL heartbeat equivalent:
    // recreate with an already-expired record.
    let mut sub = store.live_subscriptions("build").await.unwrap()[0].clone();
    assert_eq!(sub.id, id);
    sub.expires_at = Utc::now() - chrono::Duration::seconds(1);
    store.create(sub).await.unwrap();

    notifier(store, None).queue_non_empty("build", 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.received_requests().await.unwrap_or_default().is_empty());
}

// ─── Result callbacks ─────────────────────────────────────────────────────────

fn finished_task_and_result(webhook: &str) -> (codeq::model::Task, TaskResult) {
    let mut task = NewTask {
        command: "build".into(),
        payload: "{}".into(),
        priority: 5,
        max_attempts: 3,
        webhook: Some(webhook.to_string()),
        trace_parent: Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".into()),
        ..Default::default()
    }
    .into_task(Utc::now());
    task.status = TaskStatus::Completed;

    let result = TaskResult {
        task_id: task.id.clone(),
        status: TaskStatus::Completed,
        result: Some(serde_json::json!({"ok": true})),
        error: None,
        artifacts: Vec::new(),
        completed_at: Utc::now(),
    };
    (task, result)
}

#[tokio::test]
async fn callback_retries_until_success_and_propagates_trace_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = CallbackDispatcher::new(
        CallbackConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            ..CallbackConfig::default()
        },
        metrics(),
    );
    let (task, result) = finished_task_and_result(&server.uri());
    dispatcher.dispatch(&task, &result);

    let requests = wait_for_requests(&server, 3).await;
    assert_eq!(requests.len(), 3, "two failures then the success");

    let last = requests.last().unwrap();
    let body: serde_json::Value = serde_json::from_slice(&last.body).unwrap();
    assert_eq!(body["taskId"], task.id.as_str());
    assert_eq!(body["eventType"], "build");
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["result"]["ok"], true);

    assert!(last.headers.get("traceparent").is_some());
    assert!(
        last.headers.get("baggage").is_none(),
        "baggage must not leak to third-party endpoints"
    );
}

#[tokio::test]
async fn callback_attempt_budget_is_finite() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dispatcher = CallbackDispatcher::new(
        CallbackConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            ..CallbackConfig::default()
        },
        metrics(),
    );
    let (task, result) = finished_task_and_result(&server.uri());
    dispatcher.dispatch(&task, &result);

    let requests = wait_for_requests(&server, 3).await;
    assert_eq!(requests.len(), 3);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn tasks_without_webhook_produce_no_callback() {
    let server = MockServer::start().await;
    let dispatcher = CallbackDispatcher::new(CallbackConfig::default(), metrics());

    let (mut task, result) = finished_task_and_result(&server.uri());
    task.webhook = None;
    dispatcher.dispatch(&task, &result);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}
