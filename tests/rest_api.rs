// tests/rest_api.rs — the REST surface end to end: bearer-token auth, scope
// checks, and the task lifecycle over HTTP against an in-memory repository.

use std::sync::Arc;

use codeq::config::{AuthToken, CodeqConfig};
use codeq::metrics::CoreMetrics;
use codeq::repo::memory::MemoryRepository;
use codeq::repo::TaskRepository;
use codeq::rest::build_router;
use codeq::scheduler::{SchedulerConfig, SchedulerService};
use codeq::subscriptions::{MemorySubscriptionStore, SubscriptionStore};
use codeq::AppContext;

const PRODUCER_TOKEN: &str = "producer-token";
const WORKER_TOKEN: &str = "worker-token";
const ADMIN_TOKEN: &str = "admin-token";

fn test_tokens() -> Vec<AuthToken> {
    vec![
        AuthToken {
            token: PRODUCER_TOKEN.into(),
            subject: "producer-1".into(),
            tenant_id: String::new(),
            scopes: Vec::new(),
            event_types: Vec::new(),
        },
        AuthToken {
            token: WORKER_TOKEN.into(),
            subject: "worker-1".into(),
            tenant_id: String::new(),
            scopes: vec![
                "codeq:claim".into(),
                "codeq:heartbeat".into(),
                "codeq:abandon".into(),
                "codeq:nack".into(),
                "codeq:result".into(),
                "codeq:subscribe".into(),
            ],
            event_types: Vec::new(),
        },
        AuthToken {
            token: ADMIN_TOKEN.into(),
            subject: "ops-1".into(),
            tenant_id: String::new(),
            scopes: vec!["codeq:admin".into()],
            event_types: Vec::new(),
        },
    ]
}

/// Boot the router on an ephemeral port and return its base URL.
async fn spawn_app() -> String {
    let mut config = CodeqConfig::new(None, None, None, None);
    config.auth_tokens = test_tokens();
    let config = Arc::new(config);

    let metrics = Arc::new(CoreMetrics::new());
    let repo: Arc<dyn TaskRepository> =
        Arc::new(MemoryRepository::default().with_metrics(Arc::clone(&metrics)));
    let scheduler = Arc::new(SchedulerService::new(
        repo,
        SchedulerConfig::default(),
        Arc::clone(&metrics),
    ));
    let subscriptions: Arc<dyn SubscriptionStore> = Arc::new(MemorySubscriptionStore::new());

    let ctx = Arc::new(AppContext {
        config,
        scheduler,
        subscriptions,
        metrics,
        store: None,
        started_at: std::time::Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(ctx);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn healthz_and_metrics_need_no_auth() {
    let base = spawn_app().await;

    let health = client().get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let metrics = client().get(format!("{base}/metrics")).send().await.unwrap();
    assert_eq!(metrics.status(), 200);
    assert!(metrics.text().await.unwrap().contains("codeq_tasks_created_total"));
}

#[tokio::test]
async fn missing_or_unknown_token_is_unauthorized() {
    let base = spawn_app().await;

    let resp = client()
        .post(format!("{base}/v1/codeq/tasks"))
        .json(&serde_json::json!({"command": "build"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client()
        .post(format!("{base}/v1/codeq/tasks"))
        .bearer_auth("nope")
        .json(&serde_json::json!({"command": "build"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn claim_without_the_scope_is_forbidden() {
    let base = spawn_app().await;

    let resp = client()
        .post(format!("{base}/v1/codeq/tasks/claim"))
        .bearer_auth(PRODUCER_TOKEN)
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn task_lifecycle_over_http() {
    let base = spawn_app().await;
    let client = client();

    // Producer enqueues.
    let resp = client
        .post(format!("{base}/v1/codeq/tasks"))
        .bearer_auth(PRODUCER_TOKEN)
        .json(&serde_json::json!({
            "command": "PROCESS_ORDER",
            "payload": {"orderId": "o-1"},
            "priority": 5,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let task: serde_json::Value = resp.json().await.unwrap();
    let task_id = task["id"].as_str().unwrap().to_string();
    assert_eq!(task["status"], "PENDING");

    // Worker claims it.
    let resp = client
        .post(format!("{base}/v1/codeq/tasks/claim"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({"commands": ["PROCESS_ORDER"], "leaseSeconds": 60}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let claimed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(claimed["id"], task_id.as_str());
    assert_eq!(claimed["status"], "IN_PROGRESS");
    assert_eq!(claimed["attempts"], 1);

    // Heartbeat keeps the lease alive.
    let resp = client
        .post(format!("{base}/v1/codeq/tasks/{task_id}/heartbeat"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({"extendSeconds": 120}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Result submission completes it.
    let resp = client
        .post(format!("{base}/v1/codeq/tasks/{task_id}/result"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({"status": "COMPLETED", "result": {"ok": true}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Anyone authenticated can read the result back.
    let resp = client
        .get(format!("{base}/v1/codeq/tasks/{task_id}/result"))
        .bearer_auth(PRODUCER_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["task"]["status"], "COMPLETED");
    assert_eq!(body["result"]["result"]["ok"], true);

    // A second submission conflicts.
    let resp = client
        .post(format!("{base}/v1/codeq/tasks/{task_id}/result"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({"status": "COMPLETED", "result": {"ok": true}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn claim_on_an_empty_queue_returns_no_content() {
    let base = spawn_app().await;

    let resp = client()
        .post(format!("{base}/v1/codeq/tasks/claim"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({"commands": ["nothing-here"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn nack_reports_the_computed_delay() {
    let base = spawn_app().await;
    let client = client();

    client
        .post(format!("{base}/v1/codeq/tasks"))
        .bearer_auth(PRODUCER_TOKEN)
        .json(&serde_json::json!({"command": "build"}))
        .send()
        .await
        .unwrap();
    let claimed: serde_json::Value = client
        .post(format!("{base}/v1/codeq/tasks/claim"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({"commands": ["build"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = claimed["id"].as_str().unwrap();

    let resp = client
        .post(format!("{base}/v1/codeq/tasks/{task_id}/nack"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({"delaySeconds": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "PENDING");
    // exponential, base 5, attempts 1 → 10.
    assert_eq!(body["delaySeconds"], 10);
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let base = spawn_app().await;
    let resp = client()
        .get(format!("{base}/v1/codeq/tasks/no-such-id"))
        .bearer_auth(PRODUCER_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn admin_routes_require_the_admin_scope() {
    let base = spawn_app().await;
    let client = client();

    let resp = client
        .get(format!("{base}/v1/codeq/admin/queues"))
        .bearer_auth(WORKER_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    client
        .post(format!("{base}/v1/codeq/tasks"))
        .bearer_auth(PRODUCER_TOKEN)
        .json(&serde_json::json!({"command": "build"}))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{base}/v1/codeq/admin/queues/build"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["ready"], 1);

    let resp = client
        .post(format!("{base}/v1/codeq/admin/tasks/cleanup"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&serde_json::json!({"limit": 10}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["limit"], 10);
}

#[tokio::test]
async fn subscriptions_register_and_renew() {
    let base = spawn_app().await;
    let client = client();

    let resp = client
        .post(format!("{base}/v1/codeq/workers/subscriptions"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({
            "callbackUrl": "https://worker.example/hooks/avail",
            "eventTypes": ["build"],
            "minIntervalSeconds": 30,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let sub: serde_json::Value = resp.json().await.unwrap();
    let sub_id = sub["id"].as_str().unwrap();
    assert_eq!(sub["deliveryMode"], "fanout");

    let resp = client
        .post(format!("{base}/v1/codeq/workers/subscriptions/{sub_id}/heartbeat"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({"ttlSeconds": 600}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base}/v1/codeq/workers/subscriptions/missing/heartbeat"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{base}/v1/codeq/workers/subscriptions"))
        .bearer_auth(WORKER_TOKEN)
        .json(&serde_json::json!({
            "callbackUrl": "ftp://worker.example/nope",
            "eventTypes": ["build"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
