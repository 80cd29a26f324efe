//! End-to-end interception tests: a real proxy listener in front of a
//! recording stub upstream, driven over HTTP.

use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use vouch_core::event::{Event, EventType, HASH_SIZE};
use vouch_core::policy::{PolicyConfig, PolicyHandle, REDACTED};
use vouch_core::worker::{LedgerWorker, WorkerConfig};
use vouch_core::{verify_run, ApprovalGateway, Signer, Store, TaskState};
use vouch_proxy::state::{ProxyState, SharedState};
use vouch_proxy::{control, interceptor};

struct UpstreamLog {
    calls: AtomicUsize,
    bodies: Mutex<Vec<Vec<u8>>>,
}

async fn upstream_handler(State(log): State<Arc<UpstreamLog>>, body: Bytes) -> Json<Value> {
    log.calls.fetch_add(1, Ordering::SeqCst);
    log.bodies.lock().unwrap().push(body.to_vec());
    Json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": { "task_id": "T1", "state": "completed", "ok": true },
    }))
}

struct TestProxy {
    store: Store,
    run_id: String,
    proxy_url: String,
    control_url: String,
    upstream: Arc<UpstreamLog>,
    state: SharedState,
    client: reqwest::Client,
    _key_dir: TempDir,
}

async fn start_proxy(policy_yaml: &str, stall_timeout: Option<Duration>) -> TestProxy {
    let upstream = Arc::new(UpstreamLog {
        calls: AtomicUsize::new(0),
        bodies: Mutex::new(Vec::new()),
    });
    let upstream_app = Router::new()
        .route("/", post(upstream_handler))
        .with_state(Arc::clone(&upstream));
    let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_url = format!("http://{}/", upstream_listener.local_addr().unwrap());
    tokio::spawn(axum::serve(upstream_listener, upstream_app).into_future());

    let key_dir = TempDir::new().unwrap();
    let store = Store::in_memory().unwrap();
    let signer = Signer::load_or_generate(key_dir.path().join(".vouch_key")).unwrap();
    let worker = LedgerWorker::start(store.clone(), signer, WorkerConfig::default()).unwrap();
    let run_id = worker.run_id().to_string();

    let state: SharedState = Arc::new(ProxyState {
        worker,
        gateway: ApprovalGateway::new(),
        policy: PolicyHandle::new(PolicyConfig::from_yaml(policy_yaml).unwrap()),
        store: store.clone(),
        upstream: reqwest::Client::new(),
        upstream_url,
        active_tasks: dashmap::DashMap::new(),
        last_event_by_task: dashmap::DashMap::new(),
        stall_timeout,
    });

    let proxy_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_url = format!("http://{}/", proxy_listener.local_addr().unwrap());
    tokio::spawn(
        axum::serve(proxy_listener, interceptor::router(Arc::clone(&state))).into_future(),
    );

    let control_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_url = format!("http://{}", control_listener.local_addr().unwrap());
    tokio::spawn(axum::serve(control_listener, control::router(Arc::clone(&state))).into_future());

    TestProxy {
        store,
        run_id,
        proxy_url,
        control_url,
        upstream,
        state,
        client: reqwest::Client::new(),
        _key_dir: key_dir,
    }
}

impl TestProxy {
    async fn post(&self, body: Value) -> reqwest::Response {
        self.client
            .post(&self.proxy_url)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Polls the ledger until an event satisfying `pred` is committed.
    async fn wait_for_event(&self, pred: impl Fn(&Event) -> bool) -> Event {
        for _ in 0..300 {
            let recent = self.store.recent_events(&self.run_id, 100).unwrap();
            if let Some(event) = recent.into_iter().rev().find(|e| pred(e)) {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected event was never committed");
    }

    fn events(&self) -> Vec<Event> {
        self.store.recent_events(&self.run_id, 1000).unwrap()
    }
}

const ALLOW_ALL: &str = r#"
version: "1.0"
policies:
  - id: allow-all
    match_methods: ["*"]
    action: allow
"#;

const STALL_DB_DROP: &str = r#"
version: "1.0"
policies:
  - id: block-db-drop
    match_methods: ["db.drop_root"]
    action: stall
    risk_level: critical
"#;

const REDACT_LOGIN: &str = r#"
version: "1.0"
policies:
  - id: redact-credentials
    match_methods: ["auth.login"]
    action: allow
    risk_level: high
    redact: ["password", "token"]
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allow_path_commits_call_and_response() {
    let proxy = start_proxy(ALLOW_ALL, None).await;

    let response = proxy
        .post(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "fs.read",
            "params": { "path": "/etc/hosts", "task_id": "T1" },
        }))
        .await;
    assert_eq!(response.status(), 200);
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["result"]["ok"], json!(true));

    let call = proxy
        .wait_for_event(|e| e.event_type == EventType::ToolCall)
        .await;
    assert_eq!(call.method, "fs.read");
    assert_eq!(call.task_id, "T1");
    assert_eq!(call.parent_id, "");
    assert_eq!(call.params, json!({"path": "/etc/hosts", "task_id": "T1"}));
    assert_eq!(call.policy_id, "allow-all");

    let tool_response = proxy
        .wait_for_event(|e| e.event_type == EventType::ToolResponse)
        .await;
    assert_eq!(tool_response.response["ok"], json!(true));
    assert_eq!(tool_response.task_id, "T1");
    assert_eq!(tool_response.task_state, TaskState::Completed);
    assert!(tool_response.seq > call.seq);

    // The upstream saw the original body exactly once.
    assert_eq!(proxy.upstream.calls.load(Ordering::SeqCst), 1);
    let bodies = proxy.upstream.bodies.lock().unwrap();
    let forwarded: Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(forwarded["params"]["path"], json!("/etc/hosts"));

    // The whole chain verifies.
    let report = verify_run(&proxy.store, &proxy.run_id).unwrap();
    assert!(report.valid, "{report:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_call_links_task_parent() {
    let proxy = start_proxy(ALLOW_ALL, None).await;

    let body = json!({
        "jsonrpc": "2.0", "id": 1, "method": "fs.read",
        "params": { "path": "/a", "task_id": "T9" },
    });
    assert_eq!(proxy.post(body.clone()).await.status(), 200);
    let first = proxy
        .wait_for_event(|e| e.event_type == EventType::ToolCall)
        .await;

    assert_eq!(proxy.post(body).await.status(), 200);
    let second = proxy
        .wait_for_event(|e| e.event_type == EventType::ToolCall && e.seq > first.seq)
        .await;
    assert_eq!(second.parent_id, first.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stall_then_approve_forwards_once() {
    let proxy = start_proxy(STALL_DB_DROP, None).await;

    let request = tokio::spawn({
        let client = proxy.client.clone();
        let url = proxy.proxy_url.clone();
        async move {
            client
                .post(&url)
                .json(&json!({
                    "jsonrpc": "2.0", "id": 7, "method": "db.drop_root",
                    "params": { "table": "users", "task_id": "T2" },
                }))
                .send()
                .await
                .unwrap()
        }
    });

    let blocked = proxy
        .wait_for_event(|e| e.event_type == EventType::Blocked)
        .await;
    assert!(blocked.was_blocked);
    assert_eq!(blocked.risk_level, "critical");
    assert_eq!(blocked.policy_id, "block-db-drop");
    assert_eq!(blocked.task_state, TaskState::Stalled);

    // The request is still blocked; upstream untouched.
    assert_eq!(proxy.upstream.calls.load(Ordering::SeqCst), 0);

    let approved = proxy
        .client
        .post(format!("{}/api/approve/{}", proxy.control_url, blocked.id))
        .send()
        .await
        .unwrap();
    assert_eq!(approved.status(), 200);

    let response = request.await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(proxy.upstream.calls.load(Ordering::SeqCst), 1);

    let approval = proxy
        .wait_for_event(|e| e.event_type == EventType::Approval)
        .await;
    assert_eq!(approval.parent_id, blocked.id);

    let call = proxy
        .wait_for_event(|e| e.event_type == EventType::ToolCall)
        .await;
    assert_eq!(call.method, "db.drop_root");

    // Approving again after resolution reports the id as gone.
    let again = proxy
        .client
        .post(format!("{}/api/approve/{}", proxy.control_url, blocked.id))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stall_then_reject_returns_403_and_never_forwards() {
    let proxy = start_proxy(STALL_DB_DROP, None).await;

    let request = tokio::spawn({
        let client = proxy.client.clone();
        let url = proxy.proxy_url.clone();
        async move {
            client
                .post(&url)
                .json(&json!({
                    "jsonrpc": "2.0", "id": 7, "method": "db.drop_root",
                    "params": { "table": "users", "task_id": "T3" },
                }))
                .send()
                .await
                .unwrap()
        }
    });

    let blocked = proxy
        .wait_for_event(|e| e.event_type == EventType::Blocked)
        .await;

    let rejected = proxy
        .client
        .post(format!("{}/api/reject/{}", proxy.control_url, blocked.id))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 200);

    let response = request.await.unwrap();
    assert_eq!(response.status(), 403);

    let rejection = proxy
        .wait_for_event(|e| e.event_type == EventType::Rejection)
        .await;
    assert_eq!(rejection.parent_id, blocked.id);
    assert_eq!(rejection.params["reason"], json!("rejected"));

    assert_eq!(proxy.upstream.calls.load(Ordering::SeqCst), 0);
    assert!(!proxy
        .events()
        .iter()
        .any(|e| e.event_type == EventType::ToolCall));

    // Stall intelligence: the rejection counted against the task.
    assert_eq!(proxy.store.get_task_failure_count("T3").unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stall_timeout_commits_rejection() {
    let proxy = start_proxy(STALL_DB_DROP, Some(Duration::from_millis(100))).await;

    let response = proxy
        .post(json!({
            "jsonrpc": "2.0", "id": 7, "method": "db.drop_root",
            "params": { "table": "users", "task_id": "T4" },
        }))
        .await;
    assert_eq!(response.status(), 403);

    let rejection = proxy
        .wait_for_event(|e| e.event_type == EventType::Rejection)
        .await;
    assert_eq!(rejection.params["reason"], json!("stall_timeout"));
    assert_eq!(proxy.upstream.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redaction_scrubs_ledger_but_not_upstream() {
    let proxy = start_proxy(REDACT_LOGIN, None).await;

    let response = proxy
        .post(json!({
            "jsonrpc": "2.0", "id": 2, "method": "auth.login",
            "params": { "user": "a", "password": "p", "token": "t" },
        }))
        .await;
    assert_eq!(response.status(), 200);

    let call = proxy
        .wait_for_event(|e| e.event_type == EventType::ToolCall)
        .await;
    assert_eq!(
        call.params,
        json!({"user": "a", "password": REDACTED, "token": REDACTED})
    );

    // The forwarded body still carries the original values.
    let bodies = proxy.upstream.bodies.lock().unwrap();
    let forwarded: Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(forwarded["params"]["password"], json!("p"));
    assert_eq!(forwarded["params"]["token"], json!("t"));

    // No original value leaks into any committed event.
    drop(bodies);
    for event in proxy.events() {
        let committed = serde_json::to_string(&event.params).unwrap();
        assert!(!committed.contains("\"p\""), "password leaked: {committed}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn guards_reject_bad_requests() {
    let proxy = start_proxy(ALLOW_ALL, None).await;

    // Non-POST.
    let response = proxy.client.get(&proxy.proxy_url).send().await.unwrap();
    assert_eq!(response.status(), 400);

    // Unparseable JSON.
    let response = proxy
        .client
        .post(&proxy.proxy_url)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["error"]["code"], json!(-32700));

    // Missing method.
    let response = proxy.post(json!({"jsonrpc": "2.0", "id": 1})).await;
    assert_eq!(response.status(), 400);
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["error"]["code"], json!(-32600));

    // Oversized task_id.
    let response = proxy
        .post(json!({
            "jsonrpc": "2.0", "id": 1, "method": "fs.read",
            "params": { "task_id": "x".repeat(65) },
        }))
        .await;
    assert_eq!(response.status(), 400);

    // Oversized body.
    let huge = format!(
        r#"{{"jsonrpc":"2.0","id":1,"method":"fs.read","params":{{"blob":"{}"}}}}"#,
        "x".repeat(6 * 1024 * 1024)
    );
    let response = proxy
        .client
        .post(&proxy.proxy_url)
        .body(huge)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // None of it reached the upstream or the ledger.
    assert_eq!(proxy.upstream.calls.load(Ordering::SeqCst), 0);
    assert!(!proxy
        .events()
        .iter()
        .any(|e| e.event_type == EventType::ToolCall));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unhealthy_ledger_fails_closed() {
    let proxy = start_proxy(ALLOW_ALL, None).await;

    // Poison the chain head behind the worker's back so its next commit
    // fails and flips the health flag.
    let head = proxy.store.last_event(&proxy.run_id).unwrap().unwrap();
    let mut rogue = Event::new(EventType::ToolCall).with_method("rogue.write");
    rogue.run_id = proxy.run_id.clone();
    rogue.seq = head.seq + 1;
    rogue.prev_hash = head.hash;
    rogue.hash = vec![0u8; HASH_SIZE];
    rogue.sig = vec![0u8; 64];
    rogue.key_id = "deadbeef".to_string();
    proxy.store.append_event(&rogue).unwrap();

    let body = json!({
        "jsonrpc": "2.0", "id": 1, "method": "fs.read", "params": {},
    });
    let _ = proxy.post(body.clone()).await;

    for _ in 0..300 {
        if !proxy.state.worker.is_healthy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!proxy.state.worker.is_healthy());

    // Every subsequent request is turned away and nothing is appended.
    let before = proxy.events().len();
    let response = proxy.post(body).await;
    assert_eq!(response.status(), 503);
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["error"]["message"], json!("Ledger Storage Failure"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(proxy.events().len(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rekey_via_control_api_keeps_chain_valid() {
    let proxy = start_proxy(ALLOW_ALL, None).await;

    let body = json!({
        "jsonrpc": "2.0", "id": 1, "method": "fs.read", "params": {},
    });
    assert_eq!(proxy.post(body.clone()).await.status(), 200);

    let response = proxy
        .client
        .post(format!("{}/api/rekey", proxy.control_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let keys: Value = response.json().await.unwrap();
    assert_ne!(keys["old_public_key"], keys["new_public_key"]);

    assert_eq!(proxy.post(body).await.status(), 200);
    proxy
        .wait_for_event(|e| e.event_type == EventType::Rekey)
        .await;

    // Settle the response events, then verify the whole chain across the
    // rotation.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = verify_run(&proxy.store, &proxy.run_id).unwrap();
    assert!(report.valid, "{report:?}");
    assert_eq!(proxy.store.key_ranges(&proxy.run_id).unwrap().len(), 2);
}
