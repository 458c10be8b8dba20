use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower::ServiceExt;

use rexec_lite::activity::ActivityLog;
use rexec_lite::auth::{hash_secret, AuthResolver, MemoryAuthRecords, StoreAuthResolver};
use rexec_lite::dispatcher::{router, DispatcherState};
use rexec_lite::error::Result;
use rexec_lite::event::{AsyncEvent, Event, JobSpec};
use rexec_lite::protocol::PullKeys;
use rexec_lite::store::{MemoryStore, ObjectStore, UrlSigner};
use rexec_lite::worker::{InvokeAck, Invoker, Registry};

const SECRET: &str = "test-secret";

/// Invoker that records events and answers with a fixed ack.
struct RecordingInvoker {
    ack: InvokeAck,
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl Invoker for RecordingInvoker {
    async fn invoke(&self, event: &Event) -> Result<InvokeAck> {
        self.events.lock().await.push(event.clone());
        Ok(self.ack)
    }
}

struct PanickingAuth;

#[async_trait]
impl AuthResolver for PanickingAuth {
    async fn resolve(&self, _secret: &str) -> Option<String> {
        panic!("auth backend exploded");
    }
}

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
    invoker: Arc<RecordingInvoker>,
    activity: ActivityLog,
}

fn auth_name() -> String {
    format!("alice:{}", &hash_secret(SECRET)[..16])
}

async fn create_test_app_with(ack: InvokeAck, auth: Option<Arc<dyn AuthResolver>>) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let invoker = Arc::new(RecordingInvoker {
        ack,
        events: Mutex::new(Vec::new()),
    });
    let auth: Arc<dyn AuthResolver> = match auth {
        Some(auth) => auth,
        None => {
            let records = MemoryAuthRecords::new();
            records.insert_secret(SECRET, "alice").await;
            Arc::new(StoreAuthResolver::new(records))
        }
    };
    let activity = ActivityLog::new(store.clone());
    let state = DispatcherState {
        auth,
        store: store.clone(),
        invoker: invoker.clone(),
        registry: Registry::builtin(),
        signer: UrlSigner::new("http://exec.test", [7u8; 32]).unwrap(),
        activity: activity.clone(),
        unauthorized_delay: Duration::from_millis(50),
        read_url_ttl: Duration::from_secs(60),
    };
    TestApp {
        app: router(state),
        store,
        invoker,
        activity,
    }
}

async fn create_test_app() -> TestApp {
    create_test_app_with(InvokeAck::Accepted, None).await
}

fn post(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/exec")
        .header("auth", SECRET)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("auth", SECRET)
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Turn an absolute signed url into a request path for `oneshot`.
fn local_path(url: &str) -> String {
    let url = reqwest::Url::parse(url).unwrap();
    format!("{}?{}", url.path(), url.query().unwrap())
}

async fn complete_job(store: &MemoryStore, uid: &str, log: &'static [u8], exit: i32) {
    let keys = PullKeys::for_job(&auth_name(), uid);
    store.put(&keys.log, Bytes::from_static(log)).await.unwrap();
    store
        .put(&keys.exit, Bytes::from(exit.to_string()))
        .await
        .unwrap();
    store
        .put(&keys.size, Bytes::from(log.len().to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_post_subprocess_accepted() {
    let t = create_test_app().await;

    let response = t
        .app
        .oneshot(post(json!({ "argv": ["echo", "hi"] })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("auth-name").unwrap(),
        auth_name().as_str()
    );
    let uid_header = response
        .headers()
        .get("uid")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let json = body_json(response).await;
    assert_eq!(json["uid"], uid_header);

    let events = t.invoker.events.lock().await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::Exec(AsyncEvent {
            auth_name: name,
            uid,
            push_urls,
            job: JobSpec::Subprocess { argv },
        }) => {
            assert_eq!(name, &auth_name());
            assert_eq!(uid, &uid_header);
            assert!(push_urls.is_none());
            assert_eq!(argv, &vec!["echo".to_string(), "hi".to_string()]);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_post_rpc_accepted() {
    let t = create_test_app().await;
    let response = t
        .app
        .oneshot(post(json!({ "rpc-name": "listdir", "rpc-args": "{\"path\":\".\"}" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(t.invoker.events.lock().await.len(), 1);
}

#[tokio::test]
async fn test_post_unknown_rpc_is_404() {
    let t = create_test_app().await;
    let response = t
        .app
        .oneshot(post(json!({ "rpc-name": "reboot" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(t.invoker.events.lock().await.is_empty());
}

#[tokio::test]
async fn test_post_invalid_bodies_are_400() {
    let t = create_test_app().await;
    for body in [
        json!({}),
        json!({ "argv": [] }),
        json!({ "argv": [""] }),
        json!({ "argv": ["echo"], "rpc-name": "listdir" }),
        json!({ "argv": ["echo"], "push-urls": { "log": "ftp://x", "size": "http://x", "exit": "http://x" } }),
    ] {
        let response = t.app.clone().oneshot(post(body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
    }

    let response = t
        .app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/exec")
                .header("auth", SECRET)
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(t.invoker.events.lock().await.is_empty());
}

#[tokio::test]
async fn test_throttled_invocation_is_503() {
    let t = create_test_app_with(InvokeAck::Throttled, None).await;
    let response = t
        .app
        .oneshot(post(json!({ "argv": ["true"] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_unauthorized_is_delayed_401() {
    let t = create_test_app().await;
    let started = Instant::now();
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/exec")
                .header("auth", "wrong")
                .body(Body::from(json!({ "argv": ["true"] }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(started.elapsed() >= Duration::from_millis(50));

    // No header at all, and an unknown path, still answer 401.
    let response = t
        .app
        .oneshot(
            Request::builder()
                .uri("/api/nothing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(t.invoker.events.lock().await.is_empty());
}

#[tokio::test]
async fn test_options_needs_no_auth() {
    let t = create_test_app().await;
    let response = t
        .app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/exec")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_route_is_404_after_auth() {
    let t = create_test_app().await;
    let response = t.app.clone().oneshot(get("/api/nothing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = t
        .app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/exec")
                .header("auth", SECRET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_returns_url_until_complete() {
    let t = create_test_app().await;
    let uid = "1700000000.0a1b";

    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/api/exec?uid={}&range-start=0", uid)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("uid").unwrap(), uid);
    let json = body_json(response).await;
    let url = json["url"].as_str().unwrap();
    assert!(url.starts_with("http://exec.test/blob/jobs/"));
    assert!(json.get("exit").is_none());

    // The log does not exist yet: the signed url answers 403.
    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri(local_path(url)).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    complete_job(&t.store, uid, b"hi\n", 0).await;

    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/api/exec?uid={}&range-start=0", uid)))
        .await
        .unwrap();
    let json = body_json(response).await;
    let url = json["url"].as_str().unwrap().to_string();

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(local_path(&url))
                .header("range", "bytes=0-")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers().get("content-range").unwrap(), "bytes 0-2/3");
    assert_eq!(body_bytes(response).await, "hi\n");

    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/api/exec?uid={}&range-start=3", uid)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "exit": 0 }));

    let response = t
        .app
        .oneshot(get(&format!("/api/exec?uid={}&range-start=4", uid)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_empty_log_completes_at_zero() {
    let t = create_test_app().await;
    let uid = "1700000000.beef";
    complete_job(&t.store, uid, b"", 1).await;

    let response = t
        .app
        .oneshot(get(&format!("/api/exec?uid={}", uid)))
        .await
        .unwrap();
    assert_eq!(body_json(response).await, json!({ "exit": 1 }));
}

#[tokio::test]
async fn test_get_rejects_malformed_uid() {
    let t = create_test_app().await;
    let response = t
        .app
        .clone()
        .oneshot(get("/api/exec?uid=..%2Fetc&range-start=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = t.app.oneshot(get("/api/exec")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_blob_range_past_end_is_416() {
    let t = create_test_app().await;
    let uid = "1700000000.cafe";
    complete_job(&t.store, uid, b"abc", 0).await;

    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/api/exec?uid={}&range-start=1", uid)))
        .await
        .unwrap();
    let url = body_json(response).await["url"]
        .as_str()
        .unwrap()
        .to_string();

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(local_path(&url))
                .header("range", "bytes=3-")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let response = t
        .app
        .oneshot(Request::builder().uri(local_path(&url)).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "abc");
}

#[tokio::test]
async fn test_blob_bad_signature_is_403() {
    let t = create_test_app().await;
    complete_job(&t.store, "1700000000.dead", b"secret log\n", 0).await;
    let key = PullKeys::for_job(&auth_name(), "1700000000.dead").log;

    let forged = format!(
        "/blob/{}?expires={}&signature={}",
        key,
        chrono::Utc::now().timestamp() + 60,
        "00".repeat(32)
    );
    let response = t
        .app
        .oneshot(Request::builder().uri(forged).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_signed_put_writes_object() {
    let t = create_test_app().await;
    let signer = UrlSigner::new("http://exec.test", [7u8; 32]).unwrap();
    let url = signer
        .presign_put("uploads/one.txt", Duration::from_secs(60))
        .unwrap();

    let response = t
        .app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(local_path(&url))
                .body(Body::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(t.store.get("uploads/one.txt").await.unwrap(), "payload");
}

#[tokio::test]
async fn test_handler_panic_is_500_with_backtrace() {
    let t = create_test_app_with(InvokeAck::Accepted, Some(Arc::new(PanickingAuth))).await;
    let response = t
        .app
        .oneshot(post(json!({ "argv": ["true"] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    let (message, backtrace) = body.split_once('\n').unwrap();
    assert_eq!(message, "auth backend exploded");
    assert!(!backtrace.is_empty());
}

#[tokio::test]
async fn test_api_requests_are_recorded_in_activity_log() {
    let t = create_test_app().await;
    t.app
        .oneshot(post(json!({ "argv": ["true"] })))
        .await
        .unwrap();

    assert_eq!(t.activity.pending().await, 1);
    let key = t.activity.flush().await.unwrap().unwrap();
    let line = t.store.get(&key).await.unwrap();
    let line = String::from_utf8(line.to_vec()).unwrap();
    assert!(line.starts_with("POST /api/exec 200 alice:"), "{}", line);
}
