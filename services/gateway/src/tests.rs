use super::*;
use axum::body::Body;
use axum::http::{Request, StatusCode, Uri};
use credential_pool::store::UsageQuery;
use credential_pool::{Credential, SecretKind, Tier, User, Visibility};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn start_backend(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Backend that answers every call, echoing the wrapped request.
async fn ok_backend() -> String {
    start_backend(Router::new().fallback(
        |uri: Uri, axum::Json(body): axum::Json<Value>| async move {
            if uri.path().contains("streamGenerateContent") {
                (
                    StatusCode::OK,
                    [("content-type", "text/event-stream")],
                    "data: {\"chunk\":1}\n\ndata: {\"chunk\":2}\n\n".to_string(),
                )
                    .into_response()
            } else {
                axum::Json(json!({ "response": { "text": "hi" }, "echo": body })).into_response()
            }
        },
    ))
    .await
}

fn test_config(targets: &[(&str, &str)]) -> Config {
    let mut toml = String::from(
        r#"
[server]
listen_addr = "127.0.0.1:0"
timeout_secs = 5

[pool]
mode = "private"
max_retries = 0
call_timeout_secs = 5

[cooldown]
flash_secs = 0
pro_secs = 0
tier3_secs = 0

[rate_limit]
base_rpm = 100
contributor_rpm = 100
"#,
    );
    for (name, url) in targets {
        toml.push_str(&format!("\n[[targets]]\nname = \"{name}\"\nurl = \"{url}\"\n"));
    }
    toml::from_str(&toml).unwrap()
}

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    user_id: u64,
}

async fn harness(targets: &[(&str, &str)], with_credential: bool) -> Harness {
    let config = test_config(targets);
    let store = Arc::new(MemoryStore::new());
    let gateway = Gateway::build(&config, store.clone(), reqwest::Client::new());

    let user_id = store
        .insert_user(User::new("ann", "sk-ann", 1000))
        .await
        .unwrap();
    if with_credential {
        let mut credential = Credential::new(
            SecretKind::ApiKey,
            "AIza-ann".into(),
            Tier::Gemini25,
            Visibility::Private,
        );
        credential.owner_id = Some(user_id);
        credential.project_id = Some("p-ann".into());
        store.insert_credential(credential).await.unwrap();
    }

    let app = build_router(gateway.app_state(crate::metrics::test_handle()), 100);
    Harness {
        app,
        store,
        user_id,
    }
}

fn chat_request(key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn hello(model: &str) -> Value {
    json!({ "model": model, "messages": [{ "role": "user", "content": "hello" }] })
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reflects_pool_state() {
    let url = ok_backend().await;

    let h = harness(&[("primary", url.as_str())], true).await;
    let response = h
        .app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["credentials_active"], 1);
    assert!(json["uptime_seconds"].is_u64());

    let empty = harness(&[("primary", url.as_str())], false).await;
    let response = empty
        .app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn metrics_endpoint_uses_prometheus_content_type() {
    let url = ok_backend().await;
    let h = harness(&[("primary", url.as_str())], true).await;
    let response = h
        .app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4; charset=utf-8"
    );
}

#[tokio::test]
async fn requests_need_a_known_key() {
    let url = ok_backend().await;
    let h = harness(&[("primary", url.as_str())], true).await;

    let response = h
        .app
        .clone()
        .oneshot(chat_request(None, hello("gemini-2.5-flash")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "unauthorized");
    assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));

    let response = h
        .app
        .oneshot(chat_request(Some("sk-wrong"), hello("gemini-2.5-flash")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let url = ok_backend().await;
    let h = harness(&[("primary", url.as_str())], true).await;

    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some("sk-ann"), json!({ "messages": [] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["type"], "invalid_request");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-ann")
        .body(Body::from("{not json"))
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn completion_is_served_and_logged() {
    let url = ok_backend().await;
    let h = harness(&[("primary", url.as_str())], true).await;

    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some("sk-ann"), hello("gemini-2.5-flash")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway-target"], "primary");
    assert_eq!(response.headers()["x-gateway-attempts"], "1");
    assert!(response.headers().contains_key("x-request-id"));

    let json = body_json(response).await;
    assert_eq!(json["response"]["text"], "hi");
    assert_eq!(json["echo"]["project"], "p-ann");
    assert_eq!(json["echo"]["request"]["model"], "gemini-2.5-flash");
    assert_eq!(json["echo"]["request"]["contents"][0]["parts"][0]["text"], "hello");

    let logs = h
        .store
        .list_usage(UsageQuery::new(h.user_id, 0))
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
    assert_eq!(logs[0].target, "primary");

    let request = Request::builder()
        .uri("/v1/usage")
        .header("authorization", "Bearer sk-ann")
        .body(Body::empty())
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let usage = body_json(response).await;
    assert_eq!(usage["used"], 1);
    assert_eq!(usage["groups"]["flash"]["used"], 1);
    assert_eq!(usage["allowance"], 1000);
}

#[tokio::test]
async fn rate_limited_target_falls_back_to_next() {
    let limited = start_backend(Router::new().fallback(|| async {
        (
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"Resource exhausted, please retry"}}"#,
        )
    }))
    .await;
    let ok = ok_backend().await;
    let h = harness(&[("primary", limited.as_str()), ("secondary", ok.as_str())], true).await;

    let response = h
        .app
        .oneshot(chat_request(Some("sk-ann"), hello("gemini-2.5-flash")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway-target"], "secondary");

    let logs = h
        .store
        .list_usage(UsageQuery::new(h.user_id, 0))
        .await
        .unwrap();
    assert_eq!(logs.len(), 2, "one entry per target that made an attempt");
    assert_eq!(logs.iter().filter(|e| e.success).count(), 1);
}

#[tokio::test]
async fn content_filter_surfaces_backend_status() {
    let blocked = start_backend(Router::new().fallback(|| async {
        (
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"request blocked by safety filter"}}"#,
        )
    }))
    .await;
    let h = harness(&[("primary", blocked.as_str())], true).await;

    let response = h
        .app
        .oneshot(chat_request(Some("sk-ann"), hello("gemini-2.5-flash")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["type"], "upstream_error");
}

#[tokio::test]
async fn empty_pool_is_service_unavailable() {
    let url = ok_backend().await;
    let h = harness(&[("primary", url.as_str())], false).await;

    let response = h
        .app
        .oneshot(chat_request(Some("sk-ann"), hello("gemini-2.5-flash")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"]["type"], "no_credential");
}

#[tokio::test]
async fn streamed_completion_is_forwarded_as_sse() {
    let url = ok_backend().await;
    let h = harness(&[("primary", url.as_str())], true).await;

    let mut body = hello("gemini-2.5-flash");
    body["stream"] = json!(true);
    let response = h
        .app
        .oneshot(chat_request(Some("sk-ann"), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    assert_eq!(
        &bytes[..],
        b"data: {\"chunk\":1}\n\ndata: {\"chunk\":2}\n\n".as_slice()
    );

    let logs = h
        .store
        .list_usage(UsageQuery::new(h.user_id, 0))
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
}
