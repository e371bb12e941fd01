//! Router tests against a mocked model backend and an engine that never boots.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use kiln_runtime::{BootedSandbox, RuntimeError, SandboxRuntime};
use kiln_server::{build_router, build_state, KilnConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct NoEngine;

#[async_trait]
impl SandboxRuntime for NoEngine {
    async fn boot(&self) -> kiln_runtime::Result<BootedSandbox> {
        Err(RuntimeError::Boot("no engine in tests".into()))
    }
}

fn app(api_url: &str) -> Router {
    let api_url = api_url.to_string();
    let config = KilnConfig::from_lookup(move |var| match var {
        "KILN_API_KEY" => Some("test-key".to_string()),
        "KILN_API_URL" => Some(api_url.clone()),
        "KILN_GENERATION_TIMEOUT_SECS" => Some("10".to_string()),
        _ => None,
    })
    .expect("valid config");
    let state = build_state(&config, Arc::new(NoEngine)).expect("state");
    build_router(state)
}

fn offline_app() -> Router {
    app("http://127.0.0.1:9/v1/chat/completions")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        let chunk = json!({"choices": [{"delta": {"content": delta}}]});
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Data lines of every SSE event named `name`.
fn events_named(body: &str, name: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter(|block| block.lines().any(|l| l == format!("event: {name}")))
        .filter_map(|block| {
            block
                .lines()
                .find_map(|l| l.strip_prefix("data: "))
                .and_then(|data| serde_json::from_str(data).ok())
        })
        .collect()
}

#[tokio::test]
async fn test_health() {
    let (status, body) = get(&offline_app(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_tree_lists_seed_project() {
    let (status, body) = get(&offline_app(), "/api/files").await;
    assert_eq!(status, StatusCode::OK);

    let tree: Value = serde_json::from_str(&body).unwrap();
    let names: Vec<&str> = tree
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"src"));
    assert!(names.contains(&"package.json"));

    let src = tree
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["name"] == "src")
        .unwrap();
    assert_eq!(src["type"], "directory");
    assert_eq!(src["path"], "src");
}

#[tokio::test]
async fn test_read_and_write_files() {
    let app = offline_app();

    let (status, body) = get(&app, "/api/files/src/App.tsx").await;
    assert_eq!(status, StatusCode::OK);
    let file: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(file["path"], "src/App.tsx");
    assert!(file["content"].as_str().unwrap().contains("<Layout>"));

    let (status, _) = get(&app, "/api/files/missing.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        json_request("PUT", "/api/files/src/styles.css", json!({"content": "body{}"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["replaced"], false);
    assert_eq!(report["mirror"]["status"], "not_mounted");

    let (_, body) = get(&app, "/api/files/src/styles.css").await;
    let file: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(file["content"], "body{}");
}

#[tokio::test]
async fn test_write_rejects_bad_paths() {
    let app = offline_app();

    let (status, body) = send(
        &app,
        json_request("PUT", "/api/files/src/../../etc/passwd", json!({"content": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("error"));

    // `src` is a directory; it cannot become a file.
    let (status, _) = send(&app, json_request("PUT", "/api/files/src", json!({"content": "x"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_generate_streams_and_applies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&[
                    "```json\n{\"code\":\"export default function Counter() {}\",",
                    "\"explanation\":\"a counter\",\"filename\":\"Counter.tsx\"}\n```",
                ])),
        )
        .mount(&server)
        .await;
    let app = app(&format!("{}/v1/chat/completions", server.uri()));

    let (status, body) = send(
        &app,
        json_request("POST", "/api/generate", json!({"prompt": "a counter"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert!(events_named(&body, "error").is_empty());
    let complete = events_named(&body, "complete");
    assert_eq!(complete.len(), 1);
    let complete = &complete[0];
    assert_eq!(complete["parse_failed"], false);
    assert_eq!(complete["artifact"]["filename"], "Counter.tsx");
    assert_eq!(complete["apply"]["path"], "src/components/Counter.tsx");
    assert_eq!(complete["apply"]["entry"]["status"], "applied");

    let (_, body) = get(&app, "/api/files/src/App.tsx").await;
    let entry: Value = serde_json::from_str(&body).unwrap();
    let entry = entry["content"].as_str().unwrap();
    assert!(entry.contains("import Counter from './components/Counter';"));
    assert!(entry.contains("<Counter />"));

    let (status, _) = get(&app, "/api/files/src/components/Counter.tsx").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_generate_reports_backend_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;
    let app = app(&format!("{}/v1/chat/completions", server.uri()));

    let (status, body) = send(
        &app,
        json_request("POST", "/api/generate", json!({"prompt": "a counter"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let errors = events_named(&body, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["retryable"], false);
    assert!(errors[0]["message"].as_str().unwrap().contains("401"));
    assert!(events_named(&body, "complete").is_empty());
}

#[tokio::test]
async fn test_generate_requires_prompt() {
    let (status, _) = send(
        &offline_app(),
        json_request("POST", "/api/generate", json!({"prompt": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sandbox_status_and_restart() {
    let app = offline_app();

    let (status, body) = get(&app, "/api/sandbox").await;
    assert_eq!(status, StatusCode::OK);
    let sandbox: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(sandbox["generation"], 0);
    assert_eq!(sandbox["state"], "idle");

    let (status, body) = send(
        &app,
        Request::post("/api/sandbox/restart").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let restarted: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(restarted["generation"], 1);
}

#[tokio::test]
async fn test_preview_reports_readiness() {
    let (status, body) = get(&offline_app(), "/api/preview").await;
    assert_eq!(status, StatusCode::OK);
    let readiness: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(readiness["generation"], 0);
    assert!(readiness["status"] == "pending" || readiness["status"] == "failed");
}
