//! HTTP surface tests driven through the router with `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use smartuptime::api::{self, state::AppState};
use smartuptime::detect::DisabledClassifier;
use smartuptime::executor::ScriptExecutor;
use smartuptime::probes::NewOutcome;
use smartuptime::storage::{MemoryStore, ProbeLedger};

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    _scripts: TempDir,
}

fn app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let scripts = TempDir::new().unwrap();
    std::fs::write(scripts.path().join("hello.sh"), "echo \"hello $1\"\n").unwrap();

    let executor = ScriptExecutor::new(
        store.clone(),
        scripts.path().to_path_buf(),
        Duration::from_secs(10),
        CancellationToken::new(),
    );
    let state = AppState {
        store: store.clone(),
        executor,
        classifier: Arc::new(DisabledClassifier),
    };
    TestApp {
        router: api::router(state, Some("http://localhost:3000")).unwrap(),
        store,
        _scripts: scripts,
    }
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn rule_body(name: &str) -> Value {
    json!({
        "name": name,
        "script_type": "bash",
        "script_path": "hello.sh",
        "default_arguments": "world",
        "trigger_condition": "downtime",
        "downtime_threshold": 2
    })
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = call(&app.router, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["classifier_degraded"], false);
    assert!(body["meta"]["timestamp"].is_string());
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let app = app();
    let (status, body) = call(&app.router, Method::GET, "/api/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["data"]["status"], 404);
}

#[tokio::test]
async fn test_site_crud() {
    let app = app();

    let (status, body) = call(
        &app.router,
        Method::POST,
        "/api/v1/sites",
        Some(json!({"url": "https://example.com", "name": "example"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_i64().unwrap();
    assert_eq!(body["data"]["is_active"], true);

    let (status, body) = call(&app.router, Method::GET, "/api/v1/sites", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);

    let (status, body) = call(
        &app.router,
        Method::PUT,
        &format!("/api/v1/sites/{id}"),
        Some(json!({"url": "https://example.org", "is_active": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["url"], "https://example.org");

    let (_, body) = call(&app.router, Method::GET, "/api/v1/sites?active=true", None).await;
    assert_eq!(body["meta"]["total"], 0);

    let (status, _) = call(&app.router, Method::DELETE, &format!("/api/v1/sites/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&app.router, Method::GET, &format!("/api/v1/sites/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_site_is_rejected() {
    let app = app();
    let (status, body) = call(&app.router, Method::POST, "/api/v1/sites", Some(json!({"url": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["data"]["error"].as_str().unwrap().contains("url"));
}

#[tokio::test]
async fn test_outcomes_and_status() {
    let app = app();
    let (_, body) = call(
        &app.router,
        Method::POST,
        "/api/v1/sites",
        Some(json!({"url": "https://example.com"})),
    )
    .await;
    let id = body["data"]["id"].as_i64().unwrap();

    for status_code in [200, 503, 500] {
        app.store
            .append(NewOutcome {
                site_id: id,
                checked_at: chrono::Utc::now(),
                latency_ms: Some(80),
                status_code,
                is_anomaly: false,
                error_message: None,
            })
            .await
            .unwrap();
    }

    let (status, body) = call(&app.router, Method::GET, &format!("/api/v1/sites/{id}/outcomes?limit=2"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 2);
    assert_eq!(body["data"][0]["status_code"], 500);

    let (_, body) = call(&app.router, Method::GET, "/api/v1/status", None).await;
    assert_eq!(body["data"][0]["status_code"], 500);

    let (status, _) = call(&app.router, Method::GET, "/api/v1/sites/999/outcomes", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rule_validation() {
    let app = app();
    let mut body = rule_body("bad");
    body["script_type"] = json!("ruby");
    let (status, resp) = call(&app.router, Method::POST, "/api/v1/rules", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["data"]["error"].as_str().unwrap().contains("ruby"));

    let mut body = rule_body("escape");
    body["script_path"] = json!("../etc/passwd");
    let (status, _) = call(&app.router, Method::POST, "/api/v1/rules", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[cfg(unix)]
#[tokio::test]
async fn test_manual_execution_and_history() {
    let app = app();
    let (status, body) = call(&app.router, Method::POST, "/api/v1/rules", Some(rule_body("Say hello"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let rule_id = body["data"]["id"].as_i64().unwrap();

    let (status, body) = call(
        &app.router,
        Method::POST,
        &format!("/api/v1/rules/{rule_id}/execute"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "success");
    assert_eq!(body["data"]["trigger_type"], "manual");
    assert_eq!(body["data"]["output"], "hello world\n");
    let execution_id = body["data"]["id"].as_i64().unwrap();

    let (_, body) = call(
        &app.router,
        Method::POST,
        &format!("/api/v1/rules/{rule_id}/execute"),
        Some(json!({"arguments": "there"})),
    )
    .await;
    assert_eq!(body["data"]["output"], "hello there\n");

    let (_, body) = call(&app.router, Method::GET, "/api/v1/executions?limit=10", None).await;
    assert_eq!(body["meta"]["total"], 2);

    let (status, body) = call(&app.router, Method::GET, &format!("/api/v1/executions/{execution_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["arguments"], "world");

    let (_, body) = call(&app.router, Method::GET, &format!("/api/v1/rules/{rule_id}"), None).await;
    assert_eq!(body["data"]["execution_count"], 2);
    assert_eq!(body["data"]["success_count"], 2);
}

#[tokio::test]
async fn test_inactive_rule_execution_is_bad_request() {
    let app = app();
    let mut body = rule_body("Disabled");
    body["is_active"] = json!(false);
    let (_, body) = call(&app.router, Method::POST, "/api/v1/rules", Some(body)).await;
    let rule_id = body["data"]["id"].as_i64().unwrap();

    let (status, _) = call(
        &app.router,
        Method::POST,
        &format!("/api/v1/rules/{rule_id}/execute"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app.router, Method::POST, "/api/v1/rules/999/execute", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rule_update_and_delete() {
    let app = app();
    let (_, body) = call(&app.router, Method::POST, "/api/v1/rules", Some(rule_body("Say hello"))).await;
    let rule_id = body["data"]["id"].as_i64().unwrap();

    let mut edit = rule_body("Say hello loudly");
    edit["downtime_threshold"] = json!(4);
    let (status, body) = call(&app.router, Method::PUT, &format!("/api/v1/rules/{rule_id}"), Some(edit)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "Say hello loudly");
    assert_eq!(body["data"]["downtime_threshold"], 4);

    let (status, _) = call(&app.router, Method::DELETE, &format!("/api/v1/rules/{rule_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app.router, Method::DELETE, &format!("/api/v1/rules/{rule_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
