use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::json;
use tower::ServiceExt;

use delve_core::config::{ApiKeyConfig, ApiKeyRole, GatewayConfig};
use delve_core::traits::{StateStore, StepExecutor};
use delve_engine::{EngineLimits, FnFactory};
use delve_gateway::{AllowAll, GatewayServer, RunHost};
use delve_store::MemoryStore;
use delve_test_utils::{chain_graph, ScriptedExecutor};

fn host(executor: Arc<dyn StepExecutor>) -> Arc<RunHost> {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    Arc::new(RunHost::new(
        Arc::new(FnFactory::new("chain", || Ok(chain_graph()))),
        store,
        executor,
        Arc::new(AllowAll),
        EngineLimits::default(),
        64,
    ))
}

fn app_with(config: GatewayConfig, host: Arc<RunHost>) -> Router {
    GatewayServer::new(config, host).router()
}

fn app() -> Router {
    app_with(GatewayConfig::default(), host(Arc::new(ScriptedExecutor::new())))
}

fn keyed_config() -> GatewayConfig {
    let key = |name: &str, role: ApiKeyRole| ApiKeyConfig {
        name: name.to_string(),
        key: format!("dk_{}", name),
        role,
    };
    GatewayConfig {
        api_keys: vec![
            key("viewer", ApiKeyRole::Viewer),
            key("operator", ApiKeyRole::Operator),
            key("admin", ApiKeyRole::Admin),
        ],
        ..GatewayConfig::default()
    }
}

fn stream_request(id: &str, body: serde_json::Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::post(format!("/api/runs/{}/stream", id))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn plain_request(method: &str, uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn health_needs_no_auth() {
    let app = app_with(keyed_config(), host(Arc::new(ScriptedExecutor::new())));
    let response = app
        .oneshot(plain_request("GET", "/api/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn stream_runs_to_completion() {
    let app = app();
    let response = app
        .clone()
        .oneshot(stream_request(
            "run-1",
            json!({"query": "what is a lane?", "thread_item_id": "item-1"}),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = body_text(response).await;
    let started = body.find("event: run_started").unwrap();
    let completed = body.find("event: completed").unwrap();
    assert!(started < completed);
    assert_eq!(body.matches("event: node_completed").count(), 3);
    assert!(body.contains("\"thread_item_id\":\"item-1\""));
    assert!(body.contains("\"run_id\":\"run-1\""));

    let response = app
        .clone()
        .oneshot(plain_request("GET", "/api/runs/run-1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = body_json(response).await;
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["live"], false);
    assert_eq!(summary["ledger"]["b"]["status"], "completed");

    let response = app
        .oneshot(plain_request("GET", "/api/runs", None))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["runs"], json!(["run-1"]));
}

#[tokio::test]
async fn finished_run_replays_over_the_wire() {
    let app = app();
    let first = app
        .clone()
        .oneshot(stream_request("run-1", json!({"query": "q"}), None))
        .await
        .unwrap();
    body_text(first).await;

    let again = app
        .oneshot(stream_request("run-1", json!({}), None))
        .await
        .unwrap();
    let body = body_text(again).await;
    assert!(!body.contains("event: node_started"));
    assert!(body.contains("event: completed"));
    assert!(body.contains("\"replayed\":true"));
}

#[tokio::test]
async fn bad_payload_ends_with_error_frame() {
    let response = app()
        .oneshot(stream_request("run-1", json!({"query": "   "}), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("event: error"));
    assert!(!body.contains("event: run_started"));
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let app = app();
    let response = app
        .clone()
        .oneshot(plain_request("GET", "/api/runs/missing", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(plain_request("POST", "/api/runs/missing/cancel", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(plain_request("DELETE", "/api/runs/missing", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn roles_gate_endpoints() {
    let app = app_with(keyed_config(), host(Arc::new(ScriptedExecutor::new())));

    let response = app
        .clone()
        .oneshot(plain_request("GET", "/api/runs", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(stream_request("run-1", json!({"query": "q"}), Some("dk_viewer")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(stream_request("run-1", json!({"query": "q"}), Some("dk_operator")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_text(response).await;

    let response = app
        .clone()
        .oneshot(plain_request("GET", "/api/runs/run-1", Some("dk_viewer")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(plain_request("DELETE", "/api/runs/run-1", Some("dk_operator")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(plain_request("DELETE", "/api/runs/run-1", Some("dk_admin")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["deleted"], true);

    let response = app
        .oneshot(plain_request("GET", "/api/runs/run-1", Some("dk_admin")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn query_token_authenticates() {
    let config = GatewayConfig {
        token: Some("secret".into()),
        ..GatewayConfig::default()
    };
    let app = app_with(config, host(Arc::new(ScriptedExecutor::new())));

    let response = app
        .clone()
        .oneshot(plain_request("GET", "/api/runs?token=wrong", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(plain_request("GET", "/api/runs?token=secret", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cancel_over_http_aborts_the_stream() {
    let host = host(Arc::new(ScriptedExecutor::new().block_at("b")));
    let app = app_with(GatewayConfig::default(), host.clone());

    let response = app
        .clone()
        .oneshot(stream_request("run-1", json!({"query": "q"}), None))
        .await
        .unwrap();
    let reader = tokio::spawn(body_text(response));

    tokio::time::timeout(Duration::from_secs(2), async {
        while !host.is_live("run-1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Deleting a live run is refused.
    let response = app
        .clone()
        .oneshot(plain_request("DELETE", "/api/runs/run-1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .oneshot(plain_request("POST", "/api/runs/run-1/cancel", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .unwrap()
        .unwrap();
    assert!(body.contains("event: aborted"));
    assert!(!body.contains("event: completed"));
}
