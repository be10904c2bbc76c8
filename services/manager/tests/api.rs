//! HTTP API tests, driven through the router without a socket.

mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use base64::Engine;
use common::{settings, TestCluster};
use convoy_manager::{api, state::AppState, Manager};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(manager: Arc<Manager>) -> Router {
    api::create_router(AppState::new(manager))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn web_spec(replicas: u64) -> Value {
    json!({
        "name": "web",
        "replicas": replicas,
        "task_template": {
            "container": {
                "image": "nginx:alpine",
                "mounts": [{ "type": "volume", "source": "html", "target": "/usr/share/nginx/html" }],
                "secrets": [{ "source": "tls_key", "target": "key.pem" }]
            }
        }
    })
}

#[tokio::test]
async fn test_readyz_without_nodes() {
    let manager = Arc::new(Manager::start(settings()));
    let app = router(manager.clone());

    let (status, body) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["nodes"]["ready"], 0);

    let (status, body) = send(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "convoy-manager");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_service_lifecycle_over_http() {
    let cluster = TestCluster::start(2).await;
    let app = router(cluster.manager.clone());

    let (status, body) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"]["ready"], 2);

    // The secret must exist before a service can reference it.
    let (status, body) = send(&app, Method::POST, "/v1/services", Some(web_spec(2))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
    assert_eq!(body["details"][0]["field"], "task_template.container.secrets[0]");

    let data = base64::engine::general_purpose::STANDARD.encode("-----BEGIN KEY-----");
    let (status, secret) = send(
        &app,
        Method::POST,
        "/v1/secrets",
        Some(json!({ "name": "tls_key", "data": data })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(secret["name"], "tls_key");
    assert!(secret.get("data").is_none());

    let (status, created) = send(&app, Method::POST, "/v1/services", Some(web_spec(2))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["version"], 1);
    assert_eq!(created["secrets"][0]["file"]["name"], "key.pem");
    let service_id = created["service_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::POST, "/v1/services", Some(web_spec(1))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "service_name_conflict");

    let id = service_id.parse().unwrap();
    cluster.wait_running(id, 2).await;

    let (status, tasks) = send(&app, Method::GET, "/v1/services/web/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    let items = tasks["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|t| t["state"] == "running"));
    assert_eq!(items[0]["bindings"]["secrets"][0]["secret_name"], "tls_key");
    assert!(items[0]["bindings"]["secrets"][0].get("payload").is_none());

    let task_id = items[0]["id"].as_str().unwrap();
    let (status, task) = send(&app, Method::GET, &format!("/v1/tasks/{task_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["slot"], 1);

    let (status, body) = send(&app, Method::GET, &format!("/v1/services/{service_id}/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["desired"], 2);
    assert_eq!(body["running"], 2);
    assert_eq!(body["convergence"], "converged");

    let (status, body) = send(&app, Method::DELETE, "/v1/secrets/tls_key", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "secret_in_use");

    let (status, updated) = send(&app, Method::PUT, "/v1/services/web", Some(web_spec(3))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["version"], 2);
    cluster.wait_running(id, 3).await;

    let (status, _) = send(&app, Method::DELETE, "/v1/services/web", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, Method::GET, "/v1/services/web", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "service_not_found");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_secret_endpoints() {
    let manager = Arc::new(Manager::start(settings()));
    let app = router(manager.clone());

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/secrets",
        Some(json!({ "name": "api_token", "data": "not base64!" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_secret_data");
    assert_eq!(body["details"][0]["field"], "data");

    let data = base64::engine::general_purpose::STANDARD.encode("t0ken");
    let (status, created) = send(
        &app,
        Method::POST,
        "/v1/secrets",
        Some(json!({ "name": "api_token", "data": data, "labels": { "team": "core" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["size_bytes"], 5);

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/secrets",
        Some(json!({ "name": "api_token", "data": data })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "secret_name_conflict");

    let (status, list) = send(&app, Method::GET, "/v1/secrets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["items"].as_array().unwrap().len(), 1);
    assert_eq!(list["items"][0]["labels"]["team"], "core");

    let id = created["id"].as_str().unwrap();
    let (status, body) = send(&app, Method::GET, &format!("/v1/secrets/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "api_token");

    let (status, _) = send(&app, Method::DELETE, "/v1/secrets/api_token", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, Method::GET, "/v1/secrets/api_token", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "secret_not_found");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_task_lookup_errors() {
    let manager = Arc::new(Manager::start(settings()));
    let app = router(manager.clone());

    let (status, body) = send(&app, Method::GET, "/v1/tasks/not-a-task", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_task_id");

    let unknown = convoy_id::TaskId::new();
    let (status, body) = send(&app, Method::GET, &format!("/v1/tasks/{unknown}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "task_not_found");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_node_endpoints() {
    let cluster = TestCluster::start(2).await;
    let app = router(cluster.manager.clone());

    let (status, list) = send(&app, Method::GET, "/v1/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    let items = list["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|n| n["status"] == "ready"));

    let node_id = items[0]["id"].as_str().unwrap().to_string();
    let (status, node) = send(
        &app,
        Method::PUT,
        &format!("/v1/nodes/{node_id}/availability"),
        Some(json!({ "availability": "drain" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["availability"], "drain");

    let (status, tasks) = send(&app, Method::GET, &format!("/v1/nodes/{node_id}/tasks"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(tasks["items"].as_array().unwrap().is_empty());

    let (status, body) = send(&app, Method::GET, "/v1/nodes/garbage", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_node_id");

    let unknown = convoy_id::NodeId::new();
    let (status, body) = send(
        &app,
        Method::PUT,
        &format!("/v1/nodes/{unknown}/availability"),
        Some(json!({ "availability": "active" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "node_not_found");

    cluster.shutdown().await;
}
