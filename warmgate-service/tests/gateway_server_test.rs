// Copyright 2024 The Warmgate Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tower::ServiceExt;
use warmgate_macro::warmgate_test;
use warmgate_pool::messages::GatewayToWorker;
use warmgate_pool::pool_registry::PoolRegistry;
use warmgate_pool::worker::WorkerId;
use warmgate_service::{GatewayState, gateway_server, worker_socket_server};
use warmgate_store::user_dir_store::UserDirStore;

const ENVIRONMENT: &str = "test";

struct TestGateway {
    _mount: TempDir,
    registry: Arc<PoolRegistry>,
    store: Arc<UserDirStore>,
    router: Router,
}

fn make_gateway() -> TestGateway {
    let mount = TempDir::new().unwrap();
    let registry = Arc::new(PoolRegistry::new(ENVIRONMENT));
    let store = Arc::new(UserDirStore::new(mount.path(), ENVIRONMENT));
    let router = gateway_server::routes(GatewayState {
        registry: registry.clone(),
        store: store.clone(),
    });
    TestGateway {
        _mount: mount,
        registry,
        store,
        router,
    }
}

fn connect_worker(
    registry: &PoolRegistry,
    worker_id: &str,
) -> UnboundedReceiver<GatewayToWorker> {
    let (tx, rx) = mpsc::unbounded_channel();
    registry.register(WorkerId::from(worker_id), tx, 100);
    rx
}

async fn send_json(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

#[warmgate_test]
async fn acquire_without_user_id_is_rejected() {
    let gateway = make_gateway();
    let _rx = connect_worker(&gateway.registry, "worker1");

    let (status, body) = send_json(
        &gateway.router,
        "POST",
        "/api/acquire",
        Some(json!({ "sessionId": "s-1" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "userId is required");
    // The bad request must not have consumed a worker.
    assert_eq!(gateway.registry.counts().warm, 1);
}

#[warmgate_test]
async fn acquire_assigns_worker_and_provisions_directory() {
    let gateway = make_gateway();
    let mut rx = connect_worker(&gateway.registry, "worker1");

    let (status, body) = send_json(
        &gateway.router,
        "POST",
        "/api/acquire",
        Some(json!({ "userId": "alice", "sessionId": "s-1" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["taskId"], "worker1");
    assert_eq!(body["userId"], "alice");
    assert_eq!(body["sessionId"], "s-1");
    assert!(body["latency"].is_u64());

    let message = rx.recv().await.unwrap();
    assert_eq!(
        message,
        GatewayToWorker::InitUserSession {
            user_id: "alice".to_string(),
            session_id: Some("s-1".to_string()),
            env: ENVIRONMENT.to_string(),
        }
    );

    let user_dir = gateway.store.user_dir("alice").unwrap();
    assert!(tokio::fs::metadata(&user_dir).await.unwrap().is_dir());
}

#[warmgate_test]
async fn acquire_on_empty_pool_reports_exhaustion() {
    let gateway = make_gateway();

    let (status, body) = send_json(
        &gateway.router,
        "POST",
        "/api/acquire",
        Some(json!({ "userId": "alice" })),
    )
    .await;

    // Exhaustion is a normal outcome, not an HTTP error.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "No warm workers available");
    assert_eq!(body["warmCount"], 0);
}

#[warmgate_test]
async fn release_without_task_id_is_rejected() {
    let gateway = make_gateway();

    let (status, body) =
        send_json(&gateway.router, "POST", "/api/release", Some(json!({}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "taskId is required");
}

#[warmgate_test]
async fn release_is_idempotent_over_unknown_ids() {
    let gateway = make_gateway();

    let (status, body) = send_json(
        &gateway.router,
        "POST",
        "/api/release",
        Some(json!({ "taskId": "never-registered" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["taskId"], "never-registered");
}

#[warmgate_test]
async fn release_tears_down_assigned_worker() {
    let gateway = make_gateway();
    let mut rx = connect_worker(&gateway.registry, "worker1");

    send_json(
        &gateway.router,
        "POST",
        "/api/acquire",
        Some(json!({ "userId": "alice" })),
    )
    .await;
    let (status, body) = send_json(
        &gateway.router,
        "POST",
        "/api/release",
        Some(json!({ "taskId": "worker1" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(rx.recv().await.is_some());
    assert_eq!(rx.recv().await, None);
}

#[warmgate_test]
async fn status_reports_counts_tasks_and_mount() {
    let gateway = make_gateway();
    let _rx1 = connect_worker(&gateway.registry, "worker1");
    let _rx2 = connect_worker(&gateway.registry, "worker2");
    assert!(gateway.registry.acquire("alice", None, 200).is_some());

    let (status, body) = send_json(&gateway.router, "GET", "/api/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["warmCount"], 1);
    assert_eq!(body["assignedCount"], 1);
    assert_eq!(body["mounted"], true);
    let tasks = body["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["taskId"], "worker1");
    assert_eq!(tasks[0]["state"], "assigned");
    assert_eq!(tasks[0]["userId"], "alice");
    assert_eq!(tasks[1]["taskId"], "worker2");
    assert_eq!(tasks[1]["state"], "warm");
}

#[warmgate_test]
async fn users_endpoint_lists_provisioned_directories() {
    let gateway = make_gateway();
    gateway.store.ensure_user_directory("bob").await.unwrap();
    gateway.store.ensure_user_directory("alice").await.unwrap();

    let (status, body) = send_json(&gateway.router, "GET", "/api/users", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["users"], json!(["alice", "bob"]));
    assert_eq!(body["count"], 2);
}

#[warmgate_test]
async fn timeout_sweeper_evicts_silent_workers() {
    let gateway = make_gateway();
    // Registered with an ancient heartbeat, so the first sweep removes it.
    let _rx = connect_worker(&gateway.registry, "worker1");

    let _sweeper = worker_socket_server::spawn_timeout_sweeper(
        &gateway.registry,
        Duration::from_millis(1),
    );
    for _ in 0..100 {
        if gateway.registry.counts().warm == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gateway.registry.counts().warm, 0);
}

#[warmgate_test]
async fn health_reports_pool_counts() {
    let gateway = make_gateway();
    let _rx = connect_worker(&gateway.registry, "worker1");

    let (status, body) = send_json(&gateway.router, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["warmCount"], 1);
    assert_eq!(body["assignedCount"], 0);
}
