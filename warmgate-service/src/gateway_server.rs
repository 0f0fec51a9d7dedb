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

use std::time::Instant;

use axum::Router;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{Level, event};
use warmgate_pool::worker::WorkerId;
use warmgate_util::unix_millis;

use crate::GatewayState;

/// Control plane routes. All handlers respond with JSON; pool exhaustion on
/// acquire is reported in the body at HTTP 200, only malformed requests get
/// a 4xx status.
pub fn routes(state: GatewayState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/acquire", post(post_acquire))
        .route("/api/release", post(post_release))
        .route("/api/users", get(get_users))
        .route("/health", get(get_health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest {
    #[serde(default)]
    task_id: Option<String>,
}

async fn get_status(State(state): State<GatewayState>) -> Json<Value> {
    let counts = state.registry.counts();
    Json(json!({
        "warmCount": counts.warm,
        "assignedCount": counts.assigned,
        "tasks": state.registry.list(),
        "mounted": state.store.is_mounted().await,
    }))
}

async fn post_acquire(
    State(state): State<GatewayState>,
    Json(request): Json<AcquireRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(user_id) = request.user_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "userId is required" })),
        );
    };
    let start = Instant::now();

    // Provisioning is best effort. A broken mount must not keep users from
    // getting a worker.
    if let Err(err) = state.store.ensure_user_directory(&user_id).await {
        event!(
            Level::ERROR,
            user_id,
            ?err,
            "Failed to provision user directory"
        );
    }

    match state
        .registry
        .acquire(&user_id, request.session_id.as_deref(), unix_millis())
    {
        Some(summary) => {
            let latency = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "taskId": summary.task_id,
                    "userId": user_id,
                    "sessionId": request.session_id,
                    "latency": latency,
                })),
            )
        }
        None => (
            StatusCode::OK,
            Json(json!({
                "success": false,
                "error": "No warm workers available",
                "warmCount": state.registry.counts().warm,
            })),
        ),
    }
}

async fn post_release(
    State(state): State<GatewayState>,
    Json(request): Json<ReleaseRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(task_id) = request.task_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "taskId is required" })),
        );
    };
    // Unknown ids are fine here. Release is idempotent so callers can retry.
    state.registry.release(&WorkerId::from(task_id.as_str()));
    (
        StatusCode::OK,
        Json(json!({ "success": true, "taskId": task_id })),
    )
}

async fn get_users(State(state): State<GatewayState>) -> (StatusCode, Json<Value>) {
    match state.store.list_user_directories().await {
        Ok(users) => {
            let count = users.len();
            (
                StatusCode::OK,
                Json(json!({ "users": users, "count": count })),
            )
        }
        Err(err) => {
            event!(Level::ERROR, ?err, "Failed to list user directories");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to list user directories" })),
            )
        }
    }
}

async fn get_health(State(state): State<GatewayState>) -> Json<Value> {
    let counts = state.registry.counts();
    Json(json!({
        "status": "ok",
        "warmCount": counts.warm,
        "assignedCount": counts.assigned,
    }))
}
