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

use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::any;
use tokio::sync::mpsc;
use tracing::{Level, event};
use uuid::Uuid;
use warmgate_pool::messages::WorkerMessage;
use warmgate_pool::pool_registry::PoolRegistry;
use warmgate_pool::worker::WorkerId;
use warmgate_util::task::JoinHandleDropGuard;
use warmgate_util::{spawn, unix_millis};

use crate::GatewayState;

/// Worker connection routes. A worker that omits its id segment still gets
/// registered, under a synthetic id, so a misconfigured fleet shows up in
/// pool state instead of silently bouncing.
pub fn routes(state: GatewayState) -> Router {
    Router::new()
        .route("/internal/warm/{worker_id}", any(worker_connect))
        .route("/internal/warm", any(anonymous_worker_connect))
        .with_state(state)
}

async fn worker_connect(
    State(state): State<GatewayState>,
    axum::extract::Path(worker_id): axum::extract::Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let worker_id = if worker_id.is_empty() {
        synthetic_worker_id()
    } else {
        WorkerId::from(worker_id)
    };
    ws.on_upgrade(move |socket| handle_worker_socket(state, worker_id, socket))
}

async fn anonymous_worker_connect(
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> Response {
    let worker_id = synthetic_worker_id();
    ws.on_upgrade(move |socket| handle_worker_socket(state, worker_id, socket))
}

fn synthetic_worker_id() -> WorkerId {
    WorkerId(format!("anon-{}", Uuid::new_v4()))
}

/// Owns one worker connection for its whole lifetime. Registers the worker,
/// pumps messages in both directions, and removes the registration when
/// either side goes away. The registry closing our channel (on release or
/// eviction) ends the loop and with it the socket.
async fn handle_worker_socket(state: GatewayState, worker_id: WorkerId, mut socket: WebSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn_token = state.registry.register(worker_id.clone(), tx, unix_millis());

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else {
                    // Registry dropped our channel; tear the socket down.
                    break;
                };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        event!(Level::ERROR, %worker_id, ?err, "Failed to encode outbound message");
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_worker_message(&state.registry, &worker_id, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        event!(Level::WARN, %worker_id, ?err, "Worker socket error");
                        break;
                    }
                }
            }
        }
    }

    state.registry.remove_on_close(&worker_id, conn_token);
}

/// A malformed frame is logged and dropped; one bad message must not cost a
/// warm worker its connection.
fn handle_worker_message(registry: &PoolRegistry, worker_id: &WorkerId, raw: &str) {
    let message: WorkerMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(err) => {
            event!(Level::WARN, %worker_id, ?err, "Discarding malformed worker message");
            return;
        }
    };
    match message {
        WorkerMessage::Heartbeat => registry.heartbeat(worker_id, unix_millis()),
        WorkerMessage::Status { status } => {
            event!(Level::INFO, %worker_id, ?status, "Worker status");
        }
        WorkerMessage::UserSessionReady { user_id } => {
            event!(Level::INFO, %worker_id, ?user_id, "Worker reports user session ready");
        }
        WorkerMessage::ExecuteResult {
            session_id,
            success,
        } => {
            event!(Level::INFO, %worker_id, ?session_id, ?success, "Worker reports execute result");
        }
        WorkerMessage::Unknown => {
            event!(Level::DEBUG, %worker_id, "Ignoring unrecognized worker message");
        }
    }
}

/// Periodically evicts workers whose heartbeats have gone silent. Holds only
/// a weak reference so the sweeper never keeps a dismantled registry alive;
/// it exits on the first failed upgrade.
pub fn spawn_timeout_sweeper(
    registry: &Arc<PoolRegistry>,
    worker_timeout: Duration,
) -> JoinHandleDropGuard<()> {
    let weak_registry: Weak<PoolRegistry> = Arc::downgrade(registry);
    let timeout_ms = u64::try_from(worker_timeout.as_millis()).unwrap_or(u64::MAX);
    spawn!("pool_timeout_sweeper", async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(registry) = weak_registry.upgrade() else {
                return;
            };
            registry.remove_timedout(unix_millis(), timeout_ms);
        }
    })
}
