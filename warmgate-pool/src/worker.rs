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

use core::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use warmgate_error::{Code, Error, make_err};

use crate::messages::GatewayToWorker;

/// Milliseconds since the unix epoch.
pub type PoolTimestamp = u64;

/// Unique identifier of a worker. Chosen by the worker itself at connection
/// time; the registry never generates these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a worker connection.
///
/// `Assigned` is terminal: a used worker is torn down and replaced by the
/// orchestrating infrastructure, never recycled back to `Warm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Warm,
    Assigned,
}

/// Represents a connection to a worker and is used as the medium to interact
/// with the worker from the registry.
#[derive(Debug)]
pub struct Worker {
    /// Unique identifier of the worker.
    pub id: WorkerId,

    /// Channel to push messages from gateway to worker. The registry is the
    /// exclusive owner of this binding; dropping the record closes it.
    pub tx: UnboundedSender<GatewayToWorker>,

    /// Identifies this channel instance so a close observer for a superseded
    /// connection cannot remove a record that has since been re-registered.
    pub conn_token: Uuid,

    pub state: WorkerState,

    /// Present iff `state == Assigned`.
    pub user_id: Option<String>,
    /// Present iff `state == Assigned` and the caller supplied one.
    pub session_id: Option<String>,

    /// Set once at registration, immutable afterwards.
    pub connected_at: PoolTimestamp,
    /// Set on the Warm -> Assigned transition.
    pub assigned_at: Option<PoolTimestamp>,
    /// Updated on every heartbeat; monotonically non-decreasing.
    pub last_heartbeat: PoolTimestamp,
}

impl Worker {
    pub fn new(id: WorkerId, tx: UnboundedSender<GatewayToWorker>, now: PoolTimestamp) -> Self {
        Self {
            id,
            tx,
            conn_token: Uuid::new_v4(),
            state: WorkerState::Warm,
            user_id: None,
            session_id: None,
            connected_at: now,
            assigned_at: None,
            last_heartbeat: now,
        }
    }

    /// Enqueues the assignment notification on the worker channel.
    pub fn notify_session_init(&self, env: &str) -> Result<(), Error> {
        let user_id = self
            .user_id
            .clone()
            .ok_or_else(|| make_err!(Code::Internal, "Worker {} has no bound user", self.id))?;
        self.tx
            .send(GatewayToWorker::InitUserSession {
                user_id,
                session_id: self.session_id.clone(),
                env: env.to_string(),
            })
            .map_err(|_| make_err!(Code::Internal, "Worker {} disconnected", self.id))
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            task_id: self.id.clone(),
            state: self.state,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            connected_at: self.connected_at,
            assigned_at: self.assigned_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Read-only snapshot of a [`Worker`], safe to hand out of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub task_id: WorkerId,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub connected_at: PoolTimestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<PoolTimestamp>,
    pub last_heartbeat: PoolTimestamp,
}
