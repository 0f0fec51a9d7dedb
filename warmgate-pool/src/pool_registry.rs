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

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{Level, event};
use uuid::Uuid;

use crate::messages::GatewayToWorker;
use crate::worker::{PoolTimestamp, Worker, WorkerId, WorkerState, WorkerSummary};

/// Per-state worker counts, taken as one consistent snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCounts {
    pub warm: usize,
    pub assigned: usize,
}

/// A collection of warm workers that are available for assignment.
struct PoolRegistryImpl {
    /// All live worker records, keyed by the registry's only lookup key.
    workers: HashMap<WorkerId, Worker>,

    /// FIFO queue of candidates for assignment. Entries can go stale when a
    /// worker is removed or superseded out of band; `acquire` skips those.
    ready_queue: VecDeque<WorkerId>,
}

impl PoolRegistryImpl {
    /// Adds a worker record in Warm state. Last registration wins: a record
    /// still bound to the same id is evicted, and dropping it closes its
    /// channel so the stale connection is torn down rather than left
    /// dangling.
    fn add_worker(&mut self, worker: Worker) {
        if let Some(prior) = self.workers.remove(&worker.id) {
            event!(
                Level::WARN,
                worker_id = %worker.id,
                "Worker re-registered while prior connection was live, evicting prior channel"
            );
            self.ready_queue.retain(|id| id != &prior.id);
            drop(prior);
        }
        self.ready_queue.push_back(worker.id.clone());
        self.workers.insert(worker.id.clone(), worker);
    }

    /// Finds the first Warm worker in registration order and flips it to
    /// Assigned. Scan and flip happen in one critical section; callers hold
    /// the registry lock for the whole call.
    fn assign_worker(
        &mut self,
        user_id: &str,
        session_id: Option<&str>,
        environment: &str,
        now: PoolTimestamp,
    ) -> Option<WorkerSummary> {
        while let Some(worker_id) = self.ready_queue.pop_front() {
            let Some(worker) = self.workers.get_mut(&worker_id) else {
                // Stale queue entry for a worker that already went away.
                continue;
            };
            if worker.state != WorkerState::Warm {
                continue;
            }
            worker.state = WorkerState::Assigned;
            worker.user_id = Some(user_id.to_string());
            worker.session_id = session_id.map(str::to_string);
            worker.assigned_at = Some(now);

            // The notification is dispatched strictly after the flip is
            // committed and before the lock is released, so no reader can
            // observe an Assigned record whose init message was not yet
            // enqueued. A failed send leaves the record Assigned; recovery
            // of a dead assignee belongs to the worker orchestration layer.
            if let Err(err) = worker.notify_session_init(environment) {
                event!(
                    Level::WARN,
                    worker_id = %worker.id,
                    ?err,
                    "Failed to send session init, channel already closing"
                );
            }
            return Some(worker.summary());
        }
        None
    }

    fn remove_worker(&mut self, worker_id: &WorkerId) -> Option<Worker> {
        let removed = self.workers.remove(worker_id);
        if removed.is_some() {
            self.ready_queue.retain(|id| id != worker_id);
        }
        removed
    }

    fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for worker in self.workers.values() {
            match worker.state {
                WorkerState::Warm => counts.warm += 1,
                WorkerState::Assigned => counts.assigned += 1,
            }
        }
        counts
    }
}

/// The warm-pool registry: tracks every worker connection's lifecycle state,
/// selects candidates on acquire, binds user identity and reclaims dead or
/// released workers.
///
/// All mutation goes through one mutex; none of the operations block on I/O
/// (sending to a worker is a non-blocking enqueue), so the lock is only ever
/// held for short critical sections.
pub struct PoolRegistry {
    inner: Mutex<PoolRegistryImpl>,

    /// Deployment environment tag forwarded to workers on assignment.
    environment: String,
}

impl PoolRegistry {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(PoolRegistryImpl {
                workers: HashMap::new(),
                ready_queue: VecDeque::new(),
            }),
            environment: environment.into(),
        }
    }

    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Registers a connected worker as Warm and returns the connection token
    /// the caller must present in [`Self::remove_on_close`].
    pub fn register(
        &self,
        worker_id: WorkerId,
        tx: UnboundedSender<GatewayToWorker>,
        now: PoolTimestamp,
    ) -> Uuid {
        let worker = Worker::new(worker_id.clone(), tx, now);
        let conn_token = worker.conn_token;
        let mut inner = self.inner.lock();
        inner.add_worker(worker);
        let counts = inner.counts();
        drop(inner);
        event!(
            Level::INFO,
            %worker_id,
            warm = counts.warm,
            assigned = counts.assigned,
            "Worker registered"
        );
        conn_token
    }

    /// Binds the first available Warm worker (FIFO over registration order)
    /// to the given user and notifies the worker. Returns `None` when the
    /// pool is exhausted; that is a normal outcome, not an error.
    pub fn acquire(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        now: PoolTimestamp,
    ) -> Option<WorkerSummary> {
        let assigned = self
            .inner
            .lock()
            .assign_worker(user_id, session_id, &self.environment, now);
        match &assigned {
            Some(summary) => event!(
                Level::INFO,
                worker_id = %summary.task_id,
                user_id,
                "Worker assigned to user"
            ),
            None => event!(Level::INFO, user_id, "No warm workers available"),
        }
        assigned
    }

    /// Tears down an assigned worker: removes its record, which drops and
    /// thereby closes its channel. A used worker is never reused; the
    /// orchestrating infrastructure replaces it with a fresh warm instance.
    /// No-op if the id is unknown.
    pub fn release(&self, worker_id: &WorkerId) {
        let removed = self.inner.lock().remove_worker(worker_id);
        if removed.is_some() {
            event!(Level::INFO, %worker_id, "Worker released");
        }
    }

    /// Records a liveness signal. No-op if the id is unknown (the worker may
    /// have disconnected between message send and processing).
    pub fn heartbeat(&self, worker_id: &WorkerId, now: PoolTimestamp) {
        let mut inner = self.inner.lock();
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.last_heartbeat = worker.last_heartbeat.max(now);
        }
    }

    /// Removes the record for `worker_id` if it still points at the channel
    /// instance identified by `conn_token`. Invoked by the connection task
    /// when a worker socket closes; idempotent.
    pub fn remove_on_close(&self, worker_id: &WorkerId, conn_token: Uuid) {
        let mut inner = self.inner.lock();
        if inner
            .workers
            .get(worker_id)
            .is_some_and(|worker| worker.conn_token == conn_token)
        {
            inner.remove_worker(worker_id);
            drop(inner);
            event!(Level::INFO, %worker_id, "Worker disconnected");
        }
    }

    /// Evicts workers whose last heartbeat is older than `timeout_ms`.
    /// This is a policy layer on top of the registry; it is only invoked
    /// when a worker timeout is configured.
    pub fn remove_timedout(&self, now: PoolTimestamp, timeout_ms: u64) -> Vec<WorkerId> {
        let mut inner = self.inner.lock();
        let timedout: Vec<WorkerId> = inner
            .workers
            .values()
            .filter(|worker| worker.last_heartbeat.saturating_add(timeout_ms) <= now)
            .map(|worker| worker.id.clone())
            .collect();
        for worker_id in &timedout {
            inner.remove_worker(worker_id);
        }
        drop(inner);
        for worker_id in &timedout {
            event!(Level::WARN, %worker_id, "Worker timed out, removing from pool");
        }
        timedout
    }

    pub fn counts(&self) -> PoolCounts {
        self.inner.lock().counts()
    }

    /// Summaries of all live workers, ordered by registration time.
    pub fn list(&self) -> Vec<WorkerSummary> {
        let inner = self.inner.lock();
        let mut summaries: Vec<WorkerSummary> =
            inner.workers.values().map(Worker::summary).collect();
        drop(inner);
        summaries.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.task_id.0.cmp(&b.task_id.0))
        });
        summaries
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<WorkerSummary> {
        self.inner.lock().workers.get(worker_id).map(Worker::summary)
    }
}

impl core::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let counts = self.counts();
        f.debug_struct("PoolRegistry")
            .field("environment", &self.environment)
            .field("counts", &counts)
            .finish()
    }
}
