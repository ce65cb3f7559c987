// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The coordinator registry: four maps keyed by `ModificationId`
//! (pending/completed/failed) plus one keyed by `ExecutionAttemptId`
//! (stored state), guarded by a single `parking_lot::Mutex` since nothing
//! async ever runs while holding it, with a second `tokio::sync::Mutex<()>`
//! ordering trigger invocations ahead of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use modcoord_common::ids::{ExecutionAttemptId, JobId, ModificationAction, ModificationId, ModificationIdGenerator, Slot};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::metrics::CoordinatorMetrics;
use crate::pending::{AckOutcome, CompletedModification, FailedModification, PendingModification, TerminalState};
use modcoord_rpc_client::traits::TaskStateHandles;

/// What the restart engine needs to correlate a late state arrival with the
/// paused vertex it belongs to, and to deploy it once restarted.
#[derive(Debug, Clone)]
pub struct RestartTarget {
    pub mod_id: ModificationId,
    pub slot: Slot,
}

struct Inner {
    pending: HashMap<ModificationId, PendingModification>,
    completed: HashMap<ModificationId, CompletedModification>,
    failed: HashMap<ModificationId, FailedModification>,
    stored_state: HashMap<ExecutionAttemptId, TaskStateHandles>,
    vertex_to_restart: HashMap<ExecutionAttemptId, RestartTarget>,
    id_gen: ModificationIdGenerator,
}

/// Classification of an inbound message against a `ModificationId` that is
/// no longer (or never was) pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationLookup {
    Pending,
    /// Reached `completed` — a "late acknowledge".
    Completed,
    /// Reached `failed` (including `EXPIRED`, per Decision D1) — still a
    /// known, just no-longer-actionable, modification.
    Failed,
    /// Never observed by this coordinator.
    Unknown,
}

pub struct CoordinatorRegistry {
    job_id: JobId,
    inner: Mutex<Inner>,
    trigger_lock: AsyncMutex<()>,
    config: CoordinatorConfig,
    metrics: Arc<CoordinatorMetrics>,
}

impl CoordinatorRegistry {
    pub fn new(job_id: JobId, config: CoordinatorConfig, metrics: Arc<CoordinatorMetrics>) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                completed: HashMap::new(),
                failed: HashMap::new(),
                stored_state: HashMap::new(),
                vertex_to_restart: HashMap::new(),
                id_gen: ModificationIdGenerator::new(),
            }),
            trigger_lock: AsyncMutex::new(()),
            config,
            metrics,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    /// Acquired by the trigger engine before `lock`, ordering concurrent
    /// trigger invocations.
    pub async fn acquire_trigger_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.trigger_lock.lock().await
    }

    /// Creates a new pending modification and schedules its deadline timer.
    /// The timer calls back into `self.expire` after `deadline`; `self`
    /// must be held in an `Arc` by the caller so the spawned task can hold
    /// its own clone.
    pub fn create_pending(
        self: &Arc<Self>,
        description: String,
        action: ModificationAction,
        initial_pending: std::collections::HashSet<ExecutionAttemptId>,
    ) -> ModificationId {
        let mod_id = {
            let mut inner = self.inner.lock();
            inner.id_gen.generate()
        };

        let registry = Arc::clone(self);
        let deadline = self.config.modification_deadline();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            registry.expire(mod_id).await;
        });

        let record = PendingModification::new(
            mod_id,
            self.job_id,
            description,
            action,
            initial_pending,
            Some(handle),
        );
        self.inner.lock().pending.insert(mod_id, record);
        self.metrics.modifications_triggered_total.inc();
        info!(%mod_id, ?action, "created pending modification");
        mod_id
    }

    /// Looks up which map currently holds `mod_id`.
    pub fn lookup(&self, mod_id: ModificationId) -> ModificationLookup {
        let inner = self.inner.lock();
        if inner.pending.contains_key(&mod_id) {
            ModificationLookup::Pending
        } else if inner.completed.contains_key(&mod_id) {
            ModificationLookup::Completed
        } else if inner.failed.contains_key(&mod_id) {
            ModificationLookup::Failed
        } else {
            ModificationLookup::Unknown
        }
    }

    /// `acknowledgeTask`, applied against whichever pending record matches
    /// `mod_id`. Returns `None` if `mod_id` is not (or no longer) pending.
    /// On `SUCCESS` with full acknowledgement, finalizes and moves the
    /// record to `completed` before returning.
    pub fn acknowledge_task(
        &self,
        mod_id: ModificationId,
        attempt: ExecutionAttemptId,
    ) -> Option<AckOutcome> {
        let mut inner = self.inner.lock();
        let outcome = {
            let record = inner.pending.get_mut(&mod_id)?;
            record.acknowledge_task(attempt)
        };
        if outcome == AckOutcome::Success {
            let fully = inner.pending.get(&mod_id).unwrap().is_fully_acknowledged();
            if fully {
                let mut record = inner.pending.remove(&mod_id).unwrap();
                if let Some(completed) = record.finalize_checkpoint() {
                    self.metrics.modifications_completed_total.inc();
                    info!(%mod_id, "modification fully acknowledged, moved to completed");
                    inner.completed.insert(mod_id, completed);
                } else {
                    // Should be unreachable: we just observed full ack on an
                    // OPEN record. A local policy violation if it happens.
                    warn!(%mod_id, "finalize_checkpoint returned None after full ack");
                }
            }
        }
        Some(outcome)
    }

    /// `Decline`: OPEN -> DECLINED, move to `failed`. No-op (besides
    /// logging) if already terminal. Releases (and returns, so the caller
    /// can hand them back to the `SlotProvider`) any slots pre-allocated
    /// for the declined modification's targets — Decision D2, DESIGN.md.
    pub fn decline(&self, mod_id: ModificationId, reason: String) -> Option<Vec<RestartTarget>> {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.pending.remove(&mod_id) else {
            return None;
        };
        if !record.abort_declined() {
            // Already terminal; put it back untouched (shouldn't happen
            // since it was still in `pending`).
            inner.pending.insert(mod_id, record);
            return None;
        }
        self.metrics.modifications_declined_total.inc();
        warn!(%mod_id, %reason, "modification declined by a participant");

        let released: Vec<RestartTarget> = record
            .initial_pending()
            .iter()
            .filter_map(|attempt| inner.vertex_to_restart.remove(attempt))
            .collect();

        inner.failed.insert(
            mod_id,
            FailedModification {
                mod_id,
                job_id: record.job_id,
                description: record.description,
                action: record.action,
                terminal_state: TerminalState::Declined,
                cause: Some(reason),
            },
        );
        Some(released)
    }

    /// External cancellation: OPEN -> DISCARDED.
    pub fn discard(&self, mod_id: ModificationId) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.pending.remove(&mod_id) else {
            return false;
        };
        if !record.abort_discarded() {
            inner.pending.insert(mod_id, record);
            return false;
        }
        self.metrics.modifications_discarded_total.inc();
        inner.failed.insert(
            mod_id,
            FailedModification {
                mod_id,
                job_id: record.job_id,
                description: record.description,
                action: record.action,
                terminal_state: TerminalState::Discarded,
                cause: None,
            },
        );
        true
    }

    /// `abortError`: OPEN -> ERROR, moved to `failed`.
    pub fn error(&self, mod_id: ModificationId, cause: String) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.pending.remove(&mod_id) else {
            return false;
        };
        if !record.abort_error(cause.clone()) {
            inner.pending.insert(mod_id, record);
            return false;
        }
        inner.failed.insert(
            mod_id,
            FailedModification {
                mod_id,
                job_id: record.job_id,
                description: record.description,
                action: record.action,
                terminal_state: TerminalState::Error,
                cause: Some(cause),
            },
        );
        true
    }

    /// Deadline fire: if still OPEN, EXPIRED and moved into `failed`.
    ///
    /// Decision D1 (see DESIGN.md): an EXPIRED modification is written to
    /// `failed`, so the testable property "every non-completed terminal
    /// modification is in failed" holds without a special case for EXPIRED.
    async fn expire(self: Arc<Self>, mod_id: ModificationId) {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.pending.remove(&mod_id) else {
            return;
        };
        if !record.abort_expired() {
            inner.pending.insert(mod_id, record);
            return;
        }
        let elapsed = record.elapsed();
        self.metrics.modifications_expired_total.inc();
        warn!(%mod_id, elapsed_secs = elapsed.as_secs(), "modification expired");
        inner.failed.insert(
            mod_id,
            FailedModification {
                mod_id,
                job_id: record.job_id,
                description: record.description,
                action: record.action,
                terminal_state: TerminalState::Expired,
                cause: Some(format!("no full ack within {}s", elapsed.as_secs())),
            },
        );
    }

    /// `StateMigration`: store under `attempt`; duplicates overwrite with a
    /// logged duplicate (idempotent insert).
    pub fn insert_stored_state(&self, attempt: ExecutionAttemptId, state: TaskStateHandles) {
        let mut inner = self.inner.lock();
        if inner.stored_state.insert(attempt, state).is_some() {
            debug!(%attempt, "duplicate state-migration reply, overwriting stored state");
        }
    }

    pub fn has_stored_state(&self, attempt: ExecutionAttemptId) -> bool {
        self.inner.lock().stored_state.contains_key(&attempt)
    }

    pub fn take_stored_state(&self, attempt: ExecutionAttemptId) -> Option<TaskStateHandles> {
        self.inner.lock().stored_state.remove(&attempt)
    }

    pub fn register_restart_target(&self, attempt: ExecutionAttemptId, target: RestartTarget) {
        self.inner.lock().vertex_to_restart.insert(attempt, target);
    }

    pub fn is_awaiting_restart(&self, attempt: ExecutionAttemptId) -> bool {
        self.inner.lock().vertex_to_restart.contains_key(&attempt)
    }

    pub fn take_restart_target(&self, attempt: ExecutionAttemptId) -> Option<RestartTarget> {
        self.inner.lock().vertex_to_restart.remove(&attempt)
    }

    /// Atomically check-and-take both entries required by the restart
    /// guard, so a racing duplicate reply can never cause a double restart.
    pub fn take_restart_pair(
        &self,
        attempt: ExecutionAttemptId,
    ) -> Option<(RestartTarget, TaskStateHandles)> {
        let mut inner = self.inner.lock();
        if !inner.vertex_to_restart.contains_key(&attempt) || !inner.stored_state.contains_key(&attempt) {
            return None;
        }
        let target = inner.vertex_to_restart.remove(&attempt)?;
        let state = inner.stored_state.remove(&attempt)?;
        Some((target, state))
    }

    pub fn put_back_restart_pair(
        &self,
        attempt: ExecutionAttemptId,
        target: RestartTarget,
        state: TaskStateHandles,
    ) {
        let mut inner = self.inner.lock();
        inner.vertex_to_restart.insert(attempt, target);
        inner.stored_state.insert(attempt, state);
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.inner.lock().failed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    #[cfg(test)]
    pub fn is_completed(&self, mod_id: ModificationId) -> bool {
        self.inner.lock().completed.contains_key(&mod_id)
    }

    #[cfg(test)]
    pub fn is_failed(&self, mod_id: ModificationId) -> bool {
        self.inner.lock().failed.contains_key(&mod_id)
    }

    #[cfg(test)]
    pub fn failed_terminal_state(&self, mod_id: ModificationId) -> Option<TerminalState> {
        self.inner
            .lock()
            .failed
            .get(&mod_id)
            .map(|f| f.terminal_state)
    }
}

/// Test-only helper kept out of the public surface: constructs a registry
/// with a very short deadline, for expiry tests.
#[cfg(test)]
pub fn test_registry(deadline: Duration) -> Arc<CoordinatorRegistry> {
    let mut config = CoordinatorConfig::default();
    config.modification_deadline_secs = deadline.as_secs().max(1);
    CoordinatorRegistry::new(
        JobId::new(),
        config,
        Arc::new(CoordinatorMetrics::for_test()),
    )
}
