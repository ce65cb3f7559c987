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

//! The pending-modification record and its state machine: per-attempt
//! acknowledgement bookkeeping driving the OPEN/COMPLETED/EXPIRED/DECLINED/
//! ERROR/DISCARDED transitions.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use modcoord_common::ids::{ExecutionAttemptId, JobId, ModificationAction, ModificationId};
use tokio::task::JoinHandle;

/// `{OPEN, COMPLETED, EXPIRED, DECLINED, ERROR, DISCARDED}`. Terminal
/// transitions (everything but `Open`) are one-shot and irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Open,
    Completed,
    Expired,
    Declined,
    Error,
    Discarded,
}

impl TerminalState {
    pub fn is_terminal(self) -> bool {
        self != TerminalState::Open
    }
}

/// Result of [`PendingModification::acknowledge_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// First observation of a member of the initial pending set.
    Success,
    /// The attempt was already acknowledged.
    Duplicate,
    /// The attempt is not a member of the initial pending set.
    Unknown,
    /// `terminalState != OPEN`.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct PendingModification {
    pub mod_id: ModificationId,
    pub job_id: JobId,
    pub created_at: Instant,
    pub description: String,
    pub action: ModificationAction,

    /// Immutable after creation: `pending ∪ acknowledged` never changes.
    initial_pending: HashSet<ExecutionAttemptId>,
    pending: HashSet<ExecutionAttemptId>,
    acknowledged: HashSet<ExecutionAttemptId>,

    terminal_state: TerminalState,
    error_cause: Option<String>,

    /// Handle to the scheduled expiration timer; cancelled on any terminal
    /// transition reached before it fires.
    #[allow(dead_code)]
    deadline_handle: Option<JoinHandle<()>>,
}

impl PendingModification {
    pub fn new(
        mod_id: ModificationId,
        job_id: JobId,
        description: String,
        action: ModificationAction,
        initial_pending: HashSet<ExecutionAttemptId>,
        deadline_handle: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            mod_id,
            job_id,
            created_at: Instant::now(),
            description,
            action,
            pending: initial_pending.clone(),
            acknowledged: HashSet::new(),
            initial_pending,
            terminal_state: TerminalState::Open,
            error_cause: None,
            deadline_handle,
        }
    }

    pub fn terminal_state(&self) -> TerminalState {
        self.terminal_state
    }

    pub fn initial_pending(&self) -> &HashSet<ExecutionAttemptId> {
        &self.initial_pending
    }

    pub fn acknowledged(&self) -> &HashSet<ExecutionAttemptId> {
        &self.acknowledged
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// `acknowledgeTask`.
    pub fn acknowledge_task(&mut self, attempt: ExecutionAttemptId) -> AckOutcome {
        if self.terminal_state != TerminalState::Open {
            return AckOutcome::Discarded;
        }
        if !self.initial_pending.contains(&attempt) {
            return AckOutcome::Unknown;
        }
        if self.acknowledged.contains(&attempt) {
            return AckOutcome::Duplicate;
        }
        self.acknowledged.insert(attempt);
        self.pending.remove(&attempt);
        AckOutcome::Success
    }

    /// `isFullyAcknowledged`.
    pub fn is_fully_acknowledged(&self) -> bool {
        self.acknowledged == self.initial_pending
    }

    fn transition(&mut self, to: TerminalState) -> bool {
        if self.terminal_state.is_terminal() {
            return false;
        }
        self.terminal_state = to;
        if let Some(handle) = self.deadline_handle.take() {
            handle.abort();
        }
        true
    }

    /// Idempotent after the first call.
    pub fn abort_expired(&mut self) -> bool {
        self.transition(TerminalState::Expired)
    }

    /// Idempotent after the first call.
    pub fn abort_declined(&mut self) -> bool {
        self.transition(TerminalState::Declined)
    }

    /// Idempotent after the first call.
    pub fn abort_error(&mut self, cause: String) -> bool {
        let transitioned = self.transition(TerminalState::Error);
        if transitioned {
            self.error_cause = Some(cause);
        }
        transitioned
    }

    /// Idempotent after the first call.
    pub fn abort_discarded(&mut self) -> bool {
        self.transition(TerminalState::Discarded)
    }

    pub fn error_cause(&self) -> Option<&str> {
        self.error_cause.as_deref()
    }

    /// `finalizeCheckpoint`: on full ack, OPEN -> COMPLETED and returns the
    /// completion record; otherwise `None`. Does not itself check
    /// `is_fully_acknowledged` — callers invoke it only after observing that.
    pub fn finalize_checkpoint(&mut self) -> Option<CompletedModification> {
        if !self.is_fully_acknowledged() {
            return None;
        }
        if !self.transition(TerminalState::Completed) {
            return None;
        }
        Some(CompletedModification {
            mod_id: self.mod_id,
            job_id: self.job_id,
            description: self.description.clone(),
            action: self.action,
            duration: self.elapsed(),
        })
    }
}

/// Snapshot of a pending record after all acks received.
#[derive(Debug, Clone)]
pub struct CompletedModification {
    pub mod_id: ModificationId,
    pub job_id: JobId,
    pub description: String,
    pub action: ModificationAction,
    pub duration: Duration,
}

/// A modification that reached any non-`COMPLETED` terminal state, so
/// diagnostics can report *why* a modification failed (Decision D1,
/// DESIGN.md).
#[derive(Debug, Clone)]
pub struct FailedModification {
    pub mod_id: ModificationId,
    pub job_id: JobId,
    pub description: String,
    pub action: ModificationAction,
    pub terminal_state: TerminalState,
    pub cause: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use modcoord_common::ids::VertexId;

    fn attempt(subtask_index: u32) -> ExecutionAttemptId {
        ExecutionAttemptId {
            vertex: VertexId::new(),
            subtask_index,
            attempt: 0,
        }
    }

    fn fresh(pending: HashSet<ExecutionAttemptId>) -> PendingModification {
        PendingModification::new(
            ModificationId(1),
            JobId::new(),
            "test".to_string(),
            ModificationAction::Pausing,
            pending,
            None,
        )
    }

    #[test]
    fn ack_then_duplicate_then_unknown() {
        let a = attempt(0);
        let b = attempt(1);
        let mut m = fresh([a].into_iter().collect());

        assert_eq!(m.acknowledge_task(a), AckOutcome::Success);
        assert_eq!(m.acknowledge_task(a), AckOutcome::Duplicate);
        assert_eq!(m.acknowledge_task(b), AckOutcome::Unknown);
        assert!(m.is_fully_acknowledged());
    }

    #[test]
    fn ack_after_terminal_is_discarded() {
        let a = attempt(0);
        let mut m = fresh([a].into_iter().collect());
        assert!(m.abort_declined());
        assert_eq!(m.acknowledge_task(a), AckOutcome::Discarded);
        // idempotent
        assert!(!m.abort_declined());
    }

    #[test]
    fn empty_pending_is_vacuously_complete() {
        let m = fresh(HashSet::new());
        assert!(m.is_fully_acknowledged());
    }

    #[test]
    fn finalize_checkpoint_only_once() {
        let a = attempt(0);
        let mut m = fresh([a].into_iter().collect());
        m.acknowledge_task(a);
        assert!(m.finalize_checkpoint().is_some());
        // already COMPLETED: second call returns None even though still fully acked
        assert!(m.finalize_checkpoint().is_none());
    }
}
