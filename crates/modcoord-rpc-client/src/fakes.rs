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

//! In-memory fakes for the external collaborators, used by `modcoord-meta`'s
//! integration tests in place of the networked dependencies they stand in
//! for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use modcoord_common::error::CoordinatorResult;
use modcoord_common::ids::{ExecutionAttemptId, JobId, ModificationId, Slot, TaskManagerId, TaskManagerLocation};
use modcoord_common::marker::InputChannelDescriptor;
use modcoord_common::topology::NodeIndex;

use crate::traits::{CheckpointIdCounter, ExecutionGraph, SlotProvider, TaskManagerGateway, TaskStateHandles};
use crate::wire::TriggerMigration;

/// Hands out slots from a fixed pool, round-robin, skipping the excluded
/// worker. Panics if the pool is exhausted or has no eligible worker, which
/// is sufficient for deterministic tests.
pub struct FakeSlotProvider {
    pool: Vec<TaskManagerId>,
    next: AtomicU64,
    released: Mutex<Vec<Slot>>,
}

impl FakeSlotProvider {
    pub fn new(pool: Vec<TaskManagerId>) -> Self {
        Self {
            pool,
            next: AtomicU64::new(0),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn released_slots(&self) -> Vec<Slot> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl SlotProvider for FakeSlotProvider {
    async fn allocate_slot_except(&self, exclude: TaskManagerId) -> CoordinatorResult<Slot> {
        let eligible: Vec<_> = self.pool.iter().filter(|tm| **tm != exclude).collect();
        if eligible.is_empty() {
            return Err(anyhow::anyhow!("no eligible task manager for allocation").into());
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst) as usize % eligible.len();
        let tm = *eligible[i];
        Ok(Slot {
            task_manager_id: tm,
            location: TaskManagerLocation {
                host: format!("tm-{}", tm),
                data_port: 0,
            },
        })
    }

    async fn release_slot(&self, slot: Slot) -> CoordinatorResult<()> {
        self.released.lock().unwrap().push(slot);
        Ok(())
    }
}

pub struct FakeCheckpointIdCounter {
    current: AtomicU64,
}

impl FakeCheckpointIdCounter {
    pub fn new(current: u64) -> Self {
        Self {
            current: AtomicU64::new(current),
        }
    }

    pub fn advance(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointIdCounter for FakeCheckpointIdCounter {
    async fn current(&self) -> CoordinatorResult<u64> {
        Ok(self.current.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone)]
pub enum RecordedCall {
    ResumeTask(ExecutionAttemptId),
    TriggerModification(ExecutionAttemptId, ModificationId),
    TriggerMigration(ExecutionAttemptId, ModificationId, i64),
    ResumeWithDifferentInputs(ExecutionAttemptId),
    ResumeWithNewInput(ExecutionAttemptId, u32),
    ConsumeNewProducer(ExecutionAttemptId, ExecutionAttemptId),
    Deploy(ExecutionAttemptId),
}

/// Records every call so tests can assert on exactly what was dispatched.
#[derive(Default)]
pub struct FakeTaskManagerGateway {
    pub calls: Mutex<Vec<RecordedCall>>,
}

#[async_trait]
impl TaskManagerGateway for FakeTaskManagerGateway {
    async fn resume_task(
        &self,
        attempt: ExecutionAttemptId,
        _timeout: std::time::Duration,
    ) -> CoordinatorResult<()> {
        self.calls.lock().unwrap().push(RecordedCall::ResumeTask(attempt));
        Ok(())
    }

    async fn trigger_modification(
        &self,
        source: ExecutionAttemptId,
        mod_id: ModificationId,
        _timestamp: i64,
        _acks: std::collections::HashSet<ExecutionAttemptId>,
        _subtasks_to_pause: std::collections::HashSet<u32>,
        _action: modcoord_common::ids::ModificationAction,
    ) -> CoordinatorResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::TriggerModification(source, mod_id));
        Ok(())
    }

    async fn trigger_migration(&self, msg: TriggerMigration) -> CoordinatorResult<()> {
        self.calls.lock().unwrap().push(RecordedCall::TriggerMigration(
            msg.attempt_id,
            msg.mod_id,
            msg.upcoming_checkpoint_id,
        ));
        Ok(())
    }

    async fn trigger_resume_with_different_inputs(
        &self,
        attempt: ExecutionAttemptId,
        _new_inputs: Vec<InputChannelDescriptor>,
    ) -> CoordinatorResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::ResumeWithDifferentInputs(attempt));
        Ok(())
    }

    async fn trigger_resume_with_new_input(
        &self,
        attempt: ExecutionAttemptId,
        _new_input: InputChannelDescriptor,
        index: u32,
    ) -> CoordinatorResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::ResumeWithNewInput(attempt, index));
        Ok(())
    }

    async fn consume_new_producer(
        &self,
        consumer_attempt: ExecutionAttemptId,
        new_producer_attempt: ExecutionAttemptId,
        _descriptor: InputChannelDescriptor,
        _index: u32,
    ) -> CoordinatorResult<()> {
        self.calls.lock().unwrap().push(RecordedCall::ConsumeNewProducer(
            consumer_attempt,
            new_producer_attempt,
        ));
        Ok(())
    }

    async fn deploy(
        &self,
        attempt: ExecutionAttemptId,
        _slot: Slot,
        _initial_state: Option<TaskStateHandles>,
    ) -> CoordinatorResult<()> {
        self.calls.lock().unwrap().push(RecordedCall::Deploy(attempt));
        Ok(())
    }
}

/// Minimal in-memory execution graph: tracks mod version and records failures.
pub struct FakeExecutionGraph {
    job_id: JobId,
    mod_version: AtomicU64,
    pub failed: Mutex<Vec<String>>,
}

impl FakeExecutionGraph {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            mod_version: AtomicU64::new(0),
            failed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ExecutionGraph for FakeExecutionGraph {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn global_mod_version(&self) -> u64 {
        self.mod_version.load(Ordering::SeqCst)
    }

    async fn reset_for_new_execution_migration(
        &self,
        _attempt: ExecutionAttemptId,
        _now_millis: i64,
        expected_mod_version: u64,
    ) -> CoordinatorResult<()> {
        let current = self.mod_version.load(Ordering::SeqCst);
        if current != expected_mod_version {
            return Err(modcoord_common::error::CoordinatorError::SchedulingFailure {
                mod_id: ModificationId(0),
                reason: format!(
                    "global mod version mismatch: expected {expected_mod_version}, got {current}"
                ),
            });
        }
        self.mod_version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn schedule_for_migration(
        &self,
        _attempt: ExecutionAttemptId,
        _slot: Slot,
        _state: TaskStateHandles,
    ) -> CoordinatorResult<()> {
        Ok(())
    }

    async fn schedule_new_vertex(
        &self,
        _upstream: NodeIndex,
        _downstream: NodeIndex,
        _parallelism: u32,
    ) -> CoordinatorResult<()> {
        Ok(())
    }

    async fn fail_global(&self, cause: anyhow::Error) {
        self.failed.lock().unwrap().push(cause.to_string());
    }
}
