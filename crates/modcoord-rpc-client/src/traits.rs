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

//! Interfaces the coordinator consumes from external collaborators.
//!
//! The collaborators themselves — the resource/slot allocator, the periodic
//! checkpoint coordinator, the execution-graph runtime, and the network
//! stack that actually carries RPCs to task managers — are out of scope for
//! this crate. These traits are the seams: production code wires a concrete
//! implementation in, tests wire in an in-memory fake.

use std::collections::HashSet;

use async_trait::async_trait;
use modcoord_common::error::CoordinatorResult;
use modcoord_common::ids::{ExecutionAttemptId, JobId, ModificationAction, ModificationId, Slot, TaskManagerId};
use modcoord_common::marker::InputChannelDescriptor;
use modcoord_common::topology::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::wire::TriggerMigration;

/// `SlotProvider.allocateSlotExcept(tm)`.
#[async_trait]
pub trait SlotProvider: Send + Sync + 'static {
    /// Synchronously (from the caller's point of view) allocate a slot on a
    /// worker other than `exclude`.
    async fn allocate_slot_except(&self, exclude: TaskManagerId) -> CoordinatorResult<Slot>;

    /// Release a previously allocated slot, e.g. after a decline cancels an
    /// in-flight migration.
    async fn release_slot(&self, slot: Slot) -> CoordinatorResult<()>;
}

/// `CheckpointIdCounter.getCurrent()`.
#[async_trait]
pub trait CheckpointIdCounter: Send + Sync + 'static {
    async fn current(&self) -> CoordinatorResult<u64>;
}

/// Per-task deployment/state-handle payload the restart engine hands to a
/// redeployed attempt. Opaque to the coordinator beyond the wrapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateHandles {
    pub attempt: ExecutionAttemptId,
    pub state_blob: Vec<u8>,
}

/// RPCs issued to a task manager; idempotent at the task side by `attempt`.
#[async_trait]
pub trait TaskManagerGateway: Send + Sync + 'static {
    async fn resume_task(
        &self,
        attempt: ExecutionAttemptId,
        timeout: std::time::Duration,
    ) -> CoordinatorResult<()>;

    /// Delivers a `StartModification` marker to one source task (pauseAll /
    /// pauseSingle); downstream propagation from there is the data plane's
    /// job, not the gateway's. Called once per source attempt in the job.
    async fn trigger_modification(
        &self,
        source: ExecutionAttemptId,
        mod_id: ModificationId,
        timestamp: i64,
        acks: HashSet<ExecutionAttemptId>,
        subtasks_to_pause: HashSet<u32>,
        action: ModificationAction,
    ) -> CoordinatorResult<()>;

    /// Delivers a `StartMigration` marker to one source task. `msg.attempt_id`
    /// names the addressed source; called once per source attempt.
    async fn trigger_migration(&self, msg: TriggerMigration) -> CoordinatorResult<()>;

    async fn trigger_resume_with_different_inputs(
        &self,
        attempt: ExecutionAttemptId,
        new_inputs: Vec<InputChannelDescriptor>,
    ) -> CoordinatorResult<()>;

    async fn trigger_resume_with_new_input(
        &self,
        attempt: ExecutionAttemptId,
        new_input: InputChannelDescriptor,
        index: u32,
    ) -> CoordinatorResult<()>;

    async fn consume_new_producer(
        &self,
        consumer_attempt: ExecutionAttemptId,
        new_producer_attempt: ExecutionAttemptId,
        descriptor: InputChannelDescriptor,
        index: u32,
    ) -> CoordinatorResult<()>;

    async fn deploy(
        &self,
        attempt: ExecutionAttemptId,
        slot: Slot,
        initial_state: Option<TaskStateHandles>,
    ) -> CoordinatorResult<()>;
}

/// `ExecutionGraph` operations the coordinator calls under the graph's own
/// mutation discipline; the coordinator never mutates it directly.
#[async_trait]
pub trait ExecutionGraph: Send + Sync + 'static {
    fn job_id(&self) -> JobId;

    fn global_mod_version(&self) -> u64;

    /// Produces a freshly-versioned `Execution` for `attempt` and bumps the
    /// global mod version. Fails with `SchedulingFailure` on a stale caller
    /// version.
    async fn reset_for_new_execution_migration(
        &self,
        attempt: ExecutionAttemptId,
        now_millis: i64,
        expected_mod_version: u64,
    ) -> CoordinatorResult<()>;

    /// Deploys the reset execution onto its pre-allocated slot.
    async fn schedule_for_migration(
        &self,
        attempt: ExecutionAttemptId,
        slot: Slot,
        state: TaskStateHandles,
    ) -> CoordinatorResult<()>;

    /// Wires a new logical vertex between `source` and its downstream
    /// consumer and schedules its subtasks (used by `createAndInsertOperator`).
    async fn schedule_new_vertex(
        &self,
        upstream: NodeIndex,
        downstream: NodeIndex,
        parallelism: u32,
    ) -> CoordinatorResult<()>;

    /// Escalates an unrecoverable local error: the coordinator deliberately
    /// does not attempt partial recovery.
    async fn fail_global(&self, cause: anyhow::Error);
}
