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

//! Control markers carried in-band on data streams.
//!
//! Markers travel interleaved with records on the same channel, in FIFO
//! order per channel. Every variant carries the `{mod_id, timestamp}`
//! envelope implicitly via its own fields (checkpoint markers instead carry
//! a checkpoint id, since they predate and are reused by this subsystem).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, ExecutionAttemptId, ModificationAction, ModificationId};

/// Consumer-side pointer to a [`ResultPartition`]: local, remote, or unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLocation {
    Local,
    Remote(ConnectionId),
    Unknown,
}

/// Consumer-side descriptor of one producer output partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChannelDescriptor {
    pub result_partition_id: uuid::Uuid,
    pub location: ChannelLocation,
}

/// Options carried alongside a checkpoint barrier (subset relevant to this
/// subsystem: the barrier is reused purely as a pause rendezvous).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOptions {
    pub is_synchronous: bool,
}

/// A single in-band control marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMarker {
    /// Reused from the checkpointing subsystem; also the synchronization
    /// point for pause-on-checkpoint.
    CheckpointBarrier {
        checkpoint_id: u64,
        timestamp: i64,
        options: CheckpointOptions,
    },
    /// Abort the checkpoint carrying `checkpoint_id`.
    CancelCheckpointMarker { checkpoint_id: u64 },
    /// Commands the indicated downstream subtasks (by `parallel_subtask_index`)
    /// to pause or stop at the next checkpoint.
    StartModification {
        mod_id: ModificationId,
        timestamp: i64,
        acks: HashSet<ExecutionAttemptId>,
        subtasks_to_pause: HashSet<u32>,
        action: ModificationAction,
    },
    /// Richer variant used for migration: spillers are told which output
    /// subtask indices to spill to disk; stoppers carry the new input-channel
    /// descriptors to hand to their downstream peers.
    StartMigration {
        mod_id: ModificationId,
        timestamp: i64,
        spilling_vertices: HashMap<ExecutionAttemptId, HashSet<u32>>,
        stopping_vertices: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>>,
        upcoming_checkpoint_id: i64,
    },
    /// Rescind an earlier in-flight modification.
    CancelModification {
        mod_id: ModificationId,
        timestamp: i64,
        vertex_ids: HashSet<ExecutionAttemptId>,
    },
    /// Emitted downstream by a paused operator: carries the replacement
    /// input-channel descriptor for each downstream subtask, positionally.
    PausingOperator {
        descriptors: Vec<InputChannelDescriptor>,
    },
}

impl ControlMarker {
    pub fn mod_id(&self) -> Option<ModificationId> {
        match self {
            ControlMarker::StartModification { mod_id, .. }
            | ControlMarker::StartMigration { mod_id, .. }
            | ControlMarker::CancelModification { mod_id, .. } => Some(*mod_id),
            _ => None,
        }
    }
}
