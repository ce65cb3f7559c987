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

//! Opaque identifiers shared between the coordinator and the operator-chain
//! control path.
//!
//! Job/vertex/attempt identifiers are opaque 128-bit values;
//! [`ModificationId`] is the one 64-bit monotone counter.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

opaque_id!(JobId);
opaque_id!(VertexId);
opaque_id!(TaskManagerId);
opaque_id!(ConnectionId);

/// A specific incarnation of a parallel subtask: vertex × subtask index × attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionAttemptId {
    pub vertex: VertexId,
    pub subtask_index: u32,
    pub attempt: u32,
}

impl fmt::Display for ExecutionAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}.{}",
            self.vertex, self.subtask_index, self.attempt
        )
    }
}

/// Monotonically increasing, globally unique within one coordinator. Starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModificationId(pub u64);

impl fmt::Display for ModificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mod#{}", self.0)
    }
}

/// Issues consecutive [`ModificationId`]s starting at 1, as required by the
/// data model ("started at 1").
#[derive(Debug, Default)]
pub struct ModificationIdGenerator {
    next: u64,
}

impl ModificationIdGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn generate(&mut self) -> ModificationId {
        let id = ModificationId(self.next);
        self.next += 1;
        id
    }
}

/// A worker-resource reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub task_manager_id: TaskManagerId,
    pub location: TaskManagerLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManagerLocation {
    pub host: String,
    pub data_port: u16,
}

/// Action requested of the targets of a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationAction {
    /// Suspend the target subtasks in place.
    Pausing,
    /// Migrate the target subtasks' state to new slots.
    Stopping,
}

/// Runtime state of one [`ExecutionVertex`](crate::topology::ExecutionVertex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Scheduled,
    Deploying,
    Running,
    Pausing,
    Paused,
    Resuming,
    Finished,
    Canceled,
    Failed,
}
