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

//! Wire messages exchanged between a task's control-path sender and the
//! coordinator's intake. Framing (length-prefixing, versioning) is the
//! network stack's concern, so these are plain, `serde`-derived payloads;
//! the transport wraps them however it wraps any other RPC to the
//! coordinator.

use modcoord_common::ids::{ExecutionAttemptId, JobId, ModificationId};
use modcoord_common::marker::InputChannelDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const WIRE_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledge {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub mod_id: ModificationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decline {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub mod_id: ModificationId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ignore {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub mod_id: ModificationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMigration {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub mod_id: ModificationId,
    pub subtask_state_blob: Vec<u8>,
}

/// Addressed to one source attempt; `attempt_id` names which one. The
/// trigger engine sends one of these per source vertex attempt in the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerMigration {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub mod_id: ModificationId,
    pub timestamp: i64,
    pub spill_map: HashMap<ExecutionAttemptId, HashSet<u32>>,
    pub stop_map: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>>,
    pub upcoming_checkpoint_id: i64,
}

/// Tagged union of the four inbound reply kinds intake dispatches on, with
/// exhaustive handling at each call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundReply {
    Acknowledge(Acknowledge),
    Decline(Decline),
    Ignore(Ignore),
    StateMigration(StateMigration),
}

impl InboundReply {
    pub fn mod_id(&self) -> ModificationId {
        match self {
            InboundReply::Acknowledge(m) => m.mod_id,
            InboundReply::Decline(m) => m.mod_id,
            InboundReply::Ignore(m) => m.mod_id,
            InboundReply::StateMigration(m) => m.mod_id,
        }
    }

    pub fn attempt_id(&self) -> ExecutionAttemptId {
        match self {
            InboundReply::Acknowledge(m) => m.attempt_id,
            InboundReply::Decline(m) => m.attempt_id,
            InboundReply::Ignore(m) => m.attempt_id,
            InboundReply::StateMigration(m) => m.attempt_id,
        }
    }
}

