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

//! Error taxonomy for the coordinator.

use thiserror::Error;

use crate::ids::ModificationId;

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Invariant broken inside the coordinator, e.g. an ack for a
    /// discarded-but-present modification. Always fatal.
    #[error("local policy violation for {mod_id}: {reason}")]
    LocalPolicyViolation {
        mod_id: ModificationId,
        reason: String,
    },

    /// A task reported `Decline`. Not retried automatically.
    #[error("modification {mod_id} declined by a participant: {reason}")]
    RemoteParticipantDeclined {
        mod_id: ModificationId,
        reason: String,
    },

    /// No progress within the deadline.
    #[error("modification {mod_id} expired after {elapsed_secs}s without full acknowledgement")]
    Expired {
        mod_id: ModificationId,
        elapsed_secs: u64,
    },

    /// Marker emission was interrupted mid-write.
    #[error("broadcasting marker for {mod_id:?} was interrupted: {source}")]
    IoOnBroadcast {
        mod_id: Option<ModificationId>,
        #[source]
        source: std::io::Error,
    },

    /// Restart-time scheduling failure, e.g. a stale global mod version.
    #[error("scheduling failure while restarting {mod_id}: {reason}")]
    SchedulingFailure {
        mod_id: ModificationId,
        reason: String,
    },

    /// Catch-all for external-collaborator failures (slot allocator,
    /// checkpoint coordinator, network stack).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    /// Whether this error must escalate to `failGlobal` rather than being
    /// absorbed locally and retried on the next satisfying event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::LocalPolicyViolation { .. }
                | CoordinatorError::SchedulingFailure { .. }
        )
    }
}
