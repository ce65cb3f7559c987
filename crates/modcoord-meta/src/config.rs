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

//! Coordinator configuration: a small `serde`-deserializable options struct
//! with sensible defaults, merged with environment overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deadline for a [`crate::pending::PendingModification`] to collect every
/// acknowledgement before it expires.
pub const DEFAULT_MODIFICATION_DEADLINE: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a pending modification waits for full acknowledgement
    /// before transitioning to `EXPIRED`.
    pub modification_deadline_secs: u64,

    /// Checkpoint lookahead used to anchor a migration: the marker carries
    /// `current + checkpoint_lookahead` when the counter reports a current
    /// id `>= checkpoint_anchor_floor`, otherwise `-1`.
    pub checkpoint_lookahead: u64,

    pub checkpoint_anchor_floor: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            modification_deadline_secs: DEFAULT_MODIFICATION_DEADLINE.as_secs(),
            checkpoint_lookahead: 2,
            checkpoint_anchor_floor: 2,
        }
    }
}

impl CoordinatorConfig {
    pub fn modification_deadline(&self) -> Duration {
        Duration::from_secs(self.modification_deadline_secs)
    }

    /// Overlay environment variables (`MODCOORD_*`) on top of defaults.
    /// Unset or unparsable variables are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("MODCOORD_MODIFICATION_DEADLINE_SECS") {
            if let Ok(parsed) = v.parse() {
                config.modification_deadline_secs = parsed;
            }
        }
        if let Ok(v) = std::env::var("MODCOORD_CHECKPOINT_LOOKAHEAD") {
            if let Ok(parsed) = v.parse() {
                config.checkpoint_lookahead = parsed;
            }
        }
        config
    }
}
