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

//! Intake routes the four inbound reply kinds to the registry and triggers
//! the restart engine where the reply might satisfy its guard: one inbound
//! enum, matched exhaustively, each arm doing exactly the bookkeeping its
//! kind implies and nothing more.

use std::sync::Arc;

use modcoord_rpc_client::traits::{ExecutionGraph, SlotProvider, TaskManagerGateway, TaskStateHandles};
use modcoord_rpc_client::wire::InboundReply;
use tracing::{debug, warn};

use crate::registry::{CoordinatorRegistry, ModificationLookup};
use crate::restart::RestartEngine;

pub struct Intake<S, G, E> {
    registry: Arc<CoordinatorRegistry>,
    restart: Arc<RestartEngine<G, E>>,
    slot_provider: Arc<S>,
}

impl<S, G, E> Intake<S, G, E>
where
    S: SlotProvider,
    G: TaskManagerGateway,
    E: ExecutionGraph,
{
    pub fn new(registry: Arc<CoordinatorRegistry>, restart: Arc<RestartEngine<G, E>>, slot_provider: Arc<S>) -> Self {
        Self {
            registry,
            restart,
            slot_provider,
        }
    }

    pub fn restart(&self) -> &Arc<RestartEngine<G, E>> {
        &self.restart
    }

    /// Dispatches one inbound reply. Returns `true` unless the reply is for
    /// a modification this coordinator has never observed.
    pub async fn handle(&self, reply: InboundReply) -> bool {
        match reply {
            InboundReply::Acknowledge(ack) => self.handle_acknowledge(ack.mod_id, ack.attempt_id).await,
            InboundReply::Decline(decline) => {
                self.handle_decline(decline.mod_id, decline.reason).await
            }
            InboundReply::Ignore(ignore) => {
                debug!(mod_id = %ignore.mod_id, attempt = %ignore.attempt_id, "ignore reply received");
                true
            }
            InboundReply::StateMigration(migration) => {
                self.handle_state_migration(
                    migration.attempt_id,
                    TaskStateHandles {
                        attempt: migration.attempt_id,
                        state_blob: migration.subtask_state_blob,
                    },
                )
                .await
            }
        }
    }

    async fn handle_acknowledge(
        &self,
        mod_id: modcoord_common::ids::ModificationId,
        attempt: modcoord_common::ids::ExecutionAttemptId,
    ) -> bool {
        if let Some(outcome) = self.registry.acknowledge_task(mod_id, attempt) {
            use crate::pending::AckOutcome;
            match outcome {
                AckOutcome::Success => {
                    if self.registry.is_awaiting_restart(attempt) {
                        self.restart.restart_if_stopped_and_state_received(attempt).await;
                    }
                }
                AckOutcome::Duplicate => debug!(%mod_id, %attempt, "duplicate acknowledge"),
                AckOutcome::Unknown => warn!(%mod_id, %attempt, "acknowledge for unknown attempt"),
                AckOutcome::Discarded => debug!(%mod_id, %attempt, "acknowledge for terminal modification"),
            }
            return true;
        }

        match self.registry.lookup(mod_id) {
            ModificationLookup::Completed => {
                debug!(%mod_id, %attempt, "late acknowledge for completed modification");
                true
            }
            ModificationLookup::Failed => {
                debug!(%mod_id, %attempt, "late acknowledge for failed modification");
                true
            }
            ModificationLookup::Pending | ModificationLookup::Unknown => {
                warn!(%mod_id, %attempt, "acknowledge for unobserved modification");
                false
            }
        }
    }

    async fn handle_decline(&self, mod_id: modcoord_common::ids::ModificationId, reason: Option<String>) -> bool {
        let reason = reason.unwrap_or_else(|| "no reason given".to_string());
        let Some(released) = self.registry.decline(mod_id, reason) else {
            return false;
        };
        for target in released {
            if let Err(e) = self.slot_provider.release_slot(target.slot).await {
                warn!(%mod_id, error = %e, "failed to release pre-allocated slot after decline");
            }
        }
        true
    }

    async fn handle_state_migration(
        &self,
        attempt: modcoord_common::ids::ExecutionAttemptId,
        state: TaskStateHandles,
    ) -> bool {
        self.registry.insert_stored_state(attempt, state);
        self.restart.restart_if_stopped_and_state_received(attempt).await;
        true
    }
}
