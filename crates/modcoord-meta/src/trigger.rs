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

//! The trigger engine: turns an abstract intent (`pauseAll`, `pauseSingle`,
//! `migrateAllFrom`) into a pending-modification record plus a marker
//! emission to the graph's source vertices. The rest of the graph is reached
//! by data-plane propagation from there, not by direct dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use modcoord_common::error::{CoordinatorError, CoordinatorResult};
use modcoord_common::ids::{ExecutionAttemptId, ModificationAction, ModificationId, TaskManagerId};
use modcoord_common::marker::InputChannelDescriptor;
use modcoord_common::topology::Topology;
use modcoord_rpc_client::traits::{CheckpointIdCounter, SlotProvider, TaskManagerGateway};
use modcoord_rpc_client::wire::TriggerMigration;
use parking_lot::RwLock;
use tracing::info;

use crate::registry::{CoordinatorRegistry, RestartTarget};

/// Below this current checkpoint id, a migration has no anchor to pin to.
const CHECKPOINT_ANCHOR_NONE: i64 = -1;

pub struct TriggerEngine<S, C, G> {
    registry: Arc<CoordinatorRegistry>,
    topology: Arc<RwLock<Topology>>,
    slot_provider: Arc<S>,
    checkpoint_ids: Arc<C>,
    gateway: Arc<G>,
}

impl<S, C, G> TriggerEngine<S, C, G>
where
    S: SlotProvider,
    C: CheckpointIdCounter,
    G: TaskManagerGateway,
{
    pub fn new(
        registry: Arc<CoordinatorRegistry>,
        topology: Arc<RwLock<Topology>>,
        slot_provider: Arc<S>,
        checkpoint_ids: Arc<C>,
        gateway: Arc<G>,
    ) -> Self {
        Self {
            registry,
            topology,
            slot_provider,
            checkpoint_ids,
            gateway,
        }
    }

    /// `pauseAll(operatorName)`: pause every subtask whose vertex name
    /// contains `operator_name`; action = PAUSING.
    pub async fn pause_all(&self, operator_name: &str) -> CoordinatorResult<ModificationId> {
        let _trigger_guard = self.registry.acquire_trigger_lock().await;

        let (acks, subtasks_to_pause) = {
            let topology = self.topology.read();
            let nodes = topology.find_by_name_substring(operator_name);
            let mut acks = HashSet::new();
            let mut subtasks = HashSet::new();
            for node in nodes {
                let vertex = topology.vertex(node);
                for (&subtask_index, &attempt) in &vertex.attempts {
                    acks.insert(attempt);
                    subtasks.insert(subtask_index);
                }
            }
            (acks, subtasks)
        };

        let mod_id = self.registry.create_pending(
            format!("pauseAll({operator_name})"),
            ModificationAction::Pausing,
            acks.clone(),
        );
        info!(%mod_id, operator_name, count = acks.len(), "triggering pauseAll");

        let sources = {
            let topology = self.topology.read();
            source_attempts(&topology)
        };
        for source in sources {
            self.gateway
                .trigger_modification(
                    source,
                    mod_id,
                    now_millis(),
                    acks.clone(),
                    subtasks_to_pause.clone(),
                    ModificationAction::Pausing,
                )
                .await?;
        }
        Ok(mod_id)
    }

    /// `pauseSingle(attemptId)`: pause one subtask; action = STOPPING.
    /// Records the stopped attempt against `vertexToRestart` so the restart
    /// engine can correlate it once state arrives.
    pub async fn pause_single(&self, attempt: ExecutionAttemptId) -> CoordinatorResult<ModificationId> {
        let _trigger_guard = self.registry.acquire_trigger_lock().await;

        let subtask_index = {
            let topology = self.topology.read();
            let node = topology
                .find_node_of_attempt(attempt)
                .ok_or_else(|| CoordinatorError::Internal(anyhow::anyhow!("unknown attempt {attempt}")))?;
            topology
                .vertex(node)
                .subtask_index_of(attempt)
                .ok_or_else(|| CoordinatorError::Internal(anyhow::anyhow!("attempt {attempt} not in vertex")))?
        };

        let mut acks = HashSet::new();
        acks.insert(attempt);
        let mut subtasks = HashSet::new();
        subtasks.insert(subtask_index);

        let mod_id = self.registry.create_pending(
            format!("pauseSingle({attempt})"),
            ModificationAction::Stopping,
            acks.clone(),
        );

        // The eventual restart needs a slot; pre-allocate against the
        // attempt's current host so it can be reassembled once PAUSED.
        let current_tm = {
            let topology = self.topology.read();
            let node = topology.find_node_of_attempt(attempt).unwrap();
            topology.vertex(node).assigned_slot.get(&subtask_index).copied()
        };
        if let Some(tm) = current_tm {
            let slot = self.slot_provider.allocate_slot_except(tm).await?;
            self.registry
                .register_restart_target(attempt, RestartTarget { mod_id, slot });
        }

        info!(%mod_id, %attempt, "triggering pauseSingle");
        let sources = {
            let topology = self.topology.read();
            source_attempts(&topology)
        };
        for source in sources {
            self.gateway
                .trigger_modification(
                    source,
                    mod_id,
                    now_millis(),
                    acks.clone(),
                    subtasks.clone(),
                    ModificationAction::Stopping,
                )
                .await?;
        }
        Ok(mod_id)
    }

    /// `migrateAllFrom(tm)`: for every subtask hosted on `tm`, pre-allocate a
    /// replacement slot, compute spill/stop maps, and emit a StartMigration
    /// marker through the sources.
    pub async fn migrate_all_from(&self, tm: TaskManagerId) -> CoordinatorResult<ModificationId> {
        let _trigger_guard = self.registry.acquire_trigger_lock().await;

        let migrating = {
            let topology = self.topology.read();
            topology.node_hosting(tm)
        };
        if migrating.is_empty() {
            return Err(CoordinatorError::Internal(anyhow::anyhow!(
                "no subtasks hosted on {tm}"
            )));
        }

        let mut stop_map: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>> = HashMap::new();
        let mut spill_map: HashMap<ExecutionAttemptId, HashSet<u32>> = HashMap::new();
        let mut acks = HashSet::new();

        {
            let topology = self.topology.read();
            for &(node, subtask_index) in &migrating {
                let vertex = topology.vertex(node);
                let Some(attempt) = vertex.attempt_of(subtask_index) else {
                    continue;
                };
                acks.insert(attempt);

                for &upstream_node in topology.upstream_of(node) {
                    let upstream = topology.vertex(upstream_node);
                    for &upstream_attempt in upstream.attempts.values() {
                        spill_map.entry(upstream_attempt).or_default().insert(subtask_index);
                    }
                }

                for &downstream_node in topology.downstream_of(node) {
                    let downstream = topology.vertex(downstream_node);
                    let descriptors = stop_map.entry(attempt).or_default();
                    for _ in downstream.attempts.values() {
                        descriptors.push(InputChannelDescriptor {
                            result_partition_id: uuid::Uuid::new_v4(),
                            location: modcoord_common::marker::ChannelLocation::Unknown,
                        });
                    }
                }
            }
        }

        // A vertex that is itself migrating is never also counted as a
        // spiller.
        for key in stop_map.keys() {
            spill_map.remove(key);
        }

        let mod_id = self.registry.create_pending(
            format!("migrateAllFrom({tm})"),
            ModificationAction::Stopping,
            acks,
        );

        for &(node, subtask_index) in &migrating {
            let current_tm = {
                let topology = self.topology.read();
                let vertex = topology.vertex(node);
                vertex.assigned_slot.get(&subtask_index).copied()
            };
            let Some(current_tm) = current_tm else { continue };
            let slot = self.slot_provider.allocate_slot_except(current_tm).await?;
            let topology = self.topology.read();
            if let Some(attempt) = topology.vertex(node).attempt_of(subtask_index) {
                drop(topology);
                self.registry
                    .register_restart_target(attempt, RestartTarget { mod_id, slot });
            }
        }

        let upcoming_checkpoint_id = self.anchor_checkpoint().await?;

        info!(
            %mod_id,
            %tm,
            migrating = migrating.len(),
            upcoming_checkpoint_id,
            "triggering migrateAllFrom"
        );

        let (job_id, sources) = {
            let topology = self.topology.read();
            (self.registry.job_id(), source_attempts(&topology))
        };
        for source in sources {
            self.gateway
                .trigger_migration(TriggerMigration {
                    job_id,
                    attempt_id: source,
                    mod_id,
                    timestamp: now_millis(),
                    spill_map: spill_map.clone(),
                    stop_map: stop_map.clone(),
                    upcoming_checkpoint_id,
                })
                .await?;
        }
        Ok(mod_id)
    }

    /// `upcomingCheckpointId = current + 2` if the counter reports a current
    /// id `>= checkpoint_anchor_floor` (2 by default); otherwise `-1`.
    async fn anchor_checkpoint(&self) -> CoordinatorResult<i64> {
        let current = self.checkpoint_ids.current().await?;
        let config = self.registry.config();
        if current >= config.checkpoint_anchor_floor {
            Ok((current + config.checkpoint_lookahead) as i64)
        } else {
            Ok(CHECKPOINT_ANCHOR_NONE)
        }
    }
}

/// Every attempt of every source vertex (single-source jobs have exactly
/// one), the only tasks a marker is ever delivered to directly.
fn source_attempts(topology: &Topology) -> Vec<ExecutionAttemptId> {
    topology
        .sources()
        .flat_map(|idx| topology.vertex(idx).attempts.values().copied())
        .collect()
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modcoord_common::ids::{ExecutionState, VertexId};
    use modcoord_common::topology::{ExecutionVertex, NodeIndex};
    use modcoord_rpc_client::fakes::{
        FakeCheckpointIdCounter, FakeSlotProvider, FakeTaskManagerGateway, RecordedCall,
    };

    fn tm(n: u8) -> TaskManagerId {
        TaskManagerId(uuid::Uuid::from_u128(n as u128))
    }

    fn build_source_map_sink(host_map_on: TaskManagerId) -> Topology {
        let mut topology = Topology::new();
        let mut source = ExecutionVertex {
            vertex_id: VertexId::new(),
            name: "source".to_string(),
            parallelism: 1,
            attempts: HashMap::new(),
            assigned_slot: HashMap::new(),
            state: HashMap::new(),
        };
        let source_attempt = ExecutionAttemptId {
            vertex: source.vertex_id,
            subtask_index: 0,
            attempt: 0,
        };
        source.attempts.insert(0, source_attempt);
        source.assigned_slot.insert(0, tm(9));
        source.state.insert(0, ExecutionState::Running);
        let source_idx = topology.add_vertex(source);

        let mut map = ExecutionVertex {
            vertex_id: VertexId::new(),
            name: "map".to_string(),
            parallelism: 1,
            attempts: HashMap::new(),
            assigned_slot: HashMap::new(),
            state: HashMap::new(),
        };
        let map_attempt = ExecutionAttemptId {
            vertex: map.vertex_id,
            subtask_index: 0,
            attempt: 0,
        };
        map.attempts.insert(0, map_attempt);
        map.assigned_slot.insert(0, host_map_on);
        map.state.insert(0, ExecutionState::Running);
        let map_idx = topology.add_vertex(map);

        let mut sink = ExecutionVertex {
            vertex_id: VertexId::new(),
            name: "sink".to_string(),
            parallelism: 1,
            attempts: HashMap::new(),
            assigned_slot: HashMap::new(),
            state: HashMap::new(),
        };
        let sink_attempt = ExecutionAttemptId {
            vertex: sink.vertex_id,
            subtask_index: 0,
            attempt: 0,
        };
        sink.attempts.insert(0, sink_attempt);
        sink.assigned_slot.insert(0, tm(9));
        sink.state.insert(0, ExecutionState::Running);
        let sink_idx = topology.add_vertex(sink);

        topology.connect(source_idx, map_idx);
        topology.connect(map_idx, sink_idx);
        topology
    }

    fn engine(
        topology: Topology,
    ) -> TriggerEngine<FakeSlotProvider, FakeCheckpointIdCounter, FakeTaskManagerGateway> {
        let registry = crate::registry::test_registry(std::time::Duration::from_secs(90));
        TriggerEngine::new(
            registry,
            Arc::new(RwLock::new(topology)),
            Arc::new(FakeSlotProvider::new(vec![tm(9), tm(10)])),
            Arc::new(FakeCheckpointIdCounter::new(0)),
            Arc::new(FakeTaskManagerGateway::default()),
        )
    }

    #[tokio::test]
    async fn pause_all_matches_by_substring() {
        let topology = build_source_map_sink(tm(1));
        let source_attempt = topology.vertex(NodeIndex(0)).attempt_of(0).unwrap();
        let e = engine(topology);
        let mod_id = e.pause_all("map").await.unwrap();
        assert_eq!(e.registry.pending_count(), 1);
        let calls = e.gateway.calls.lock().unwrap();
        assert!(matches!(calls[0], RecordedCall::TriggerModification(source, id) if source == source_attempt && id == mod_id));
    }

    #[tokio::test]
    async fn migrate_all_from_computes_spill_and_stop_maps() {
        let topology = build_source_map_sink(tm(1));
        let source_attempt = topology.vertex(NodeIndex(0)).attempt_of(0).unwrap();
        let e = engine(topology);
        let mod_id = e.migrate_all_from(tm(1)).await.unwrap();
        assert_eq!(e.registry.pending_count(), 1);
        let calls = e.gateway.calls.lock().unwrap();
        assert!(matches!(calls[0], RecordedCall::TriggerMigration(source, id, _) if source == source_attempt && id == mod_id));
    }

    #[tokio::test]
    async fn checkpoint_anchor_below_floor_is_none() {
        let topology = build_source_map_sink(tm(1));
        let e = engine(topology);
        assert_eq!(e.anchor_checkpoint().await.unwrap(), CHECKPOINT_ANCHOR_NONE);
    }

    #[tokio::test]
    async fn checkpoint_anchor_above_floor_adds_lookahead() {
        let topology = build_source_map_sink(tm(1));
        let e = TriggerEngine::new(
            crate::registry::test_registry(std::time::Duration::from_secs(90)),
            Arc::new(RwLock::new(topology)),
            Arc::new(FakeSlotProvider::new(vec![tm(9), tm(10)])),
            Arc::new(FakeCheckpointIdCounter::new(5)),
            Arc::new(FakeTaskManagerGateway::default()),
        );
        assert_eq!(e.anchor_checkpoint().await.unwrap(), 7);
    }
}
