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

//! The live-modification coordinator: pending-modification bookkeeping,
//! the trigger/intake/restart engines, and the configuration and metrics
//! that wrap them.

pub mod config;
pub mod intake;
pub mod metrics;
pub mod pending;
pub mod registry;
pub mod restart;
pub mod trigger;

use std::sync::Arc;

use modcoord_common::ids::{ExecutionAttemptId, JobId, ModificationId, TaskManagerId};
use modcoord_common::topology::{NodeIndex, Topology};
use modcoord_common::error::CoordinatorResult;
use modcoord_rpc_client::traits::{CheckpointIdCounter, ExecutionGraph, SlotProvider, TaskManagerGateway};
use modcoord_rpc_client::wire::InboundReply;
use parking_lot::RwLock;
use prometheus::Registry;

use config::CoordinatorConfig;
use intake::Intake;
use metrics::CoordinatorMetrics;
use registry::CoordinatorRegistry;
use restart::RestartEngine;
use trigger::TriggerEngine;

/// Ties the engines together behind the operations an external orchestrator
/// calls. Generic over the four external collaborators so production code
/// and tests can plug in concrete or fake implementations interchangeably.
pub struct Coordinator<S, C, G, E> {
    registry: Arc<CoordinatorRegistry>,
    topology: Arc<RwLock<Topology>>,
    trigger: TriggerEngine<S, C, G>,
    intake: Intake<S, G, E>,
}

impl<S, C, G, E> Coordinator<S, C, G, E>
where
    S: SlotProvider,
    C: CheckpointIdCounter,
    G: TaskManagerGateway,
    E: ExecutionGraph,
{
    pub fn new(
        job_id: JobId,
        topology: Topology,
        config: CoordinatorConfig,
        metrics_registry: &Registry,
        slot_provider: Arc<S>,
        checkpoint_ids: Arc<C>,
        gateway: Arc<G>,
        execution_graph: Arc<E>,
    ) -> Self {
        let metrics = Arc::new(CoordinatorMetrics::new(metrics_registry));
        let registry = CoordinatorRegistry::new(job_id, config, metrics.clone());
        let topology = Arc::new(RwLock::new(topology));

        let trigger = TriggerEngine::new(
            registry.clone(),
            topology.clone(),
            slot_provider.clone(),
            checkpoint_ids,
            gateway.clone(),
        );
        let restart = Arc::new(RestartEngine::new(
            registry.clone(),
            topology.clone(),
            gateway,
            execution_graph,
            metrics,
        ));
        let intake = Intake::new(registry.clone(), restart, slot_provider);

        Self {
            registry,
            topology,
            trigger,
            intake,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.registry.job_id()
    }

    pub fn registry(&self) -> &Arc<CoordinatorRegistry> {
        &self.registry
    }

    pub fn topology(&self) -> &Arc<RwLock<Topology>> {
        &self.topology
    }

    pub async fn pause_all(&self, operator_name: &str) -> CoordinatorResult<ModificationId> {
        self.trigger.pause_all(operator_name).await
    }

    pub async fn pause_single(&self, attempt: ExecutionAttemptId) -> CoordinatorResult<ModificationId> {
        self.trigger.pause_single(attempt).await
    }

    pub async fn migrate_all_from(&self, tm: TaskManagerId) -> CoordinatorResult<ModificationId> {
        self.trigger.migrate_all_from(tm).await
    }

    /// `CancelModification`: transitions an open record to DISCARDED.
    /// Emission of the corresponding marker is the caller's responsibility
    /// (it goes through the operator-chain control path, not the
    /// coordinator's RPC surface).
    pub fn cancel_modification(&self, mod_id: ModificationId) -> bool {
        self.registry.discard(mod_id)
    }

    /// Dispatches one inbound reply. Returns `true` unless the reply is for
    /// a modification this coordinator has never observed.
    pub async fn handle_reply(&self, reply: InboundReply) -> bool {
        self.intake.handle(reply).await
    }

    pub async fn create_and_insert_operator(
        &self,
        upstream_name: &str,
        name: String,
        parallelism: u32,
    ) -> CoordinatorResult<NodeIndex> {
        self.intake_restart().create_and_insert_operator(upstream_name, name, parallelism).await
    }

    pub async fn consume_new_producer(
        &self,
        consumer_attempt: ExecutionAttemptId,
        new_producer_attempt: ExecutionAttemptId,
        new_producer_location: modcoord_common::ids::TaskManagerLocation,
        connection_idx: u32,
        index: u32,
    ) -> CoordinatorResult<()> {
        self.intake_restart()
            .consume_new_producer(
                consumer_attempt,
                new_producer_attempt,
                new_producer_location,
                connection_idx,
                index,
            )
            .await
    }

    fn intake_restart(&self) -> &Arc<RestartEngine<G, E>> {
        self.intake.restart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modcoord_common::ids::{ExecutionState, TaskManagerLocation, VertexId};
    use modcoord_common::topology::ExecutionVertex;
    use modcoord_rpc_client::fakes::{
        FakeCheckpointIdCounter, FakeExecutionGraph, FakeSlotProvider, FakeTaskManagerGateway, RecordedCall,
    };
    use modcoord_rpc_client::wire::{Acknowledge, Decline, InboundReply, StateMigration};
    use crate::registry::ModificationLookup;

    fn tm(n: u8) -> TaskManagerId {
        TaskManagerId(uuid::Uuid::from_u128(n as u128))
    }

    fn vertex(name: &str, parallelism: u32, host: TaskManagerId) -> ExecutionVertex {
        let mut v = ExecutionVertex {
            vertex_id: VertexId::new(),
            name: name.to_string(),
            parallelism,
            attempts: Default::default(),
            assigned_slot: Default::default(),
            state: Default::default(),
        };
        for subtask_index in 0..parallelism {
            let attempt = ExecutionAttemptId {
                vertex: v.vertex_id,
                subtask_index,
                attempt: 0,
            };
            v.attempts.insert(subtask_index, attempt);
            v.assigned_slot.insert(subtask_index, host);
            v.state.insert(subtask_index, ExecutionState::Running);
        }
        v
    }

    type TestCoordinator =
        Coordinator<FakeSlotProvider, FakeCheckpointIdCounter, FakeTaskManagerGateway, FakeExecutionGraph>;

    fn coordinator_with(topology: Topology, checkpoint_current: u64, pool: Vec<TaskManagerId>) -> TestCoordinator {
        Coordinator::new(
            JobId::new(),
            topology,
            CoordinatorConfig::default(),
            &Registry::new(),
            Arc::new(FakeSlotProvider::new(pool)),
            Arc::new(FakeCheckpointIdCounter::new(checkpoint_current)),
            Arc::new(FakeTaskManagerGateway::default()),
            Arc::new(FakeExecutionGraph::new(JobId::new())),
        )
    }

    fn ack(coordinator: &TestCoordinator, mod_id: ModificationId, attempt_id: ExecutionAttemptId) -> InboundReply {
        InboundReply::Acknowledge(Acknowledge {
            job_id: coordinator.job_id(),
            attempt_id,
            mod_id,
        })
    }

    /// Scenario 1: source -> map(parallelism=2) -> sink; `pauseSingle` on
    /// map's subtask 0 moves the modification straight to `completed` once
    /// that one subtask acknowledges, leaving the rest of the graph alone.
    #[tokio::test]
    async fn scenario_1_single_task_pause() {
        let mut topology = Topology::new();
        let source_idx = topology.add_vertex(vertex("source", 1, tm(9)));
        let map_idx = topology.add_vertex(vertex("map", 2, tm(1)));
        let sink_idx = topology.add_vertex(vertex("sink", 1, tm(9)));
        topology.connect(source_idx, map_idx);
        topology.connect(map_idx, sink_idx);
        let map_0 = topology.vertex(map_idx).attempt_of(0).unwrap();

        let coordinator = coordinator_with(topology, 0, vec![tm(9), tm(10)]);
        let mod_id = coordinator.pause_single(map_0).await.unwrap();

        assert_eq!(coordinator.registry().pending_count(), 1);
        assert!(coordinator.handle_reply(ack(&coordinator, mod_id, map_0)).await);

        assert_eq!(coordinator.registry().completed_count(), 1);
        assert_eq!(coordinator.registry().pending_count(), 0);
        assert_eq!(coordinator.registry().lookup(mod_id), ModificationLookup::Completed);
    }

    /// Scenario 2: two subtasks hosted on tmA migrate to tmB. After both
    /// acknowledge the migration intent, pause, and report StateMigration,
    /// the restart engine redeploys each onto its pre-allocated slot.
    #[tokio::test]
    async fn scenario_2_migrate_all_from_tma() {
        let tm_a = tm(1);
        let tm_b = tm(2);
        let mut topology = Topology::new();
        let source_idx = topology.add_vertex(vertex("source", 1, tm_a));
        let map_idx = topology.add_vertex(vertex("map", 2, tm_a));
        let sink_idx = topology.add_vertex(vertex("sink", 1, tm(9)));
        topology.connect(source_idx, map_idx);
        topology.connect(map_idx, sink_idx);
        let map_0 = topology.vertex(map_idx).attempt_of(0).unwrap();
        let map_1 = topology.vertex(map_idx).attempt_of(1).unwrap();

        let coordinator = coordinator_with(topology, 0, vec![tm_b]);
        let mod_id = coordinator.migrate_all_from(tm_a).await.unwrap();
        assert_eq!(coordinator.registry().pending_count(), 1);
        assert!(coordinator.registry().is_awaiting_restart(map_0));
        assert!(coordinator.registry().is_awaiting_restart(map_1));

        // Both migrating subtasks acknowledge the StartMigration intent.
        assert!(coordinator.handle_reply(ack(&coordinator, mod_id, map_0)).await);
        assert!(coordinator.handle_reply(ack(&coordinator, mod_id, map_1)).await);
        assert_eq!(coordinator.registry().completed_count(), 1);

        // Once paused and their state has arrived, each redeploys on tmB.
        {
            let mut topology = coordinator.topology().write();
            let map_vertex = topology.vertex_mut(map_idx);
            map_vertex.state.insert(0, ExecutionState::Paused);
            map_vertex.state.insert(1, ExecutionState::Paused);
        }
        assert!(
            coordinator
                .handle_reply(InboundReply::StateMigration(StateMigration {
                    job_id: coordinator.job_id(),
                    attempt_id: map_0,
                    mod_id,
                    subtask_state_blob: vec![1],
                }))
                .await
        );
        assert!(
            coordinator
                .handle_reply(InboundReply::StateMigration(StateMigration {
                    job_id: coordinator.job_id(),
                    attempt_id: map_1,
                    mod_id,
                    subtask_state_blob: vec![2],
                }))
                .await
        );

        assert!(!coordinator.registry().is_awaiting_restart(map_0));
        assert!(!coordinator.registry().is_awaiting_restart(map_1));
    }

    /// Scenario 3: `pauseAll("map")` with one acknowledge suppressed expires
    /// after the deadline; a late acknowledge at 120s still returns `true`
    /// because the modId is in `failed` (Decision D1).
    #[tokio::test(start_paused = true)]
    async fn scenario_3_expiry_then_late_acknowledge() {
        let mut topology = Topology::new();
        let map_idx = topology.add_vertex(vertex("map", 2, tm(1)));
        let map_0 = topology.vertex(map_idx).attempt_of(0).unwrap();
        let map_1 = topology.vertex(map_idx).attempt_of(1).unwrap();

        let coordinator = Coordinator::new(
            JobId::new(),
            topology,
            CoordinatorConfig::default(),
            &Registry::new(),
            Arc::new(FakeSlotProvider::new(vec![tm(9)])),
            Arc::new(FakeCheckpointIdCounter::new(0)),
            Arc::new(FakeTaskManagerGateway::default()),
            Arc::new(FakeExecutionGraph::new(JobId::new())),
        );

        let mod_id = coordinator.pause_all("map").await.unwrap();
        // map-1 acknowledges; map-0's acknowledge is suppressed.
        assert!(coordinator.handle_reply(ack(&coordinator, mod_id, map_1)).await);
        assert_eq!(coordinator.registry().pending_count(), 1);

        tokio::time::advance(std::time::Duration::from_secs(91)).await;
        tokio::task::yield_now().await;

        assert_eq!(coordinator.registry().pending_count(), 0);
        assert_eq!(coordinator.registry().lookup(mod_id), ModificationLookup::Failed);

        tokio::time::advance(std::time::Duration::from_secs(30)).await;
        // Late acknowledge from map-0 at the ~120s mark: known, so `true`.
        assert!(coordinator.handle_reply(ack(&coordinator, mod_id, map_0)).await);
        assert_eq!(coordinator.registry().completed_count(), 0);
    }

    /// Scenario 4: one task declines; the modification moves straight to
    /// `failed` (DECLINED) and the remaining task's acknowledge is a no-op.
    #[tokio::test]
    async fn scenario_4_decline() {
        let mut topology = Topology::new();
        let map_idx = topology.add_vertex(vertex("map", 2, tm(1)));
        let map_0 = topology.vertex(map_idx).attempt_of(0).unwrap();
        let map_1 = topology.vertex(map_idx).attempt_of(1).unwrap();

        let coordinator = coordinator_with(topology, 0, vec![tm(9)]);
        let mod_id = coordinator.pause_all("map").await.unwrap();

        assert!(
            coordinator
                .handle_reply(InboundReply::Decline(Decline {
                    job_id: coordinator.job_id(),
                    attempt_id: map_0,
                    mod_id,
                    reason: Some("rejected".to_string()),
                }))
                .await
        );
        assert_eq!(coordinator.registry().failed_count(), 1);
        assert_eq!(coordinator.registry().lookup(mod_id), ModificationLookup::Failed);

        // The remaining task's acknowledge arrives after the decline: known
        // modId, no effect on `completed`.
        assert!(coordinator.handle_reply(ack(&coordinator, mod_id, map_1)).await);
        assert_eq!(coordinator.registry().completed_count(), 0);
    }

    /// Scenario 5 (rescale): `consumeNewProducer` rewires a downstream
    /// consumer to a freshly-scheduled producer subtask without a redeploy.
    #[tokio::test]
    async fn scenario_5_rescale_consume_new_producer() {
        let mut topology = Topology::new();
        let filter_idx = topology.add_vertex(vertex("filter", 2, tm(1)));
        let sink_idx = topology.add_vertex(vertex("sink", 1, tm(9)));
        topology.connect(filter_idx, sink_idx);
        let sink_0 = topology.vertex(sink_idx).attempt_of(0).unwrap();

        let gateway = Arc::new(FakeTaskManagerGateway::default());
        let coordinator = Coordinator::new(
            JobId::new(),
            topology,
            CoordinatorConfig::default(),
            &Registry::new(),
            Arc::new(FakeSlotProvider::new(vec![tm(9)])),
            Arc::new(FakeCheckpointIdCounter::new(0)),
            gateway.clone(),
            Arc::new(FakeExecutionGraph::new(JobId::new())),
        );
        let new_filter_subtask = ExecutionAttemptId {
            vertex: VertexId::new(),
            subtask_index: 2,
            attempt: 0,
        };

        coordinator
            .consume_new_producer(
                sink_0,
                new_filter_subtask,
                TaskManagerLocation {
                    host: "tm-new".to_string(),
                    data_port: 0,
                },
                2,
                2,
            )
            .await
            .unwrap();

        let calls = gateway.calls.lock().unwrap();
        assert!(matches!(
            calls[0],
            RecordedCall::ConsumeNewProducer(a, b) if a == sink_0 && b == new_filter_subtask
        ));
    }

    /// Scenario 6: with `currentCheckpointId=5` and the default lookahead of
    /// 2, `migrateAllFrom` carries `upcomingCheckpointId=7`.
    #[tokio::test]
    async fn scenario_6_checkpoint_anchored_migration() {
        let tm_a = tm(1);
        let mut topology = Topology::new();
        topology.add_vertex(vertex("map", 1, tm_a));

        let gateway = Arc::new(FakeTaskManagerGateway::default());
        let coordinator = Coordinator::new(
            JobId::new(),
            topology,
            CoordinatorConfig::default(),
            &Registry::new(),
            Arc::new(FakeSlotProvider::new(vec![tm(2)])),
            Arc::new(FakeCheckpointIdCounter::new(5)),
            gateway.clone(),
            Arc::new(FakeExecutionGraph::new(JobId::new())),
        );

        let _mod_id = coordinator.migrate_all_from(tm_a).await.unwrap();

        let calls = gateway.calls.lock().unwrap();
        assert!(matches!(calls[0], RecordedCall::TriggerMigration(_, _, upcoming) if upcoming == 7));
    }
}
