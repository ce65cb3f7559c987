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

//! The restart engine: redeploys paused/migrated subtasks once both their
//! stored state and their restart target are present, and supports the
//! rescale-time topology edits (`createAndInsertOperator`,
//! `consumeNewProducer`). Waits for everything a restart needs, then
//! reschedules atomically; a fatal failure escalates to failing the whole
//! job rather than attempting partial repair.

use std::sync::Arc;
use std::time::Instant;

use modcoord_common::error::CoordinatorResult;
use modcoord_common::ids::{ExecutionAttemptId, ExecutionState, TaskManagerLocation};
use modcoord_common::marker::InputChannelDescriptor;
use modcoord_common::topology::{ExecutionVertex, NodeIndex, Topology};
use modcoord_rpc_client::traits::{ExecutionGraph, TaskManagerGateway, TaskStateHandles};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::metrics::CoordinatorMetrics;
use crate::registry::CoordinatorRegistry;

pub struct RestartEngine<G, E> {
    registry: Arc<CoordinatorRegistry>,
    topology: Arc<RwLock<Topology>>,
    gateway: Arc<G>,
    execution_graph: Arc<E>,
    metrics: Arc<CoordinatorMetrics>,
}

impl<G, E> RestartEngine<G, E>
where
    G: TaskManagerGateway,
    E: ExecutionGraph,
{
    pub fn new(
        registry: Arc<CoordinatorRegistry>,
        topology: Arc<RwLock<Topology>>,
        gateway: Arc<G>,
        execution_graph: Arc<E>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            registry,
            topology,
            gateway,
            execution_graph,
            metrics,
        }
    }

    /// Fires exactly when all three conditions hold: `attempt` is awaiting
    /// restart, its state has arrived, and the vertex's execution state is
    /// `PAUSED`. A caller typically invokes this after acknowledging a task
    /// or storing migrated state, since either event might complete the
    /// guard.
    pub async fn restart_if_stopped_and_state_received(&self, attempt: ExecutionAttemptId) {
        let started = Instant::now();

        if !self.vertex_is_paused(attempt) {
            return;
        }

        let Some((target, state)) = self.registry.take_restart_pair(attempt) else {
            return;
        };

        if let Err(e) = self.do_restart(attempt, target.slot.clone(), state.clone()).await {
            self.registry.put_back_restart_pair(attempt, target, state);
            if e.is_fatal() {
                error!(%attempt, error = %e, "restart failed, failing job globally");
                self.execution_graph.fail_global(anyhow::anyhow!(e.to_string())).await;
            } else {
                warn!(%attempt, error = %e, "restart failed, will retry on the next satisfying event");
            }
            return;
        }

        self.metrics
            .restart_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        info!(%attempt, "restarted with migrated state");
    }

    fn vertex_is_paused(&self, attempt: ExecutionAttemptId) -> bool {
        let topology = self.topology.read();
        let Some(node) = topology.find_node_of_attempt(attempt) else {
            return false;
        };
        let vertex = topology.vertex(node);
        let Some(subtask_index) = vertex.subtask_index_of(attempt) else {
            return false;
        };
        vertex.state.get(&subtask_index) == Some(&ExecutionState::Paused)
    }

    async fn do_restart(
        &self,
        attempt: ExecutionAttemptId,
        slot: modcoord_common::ids::Slot,
        state: TaskStateHandles,
    ) -> CoordinatorResult<()> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let expected_version = self.execution_graph.global_mod_version();

        self.execution_graph
            .reset_for_new_execution_migration(attempt, now, expected_version)
            .await?;
        self.execution_graph
            .schedule_for_migration(attempt, slot.clone(), state.clone())
            .await?;
        self.gateway.deploy(attempt, slot, Some(state)).await?;

        let mut topology = self.topology.write();
        if let Some(node) = topology.find_node_of_attempt(attempt) {
            let vertex = topology.vertex_mut(node);
            if let Some(subtask_index) = vertex.subtask_index_of(attempt) {
                vertex.state.insert(subtask_index, ExecutionState::Running);
            }
        }
        Ok(())
    }

    /// `createAndInsertOperator(name, parallelism)`: wires a new logical
    /// vertex between a named source and its downstream consumer, re-wiring
    /// the downstream's input set (ALL_TO_ALL) and scheduling each new
    /// subtask.
    pub async fn create_and_insert_operator(
        &self,
        upstream_name: &str,
        name: String,
        parallelism: u32,
    ) -> CoordinatorResult<NodeIndex> {
        let (upstream_idx, downstream_idx) = {
            let topology = self.topology.read();
            let matches = topology.find_by_name_substring(upstream_name);
            let upstream_idx = *matches.first().ok_or_else(|| {
                modcoord_common::error::CoordinatorError::Internal(anyhow::anyhow!(
                    "no vertex matching '{upstream_name}'"
                ))
            })?;
            let downstream_idx = *topology
                .downstream_of(upstream_idx)
                .first()
                .ok_or_else(|| {
                    modcoord_common::error::CoordinatorError::Internal(anyhow::anyhow!(
                        "'{upstream_name}' has no downstream consumer"
                    ))
                })?;
            (upstream_idx, downstream_idx)
        };

        self.execution_graph
            .schedule_new_vertex(upstream_idx, downstream_idx, parallelism)
            .await?;

        let new_idx = {
            let mut topology = self.topology.write();
            let mut vertex = ExecutionVertex {
                vertex_id: modcoord_common::ids::VertexId::new(),
                name,
                parallelism,
                attempts: Default::default(),
                assigned_slot: Default::default(),
                state: Default::default(),
            };
            for subtask_index in 0..parallelism {
                let attempt = ExecutionAttemptId {
                    vertex: vertex.vertex_id,
                    subtask_index,
                    attempt: 0,
                };
                vertex.attempts.insert(subtask_index, attempt);
                vertex.state.insert(subtask_index, ExecutionState::Scheduled);
            }
            let idx = topology.add_vertex(vertex);
            topology.connect(upstream_idx, idx);
            topology.connect(idx, downstream_idx);
            idx
        };

        info!(?new_idx, "inserted new operator into topology");
        Ok(new_idx)
    }

    /// `consumeNewProducer`: rewires one input channel of a consumer subtask
    /// to a new upstream partition without a full redeploy.
    pub async fn consume_new_producer(
        &self,
        consumer_attempt: ExecutionAttemptId,
        new_producer_attempt: ExecutionAttemptId,
        new_producer_location: TaskManagerLocation,
        connection_idx: u32,
        index: u32,
    ) -> CoordinatorResult<()> {
        let descriptor = InputChannelDescriptor {
            result_partition_id: uuid::Uuid::new_v4(),
            location: modcoord_common::marker::ChannelLocation::Remote(
                modcoord_common::ids::ConnectionId::from(uuid::Uuid::from_u128(connection_idx as u128)),
            ),
        };
        let _ = new_producer_location;
        self.gateway
            .consume_new_producer(consumer_attempt, new_producer_attempt, descriptor, index)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modcoord_common::ids::{JobId, ModificationId, TaskManagerLocation, VertexId};
    use modcoord_rpc_client::fakes::{FakeExecutionGraph, FakeTaskManagerGateway, RecordedCall};

    fn tm(n: u8) -> modcoord_common::ids::TaskManagerId {
        modcoord_common::ids::TaskManagerId(uuid::Uuid::from_u128(n as u128))
    }

    fn single_vertex_topology(name: &str, state: ExecutionState) -> (Topology, ExecutionAttemptId) {
        let mut topology = Topology::new();
        let mut vertex = ExecutionVertex {
            vertex_id: modcoord_common::ids::VertexId::new(),
            name: name.to_string(),
            parallelism: 1,
            attempts: Default::default(),
            assigned_slot: Default::default(),
            state: Default::default(),
        };
        let attempt = ExecutionAttemptId {
            vertex: vertex.vertex_id,
            subtask_index: 0,
            attempt: 0,
        };
        vertex.attempts.insert(0, attempt);
        vertex.assigned_slot.insert(0, tm(1));
        vertex.state.insert(0, state);
        topology.add_vertex(vertex);
        (topology, attempt)
    }

    fn engine(
        topology: Topology,
    ) -> (
        RestartEngine<FakeTaskManagerGateway, FakeExecutionGraph>,
        Arc<CoordinatorRegistry>,
        Arc<FakeTaskManagerGateway>,
    ) {
        let registry = crate::registry::test_registry(std::time::Duration::from_secs(90));
        let gateway = Arc::new(FakeTaskManagerGateway::default());
        let graph = Arc::new(FakeExecutionGraph::new(JobId::new()));
        let metrics = Arc::new(CoordinatorMetrics::for_test());
        let engine = RestartEngine::new(
            registry.clone(),
            Arc::new(RwLock::new(topology)),
            gateway.clone(),
            graph,
            metrics,
        );
        (engine, registry, gateway)
    }

    #[tokio::test]
    async fn restarts_once_all_three_conditions_hold() {
        let (topology, attempt) = single_vertex_topology("map", ExecutionState::Paused);
        let (engine, registry, gateway) = engine(topology);

        let slot = modcoord_common::ids::Slot {
            task_manager_id: tm(2),
            location: TaskManagerLocation {
                host: "tm-2".to_string(),
                data_port: 0,
            },
        };
        registry.register_restart_target(
            attempt,
            RestartTarget {
                mod_id: ModificationId(1),
                slot,
            },
        );
        registry.insert_stored_state(
            attempt,
            TaskStateHandles {
                attempt,
                state_blob: vec![1, 2, 3],
            },
        );

        engine.restart_if_stopped_and_state_received(attempt).await;

        let calls = gateway.calls.lock().unwrap();
        assert!(matches!(calls[0], RecordedCall::Deploy(a) if a == attempt));
        assert!(!registry.is_awaiting_restart(attempt));
    }

    #[tokio::test]
    async fn guard_does_not_fire_while_still_running() {
        let (topology, attempt) = single_vertex_topology("map", ExecutionState::Running);
        let (engine, registry, gateway) = engine(topology);

        registry.register_restart_target(
            attempt,
            RestartTarget {
                mod_id: ModificationId(1),
                slot: modcoord_common::ids::Slot {
                    task_manager_id: tm(2),
                    location: TaskManagerLocation {
                        host: "tm-2".to_string(),
                        data_port: 0,
                    },
                },
            },
        );
        registry.insert_stored_state(
            attempt,
            TaskStateHandles {
                attempt,
                state_blob: vec![],
            },
        );

        engine.restart_if_stopped_and_state_received(attempt).await;

        assert!(gateway.calls.lock().unwrap().is_empty());
        assert!(registry.is_awaiting_restart(attempt));
    }

    #[tokio::test]
    async fn create_and_insert_operator_wires_between_upstream_and_its_downstream() {
        let mut topology = Topology::new();
        let source_idx = topology.add_vertex(ExecutionVertex {
            vertex_id: VertexId::new(),
            name: "source".to_string(),
            parallelism: 1,
            attempts: Default::default(),
            assigned_slot: Default::default(),
            state: Default::default(),
        });
        let sink_idx = topology.add_vertex(ExecutionVertex {
            vertex_id: VertexId::new(),
            name: "sink".to_string(),
            parallelism: 1,
            attempts: Default::default(),
            assigned_slot: Default::default(),
            state: Default::default(),
        });
        topology.connect(source_idx, sink_idx);

        let (engine, _registry, _gateway) = engine(topology);
        let new_idx = engine
            .create_and_insert_operator("source", "new_filter".to_string(), 3)
            .await
            .unwrap();

        let topology = engine.topology.read();
        assert_eq!(topology.vertex(new_idx).parallelism, 3);
        assert_eq!(topology.vertex(new_idx).attempts.len(), 3);
        assert_eq!(topology.downstream_of(source_idx), &[new_idx]);
        assert_eq!(topology.downstream_of(new_idx), &[sink_idx]);
    }

    #[tokio::test]
    async fn consume_new_producer_delegates_to_gateway() {
        let (topology, attempt) = single_vertex_topology("sink", ExecutionState::Running);
        let (engine, _registry, gateway) = engine(topology);
        let new_producer = ExecutionAttemptId {
            vertex: VertexId::new(),
            subtask_index: 2,
            attempt: 0,
        };

        engine
            .consume_new_producer(
                attempt,
                new_producer,
                TaskManagerLocation {
                    host: "tm-3".to_string(),
                    data_port: 0,
                },
                2,
                2,
            )
            .await
            .unwrap();

        let calls = gateway.calls.lock().unwrap();
        assert!(matches!(calls[0], RecordedCall::ConsumeNewProducer(a, b) if a == attempt && b == new_producer));
    }
}
