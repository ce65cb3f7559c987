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

//! Broadcast of in-band control markers to a task's outgoing network
//! channels, preserving FIFO order with records already queued on each
//! channel. A marker is handed to every outgoing channel before the chain
//! moves on; a mid-write failure escalates to the task's own failure
//! handling rather than being retried locally.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use modcoord_common::error::{CoordinatorError, CoordinatorResult};
use modcoord_common::ids::{ExecutionAttemptId, ModificationAction, ModificationId};
use modcoord_common::marker::{CheckpointOptions, ControlMarker, InputChannelDescriptor};
use tracing::warn;

/// One outgoing network channel a task writes markers (and, out of this
/// subsystem's scope, data records) to.
#[async_trait]
pub trait NetworkOutputChannel: Send + Sync {
    async fn write_marker(&self, marker: ControlMarker) -> std::io::Result<()>;
}

/// The control-path side of a task's operator chain: owns the ordered list
/// of outgoing channels and exposes its broadcast operations.
pub struct OperatorChain {
    outputs: Vec<Arc<dyn NetworkOutputChannel>>,
}

impl OperatorChain {
    pub fn new(outputs: Vec<Arc<dyn NetworkOutputChannel>>) -> Self {
        Self { outputs }
    }

    async fn broadcast(&self, marker: ControlMarker) -> CoordinatorResult<()> {
        for output in &self.outputs {
            if let Err(source) = output.write_marker(marker.clone()).await {
                warn!(error = %source, "marker broadcast interrupted, escalating");
                return Err(CoordinatorError::IoOnBroadcast {
                    mod_id: marker.mod_id(),
                    source,
                });
            }
        }
        Ok(())
    }

    pub async fn broadcast_checkpoint_barrier(
        &self,
        checkpoint_id: u64,
        timestamp: i64,
        options: CheckpointOptions,
    ) -> CoordinatorResult<()> {
        self.broadcast(ControlMarker::CheckpointBarrier {
            checkpoint_id,
            timestamp,
            options,
        })
        .await
    }

    pub async fn broadcast_checkpoint_cancel_marker(&self, checkpoint_id: u64) -> CoordinatorResult<()> {
        self.broadcast(ControlMarker::CancelCheckpointMarker { checkpoint_id })
            .await
    }

    pub async fn broadcast_start_modification_event(
        &self,
        mod_id: ModificationId,
        timestamp: i64,
        acks: HashSet<ExecutionAttemptId>,
        subtasks_to_pause: HashSet<u32>,
        action: ModificationAction,
    ) -> CoordinatorResult<()> {
        self.broadcast(ControlMarker::StartModification {
            mod_id,
            timestamp,
            acks,
            subtasks_to_pause,
            action,
        })
        .await
    }

    pub async fn broadcast_start_migration_event(
        &self,
        mod_id: ModificationId,
        timestamp: i64,
        spilling_vertices: HashMap<ExecutionAttemptId, HashSet<u32>>,
        stopping_vertices: HashMap<ExecutionAttemptId, Vec<InputChannelDescriptor>>,
        upcoming_checkpoint_id: i64,
    ) -> CoordinatorResult<()> {
        self.broadcast(ControlMarker::StartMigration {
            mod_id,
            timestamp,
            spilling_vertices,
            stopping_vertices,
            upcoming_checkpoint_id,
        })
        .await
    }

    pub async fn broadcast_cancel_modification_event(
        &self,
        mod_id: ModificationId,
        timestamp: i64,
        vertex_ids: HashSet<ExecutionAttemptId>,
    ) -> CoordinatorResult<()> {
        self.broadcast(ControlMarker::CancelModification {
            mod_id,
            timestamp,
            vertex_ids,
        })
        .await
    }

    /// Fanout where the i-th descriptor goes to the i-th outgoing channel,
    /// not a broadcast. Fails with a local policy violation, emitting no
    /// markers at all, if the lengths disagree.
    pub async fn broadcast_operator_paused_event(
        &self,
        descriptors: Vec<InputChannelDescriptor>,
    ) -> CoordinatorResult<()> {
        if descriptors.len() != self.outputs.len() {
            return Err(CoordinatorError::LocalPolicyViolation {
                mod_id: ModificationId(0),
                reason: format!(
                    "operator-paused descriptor count {} does not match outgoing channel count {}",
                    descriptors.len(),
                    self.outputs.len()
                ),
            });
        }
        for (output, descriptor) in self.outputs.iter().zip(descriptors.into_iter()) {
            let marker = ControlMarker::PausingOperator {
                descriptors: vec![descriptor],
            };
            if let Err(source) = output.write_marker(marker).await {
                return Err(CoordinatorError::IoOnBroadcast {
                    mod_id: None,
                    source,
                });
            }
        }
        Ok(())
    }
}
