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

//! Topology as an arena of nodes with integer indices and typed edges.
//!
//! Upstream/downstream navigation assumes a DAG with a single producer per
//! consumer input. We never need cyclic traversal, so an arena indexed by
//! [`NodeIndex`] (instead of name-based lookups scattered through the graph)
//! keeps that assumption explicit.

use std::collections::HashMap;

use crate::ids::{ExecutionAttemptId, ExecutionState, TaskManagerId, VertexId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub usize);

#[derive(Debug, Clone)]
pub struct ExecutionVertex {
    pub vertex_id: VertexId,
    pub name: String,
    pub parallelism: u32,
    /// One entry per parallel subtask, keyed by subtask index.
    pub attempts: HashMap<u32, ExecutionAttemptId>,
    pub assigned_slot: HashMap<u32, TaskManagerId>,
    pub state: HashMap<u32, ExecutionState>,
}

impl ExecutionVertex {
    pub fn attempt_of(&self, subtask_index: u32) -> Option<ExecutionAttemptId> {
        self.attempts.get(&subtask_index).copied()
    }

    pub fn subtask_index_of(&self, attempt: ExecutionAttemptId) -> Option<u32> {
        self.attempts
            .iter()
            .find(|(_, a)| **a == attempt)
            .map(|(idx, _)| *idx)
    }
}

/// A DAG of [`ExecutionVertex`]es with typed upstream/downstream edges.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: Vec<ExecutionVertex>,
    upstream: Vec<Vec<NodeIndex>>,
    downstream: Vec<Vec<NodeIndex>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, vertex: ExecutionVertex) -> NodeIndex {
        let idx = NodeIndex(self.nodes.len());
        self.nodes.push(vertex);
        self.upstream.push(Vec::new());
        self.downstream.push(Vec::new());
        idx
    }

    pub fn connect(&mut self, upstream: NodeIndex, downstream: NodeIndex) {
        self.downstream[upstream.0].push(downstream);
        self.upstream[downstream.0].push(upstream);
    }

    pub fn vertex(&self, idx: NodeIndex) -> &ExecutionVertex {
        &self.nodes[idx.0]
    }

    pub fn vertex_mut(&mut self, idx: NodeIndex) -> &mut ExecutionVertex {
        &mut self.nodes[idx.0]
    }

    pub fn upstream_of(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.upstream[idx.0]
    }

    pub fn downstream_of(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.downstream[idx.0]
    }

    /// Topological (creation) order: this arena only ever grows by appending,
    /// so insertion order already satisfies it.
    pub fn vertices_in_creation_order(&self) -> impl Iterator<Item = (NodeIndex, &ExecutionVertex)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, v)| (NodeIndex(i), v))
    }

    pub fn sources(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.upstream
            .iter()
            .enumerate()
            .filter(|(_, up)| up.is_empty())
            .map(|(i, _)| NodeIndex(i))
    }

    /// Fragile, flagged-for-rewrite: case-insensitive substring match over
    /// vertex names. Kept only because operator selection by name is still a
    /// caller-facing entry point; a caller with a `VertexId` should prefer
    /// [`Topology::vertex`] directly.
    pub fn find_by_name_substring(&self, needle: &str) -> Vec<NodeIndex> {
        let needle = needle.to_lowercase();
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, v)| v.name.to_lowercase().contains(&needle))
            .map(|(i, _)| NodeIndex(i))
            .collect()
    }

    pub fn find_node_of_attempt(&self, attempt: ExecutionAttemptId) -> Option<NodeIndex> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, v)| v.vertex_id == attempt.vertex)
            .map(|(i, _)| NodeIndex(i))
    }

    pub fn node_hosting(&self, tm: TaskManagerId) -> Vec<(NodeIndex, u32)> {
        let mut out = Vec::new();
        for (i, v) in self.nodes.iter().enumerate() {
            for (&subtask_index, &slot_tm) in &v.assigned_slot {
                if slot_tm == tm {
                    out.push((NodeIndex(i), subtask_index));
                }
            }
        }
        out
    }
}
