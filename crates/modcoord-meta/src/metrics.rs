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

//! Coordinator metrics: a plain struct of `prometheus` collectors registered
//! against a caller-supplied [`Registry`].

use prometheus::{
    exponential_buckets, register_histogram_with_registry, register_int_counter_with_registry,
    Histogram, IntCounter, Registry,
};

pub struct CoordinatorMetrics {
    pub modifications_triggered_total: IntCounter,
    pub modifications_completed_total: IntCounter,
    pub modifications_expired_total: IntCounter,
    pub modifications_declined_total: IntCounter,
    pub modifications_discarded_total: IntCounter,
    pub restart_latency_seconds: Histogram,
}

impl CoordinatorMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            modifications_triggered_total: register_int_counter_with_registry!(
                "modcoord_modifications_triggered_total",
                "Number of modifications triggered by the coordinator",
                registry
            )
            .unwrap(),
            modifications_completed_total: register_int_counter_with_registry!(
                "modcoord_modifications_completed_total",
                "Number of modifications that reached COMPLETED",
                registry
            )
            .unwrap(),
            modifications_expired_total: register_int_counter_with_registry!(
                "modcoord_modifications_expired_total",
                "Number of modifications that reached EXPIRED",
                registry
            )
            .unwrap(),
            modifications_declined_total: register_int_counter_with_registry!(
                "modcoord_modifications_declined_total",
                "Number of modifications that reached DECLINED",
                registry
            )
            .unwrap(),
            modifications_discarded_total: register_int_counter_with_registry!(
                "modcoord_modifications_discarded_total",
                "Number of modifications that reached DISCARDED",
                registry
            )
            .unwrap(),
            restart_latency_seconds: register_histogram_with_registry!(
                "modcoord_restart_latency_seconds",
                "Latency of restartIfStoppedAndStateReceived, from guard satisfied to schedule issued",
                exponential_buckets(0.001, 2.0, 16).unwrap(),
                registry
            )
            .unwrap(),
        }
    }

    /// A metrics instance backed by a private registry, for tests and
    /// standalone use.
    pub fn for_test() -> Self {
        Self::new(&Registry::new())
    }
}
