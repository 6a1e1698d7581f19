// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! [`DagConfig`] is the single flat configuration surface. Every component
//! takes its own narrower config, derived from it by the getters below.

use crate::{
    broadcast::BroadcastConfig,
    dag::{driver::DagDriverConfig, ordering::OrderingConfig, store::DagStoreConfig},
    fetch::FetchConfig,
    health::HealthConfig,
};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DagConfig {
    /// Rounds covered by ordering lower bounds and participation history.
    /// The store retains at most three windows.
    pub window_size: u64,
    pub max_txns_per_round: u64,
    pub max_payload_bytes_per_round: u64,
    /// Global cap on concurrently running fetches.
    pub max_concurrent_fetches: usize,
    pub min_concurrent_responders: usize,
    pub max_concurrent_responders: usize,
    pub fetch_retry_backoff_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Certification to execution latency above which voting stops.
    pub voter_pipeline_latency_limit_ms: u64,
    /// How long a validator waits for the previous round's anchor before
    /// proposing without it.
    pub adaptive_wait_time_ms: u64,
    pub payload_poll_timeout_ms: u64,
    pub broadcast_backoff_base_ms: u64,
    pub broadcast_max_backoff_ms: u64,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            max_txns_per_round: 10_000,
            max_payload_bytes_per_round: 10 * 1024 * 1024,
            max_concurrent_fetches: 4,
            min_concurrent_responders: 1,
            max_concurrent_responders: 4,
            fetch_retry_backoff_ms: 200,
            rpc_timeout_ms: 1000,
            voter_pipeline_latency_limit_ms: 5000,
            adaptive_wait_time_ms: 300,
            payload_poll_timeout_ms: 50,
            broadcast_backoff_base_ms: 100,
            broadcast_max_backoff_ms: 3000,
        }
    }
}

impl DagConfig {
    /// Reject settings that would stall the engine.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.window_size > 0, "window_size must be positive");
        ensure!(
            self.max_concurrent_fetches > 0,
            "max_concurrent_fetches must be positive"
        );
        ensure!(
            self.min_concurrent_responders > 0
                && self.min_concurrent_responders <= self.max_concurrent_responders,
            "responder bounds must satisfy 0 < min ({}) <= max ({})",
            self.min_concurrent_responders,
            self.max_concurrent_responders
        );
        ensure!(self.rpc_timeout_ms > 0, "rpc_timeout_ms must be positive");
        ensure!(
            self.broadcast_backoff_base_ms <= self.broadcast_max_backoff_ms,
            "broadcast backoff base exceeds its ceiling"
        );
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn store_config(&self) -> DagStoreConfig {
        DagStoreConfig {
            window_size: self.window_size,
        }
    }

    pub fn ordering_config(&self) -> OrderingConfig {
        OrderingConfig {
            window_size: self.window_size,
        }
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            rpc_timeout_ms: self.rpc_timeout_ms,
            backoff_base_ms: self.broadcast_backoff_base_ms,
            max_backoff_ms: self.broadcast_max_backoff_ms,
            min_fanout: self.min_concurrent_responders,
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            max_concurrent_fetches: self.max_concurrent_fetches,
            min_concurrent_responders: self.min_concurrent_responders,
            max_concurrent_responders: self.max_concurrent_responders,
            retry_backoff_ms: self.fetch_retry_backoff_ms,
            rpc_timeout_ms: self.rpc_timeout_ms,
            window_size: self.window_size,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            window_size: self.window_size,
            max_txns_per_round: self.max_txns_per_round,
            max_payload_bytes_per_round: self.max_payload_bytes_per_round,
            voter_pipeline_latency_limit_ms: self.voter_pipeline_latency_limit_ms,
        }
    }

    pub fn driver_config(&self) -> DagDriverConfig {
        DagDriverConfig {
            window_size: self.window_size,
            payload_poll_timeout_ms: self.payload_poll_timeout_ms,
            adaptive_wait_time_ms: self.adaptive_wait_time_ms,
        }
    }
}
