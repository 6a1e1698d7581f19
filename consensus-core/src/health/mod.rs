// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Admission control for local proposals and votes.
//!
//! Two independent signals feed [`HealthBackoff`]:
//!
//! - [`ParticipationBackoff`] shrinks the payload budget when fewer
//!   validators took part in recent rounds.
//! - [`PipelineBackoff`] withholds votes while the execution pipeline is
//!   lagging behind ordering.

mod participation;
mod pipeline;

pub use participation::{budget_for_ratio, ParticipationBackoff};
pub use pipeline::{PipelineBackoff, MAX_LATENCY_SAMPLES, MAX_PENDING_BATCHES};

use crate::dag::store::DagStore;
use dag_consensus_traits::Round;
use log::debug;
use std::sync::Arc;

/// Configuration for the health monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthConfig {
    /// Rounds looked back over when measuring participation
    pub window_size: u64,
    pub max_txns_per_round: u64,
    pub max_payload_bytes_per_round: u64,
    /// Votes are withheld while the latest pipeline latency exceeds this
    pub voter_pipeline_latency_limit_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            max_txns_per_round: 10_000,
            max_payload_bytes_per_round: 10 * 1024 * 1024,
            voter_pipeline_latency_limit_ms: 5_000,
        }
    }
}

/// Budget for one local proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadLimits {
    pub max_txns: u64,
    pub max_bytes: u64,
}

impl PayloadLimits {
    pub fn min(self, other: PayloadLimits) -> PayloadLimits {
        PayloadLimits {
            max_txns: self.max_txns.min(other.max_txns),
            max_bytes: self.max_bytes.min(other.max_bytes),
        }
    }
}

/// Combined health monitor shared by the driver and the vote handler.
pub struct HealthBackoff {
    participation: ParticipationBackoff,
    pipeline: Arc<PipelineBackoff>,
    config: HealthConfig,
}

impl HealthBackoff {
    pub fn new(dag: Arc<DagStore>, config: HealthConfig) -> Self {
        Self {
            participation: ParticipationBackoff::new(dag, config.clone()),
            pipeline: Arc::new(PipelineBackoff::new(config.voter_pipeline_latency_limit_ms)),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn participation(&self) -> &ParticipationBackoff {
        &self.participation
    }

    /// Handle for reporting execution latency.
    pub fn pipeline(&self) -> &Arc<PipelineBackoff> {
        &self.pipeline
    }

    /// The tighter of the two budgets for a proposal in `round`. A lagging
    /// pipeline reduces the budget to nothing.
    pub fn calculate_payload_limits(&self, round: Round) -> PayloadLimits {
        let participation = self.participation.payload_limits(round);
        let limits = if self.pipeline.stop_voting() {
            PayloadLimits {
                max_txns: 0,
                max_bytes: 0,
            }
        } else {
            participation
        };
        debug!(
            "Round {} payload limits: {} txns, {} bytes",
            round, limits.max_txns, limits.max_bytes
        );
        limits
    }

    pub fn stop_voting(&self) -> bool {
        self.pipeline.stop_voting()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{
        store::DagStoreConfig,
        testing::{create_test_dag, TestValidators},
    };
    use std::time::Duration;

    #[test]
    fn test_full_budget_when_healthy() {
        let validators = TestValidators::new(4);
        let dag = Arc::new(DagStore::new(
            validators.epoch_context(),
            DagStoreConfig::default(),
        ));
        for node in create_test_dag(&validators, 3) {
            dag.insert(node).unwrap();
        }
        let health = HealthBackoff::new(dag, HealthConfig::default());
        let limits = health.calculate_payload_limits(4);
        assert_eq!(limits.max_txns, 10_000);
        assert_eq!(limits.max_bytes, 10 * 1024 * 1024);
        assert!(!health.stop_voting());
    }

    #[test]
    fn test_pipeline_lag_zeroes_budget_and_stops_votes() {
        let validators = TestValidators::new(4);
        let dag = Arc::new(DagStore::new(
            validators.epoch_context(),
            DagStoreConfig::default(),
        ));
        let health = HealthBackoff::new(dag, HealthConfig::default());
        health.pipeline().record_latency(Duration::from_secs(6));
        assert!(health.stop_voting());
        assert_eq!(health.calculate_payload_limits(1).max_txns, 0);

        health.pipeline().record_latency(Duration::from_millis(100));
        assert!(!health.stop_voting());
        assert_eq!(health.calculate_payload_limits(1).max_txns, 10_000);
    }
}
