// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{HealthConfig, PayloadLimits};
use crate::dag::store::DagStore;
use dag_consensus_traits::{Author, Round, VotingPower};
use std::{collections::HashSet, sync::Arc};

/// Scale `max` by `ratio`, rounding down. Non-increasing in `ratio`.
pub fn budget_for_ratio(max: u64, ratio: f64) -> u64 {
    (max as f64 * ratio.clamp(0.0, 1.0)).floor() as u64
}

/// Integer form of [`budget_for_ratio`] for a power fraction.
fn scale(max: u64, active: VotingPower, total: VotingPower) -> u64 {
    if total == 0 {
        return max;
    }
    ((max as u128 * active.min(total) as u128) / total as u128) as u64
}

/// Payload budget proportional to recent participation.
pub struct ParticipationBackoff {
    dag: Arc<DagStore>,
    config: HealthConfig,
}

impl ParticipationBackoff {
    pub fn new(dag: Arc<DagStore>, config: HealthConfig) -> Self {
        Self { dag, config }
    }

    /// Power of the authors holding a certified node in the rounds of the
    /// window before `round`, together with the total power. Rounds already
    /// garbage collected are not counted.
    fn active_power(&self, round: Round) -> Option<(VotingPower, VotingPower)> {
        let snapshot = self.dag.snapshot();
        let epoch = snapshot.epoch_context();
        let start = round
            .saturating_sub(self.config.window_size)
            .max(1)
            .max(snapshot.lowest_round());
        if start >= round {
            return None;
        }
        let authors: HashSet<Author> = (start..round)
            .flat_map(|r| snapshot.round_nodes(r).map(|s| *s.as_node().author()))
            .collect();
        let active = epoch.sum_voting_power(authors.iter()).unwrap_or(0);
        Some((active, epoch.total_voting_power()))
    }

    /// Fraction of total voting power that took part in the window before
    /// `round`; 1.0 when there is no history yet.
    pub fn voting_power_ratio(&self, round: Round) -> f64 {
        match self.active_power(round) {
            Some((active, total)) if total > 0 => active as f64 / total as f64,
            _ => 1.0,
        }
    }

    pub fn payload_limits(&self, round: Round) -> PayloadLimits {
        let (active, total) = self.active_power(round).unwrap_or((1, 1));
        PayloadLimits {
            max_txns: scale(self.config.max_txns_per_round, active, total),
            max_bytes: scale(self.config.max_payload_bytes_per_round, active, total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{
        store::DagStoreConfig,
        testing::{create_test_dag, TestValidators},
    };
    use dag_consensus_traits::CertifiedNode;

    #[test]
    fn test_budget_formula() {
        assert_eq!(budget_for_ratio(10_000, 0.67), 6_700);
        assert_eq!(budget_for_ratio(10_000, 1.0), 10_000);
        assert_eq!(budget_for_ratio(10_000, 0.0), 0);
        assert_eq!(scale(10_000, 67, 100), 6_700);
    }

    #[test]
    fn test_budget_decreases_with_ratio() {
        let ratios = [1.0, 0.9, 0.75, 0.67, 0.5, 0.34, 0.1];
        let budgets: Vec<u64> = ratios.iter().map(|r| budget_for_ratio(10_000, *r)).collect();
        assert!(budgets.windows(2).all(|w| w[0] > w[1]), "{:?}", budgets);
    }

    #[test]
    fn test_ratio_without_history_is_one() {
        let validators = TestValidators::new(4);
        let dag = Arc::new(DagStore::new(
            validators.epoch_context(),
            DagStoreConfig::default(),
        ));
        let backoff = ParticipationBackoff::new(dag, HealthConfig::default());
        assert_eq!(backoff.voting_power_ratio(1), 1.0);
        assert_eq!(backoff.payload_limits(1).max_txns, 10_000);
    }

    #[test]
    fn test_ratio_tracks_missing_validator() {
        let validators = TestValidators::new(4);
        let dag = Arc::new(DagStore::new(
            validators.epoch_context(),
            DagStoreConfig::default(),
        ));
        let r1 = validators.build_round(1, &[0, 1, 2], &[]);
        let r1_ids: Vec<_> = r1.iter().map(CertifiedNode::id).collect();
        let r2 = validators.build_round(2, &[0, 1, 2], &r1_ids);
        for node in r1.into_iter().chain(r2) {
            dag.insert(node).unwrap();
        }
        let backoff = ParticipationBackoff::new(dag, HealthConfig::default());
        assert_eq!(backoff.voting_power_ratio(3), 0.75);
        assert_eq!(backoff.payload_limits(3).max_txns, 7_500);
    }

    #[test]
    fn test_full_participation() {
        let validators = TestValidators::new(4);
        let dag = Arc::new(DagStore::new(
            validators.epoch_context(),
            DagStoreConfig::default(),
        ));
        for node in create_test_dag(&validators, 2) {
            dag.insert(node).unwrap();
        }
        let backoff = ParticipationBackoff::new(dag, HealthConfig::default());
        assert_eq!(backoff.voting_power_ratio(3), 1.0);
    }
}
