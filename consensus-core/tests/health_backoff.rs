// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Health backoff: payload budgets and the pipeline voting cutoff.

use dag_consensus_core::{
    config::DagConfig,
    dag::{DagStore, DagStoreConfig, RoundState},
    health::{budget_for_ratio, HealthBackoff, HealthConfig, PayloadLimits},
    testing::{LocalCluster, TestValidators},
};
use dag_consensus_traits::{CertifiedNode, NodeId};
use std::{sync::Arc, time::Duration};

#[test]
fn test_budget_formula() {
    assert_eq!(budget_for_ratio(10_000, 0.67), 6_700);
    assert_eq!(budget_for_ratio(10_000, 1.0), 10_000);
    assert_eq!(budget_for_ratio(10_000, 0.0), 0);
}

#[test]
fn test_budget_strictly_decreases_with_ratio() {
    let ratios = [1.0, 0.9, 0.75, 0.67, 0.5, 0.34, 0.1];
    let budgets: Vec<u64> = ratios.iter().map(|r| budget_for_ratio(10_000, *r)).collect();
    assert!(budgets.windows(2).all(|w| w[0] > w[1]), "{:?}", budgets);
}

/// Stores rounds `1..=rounds` where only `active` validators propose.
fn partial_dag(validators: &TestValidators, active: &[usize], rounds: u64) -> Arc<DagStore> {
    let dag = Arc::new(DagStore::new(
        validators.epoch_context(),
        DagStoreConfig::default(),
    ));
    let mut parents: Vec<NodeId> = vec![];
    for round in 1..=rounds {
        let nodes = validators.build_round(round, active, &parents);
        parents = nodes.iter().map(CertifiedNode::id).collect();
        dag.insert_batch(nodes).unwrap();
    }
    dag
}

#[test]
fn test_missing_validator_shrinks_budget() {
    let validators = TestValidators::new(4);
    let config = HealthConfig {
        max_txns_per_round: 10_000,
        max_payload_bytes_per_round: 1_000_000,
        ..HealthConfig::default()
    };

    let full = HealthBackoff::new(partial_dag(&validators, &[0, 1, 2, 3], 5), config.clone());
    assert_eq!(
        full.calculate_payload_limits(6),
        PayloadLimits {
            max_txns: 10_000,
            max_bytes: 1_000_000,
        }
    );

    let partial = HealthBackoff::new(partial_dag(&validators, &[0, 1, 2], 5), config);
    assert_eq!(partial.participation().voting_power_ratio(6), 0.75);
    assert_eq!(
        partial.calculate_payload_limits(6),
        PayloadLimits {
            max_txns: 7_500,
            max_bytes: 750_000,
        }
    );
}

#[test]
fn test_lagging_pipeline_stops_votes_and_payload() {
    let validators = TestValidators::new(4);
    let health = HealthBackoff::new(
        partial_dag(&validators, &[0, 1, 2, 3], 2),
        HealthConfig {
            voter_pipeline_latency_limit_ms: 100,
            ..HealthConfig::default()
        },
    );
    assert!(!health.stop_voting());

    health.pipeline().record_latency(Duration::from_millis(150));
    assert!(health.stop_voting());
    assert_eq!(health.calculate_payload_limits(3).max_txns, 0);

    health.pipeline().record_latency(Duration::from_millis(20));
    assert!(!health.stop_voting());
    assert!(health.calculate_payload_limits(3).max_txns > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_votes_resume_when_latency_recovers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = DagConfig {
        voter_pipeline_latency_limit_ms: 300,
        rpc_timeout_ms: 200,
        adaptive_wait_time_ms: 20,
        payload_poll_timeout_ms: 5,
        broadcast_backoff_base_ms: 10,
        broadcast_max_backoff_ms: 50,
        ..DagConfig::default()
    };
    let mut cluster = LocalCluster::with_round_limit(4, &config, Some(5)).unwrap();
    cluster.set_latency_reporting(false);
    for node in cluster.nodes() {
        node.health().pipeline().record_latency(Duration::from_millis(1_000));
    }
    cluster.start();

    let stuck = cluster
        .wait_for(Duration::from_secs(5), |cluster| {
            cluster
                .nodes()
                .iter()
                .all(|node| node.state() == RoundState::AwaitingCertificate(1))
        })
        .await;
    assert!(stuck, "drivers did not block on certification");
    tokio::time::sleep(Duration::from_millis(200)).await;
    for node in cluster.nodes() {
        assert_eq!(node.state(), RoundState::AwaitingCertificate(1));
        assert!(node.dag().snapshot().is_empty());
    }

    for node in cluster.nodes() {
        node.health().pipeline().record_latency(Duration::from_millis(10));
    }
    cluster.set_latency_reporting(true);

    let advanced = cluster
        .wait_for(Duration::from_secs(30), |cluster| {
            cluster.nodes().iter().all(|node| node.state().round() >= 2)
        })
        .await;
    assert!(advanced, "drivers did not advance after recovery");
    assert!(cluster.node(0).dag().snapshot().round_voting_power(1) >= 3);
    cluster.shutdown().await;
}
