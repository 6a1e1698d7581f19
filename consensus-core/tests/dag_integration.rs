// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! DAG consensus integration tests.
//!
//! Ordering over hand-built DAGs, plus a live cluster driving rounds over the
//! in-memory network.

use dag_consensus_core::{
    config::DagConfig,
    dag::{
        validation::verify_node, DagInserter, DagStore, DagStoreConfig, OrderRule,
        OrderingConfig, RoundRobinAnchorElection,
    },
    pipeline::ChannelOrderedAdapter,
    testing::{create_test_dag, LocalCluster, TestValidators},
};
use dag_consensus_traits::{CertifiedNode, DagError, NodeId, OrderedBatch};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

fn setup(
    validators: &TestValidators,
) -> (Arc<DagInserter>, mpsc::UnboundedReceiver<OrderedBatch>) {
    let epoch = validators.epoch_context();
    let dag = Arc::new(DagStore::new(epoch.clone(), DagStoreConfig::default()));
    let (adapter, rx) = ChannelOrderedAdapter::new();
    let rule = OrderRule::new(
        epoch.clone(),
        dag.clone(),
        Arc::new(RoundRobinAnchorElection::new(&epoch)),
        Arc::new(adapter),
        OrderingConfig::default(),
    );
    (Arc::new(DagInserter::new(dag, rule)), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<OrderedBatch>) -> Vec<OrderedBatch> {
    let mut batches = vec![];
    while let Ok(batch) = rx.try_recv() {
        batches.push(batch);
    }
    batches
}

fn ordered_ids(batches: &[OrderedBatch]) -> Vec<NodeId> {
    batches
        .iter()
        .flat_map(|batch| batch.nodes.iter().map(|node| node.id()))
        .collect()
}

#[test]
fn test_three_certified_rounds_commit_first_two_anchors() {
    let validators = TestValidators::new(4);
    let (inserter, mut rx) = setup(&validators);
    let nodes = create_test_dag(&validators, 3);
    for node in nodes.clone() {
        assert!(inserter.insert(node).unwrap());
    }

    let batches = drain(&mut rx);
    assert_eq!(batches.len(), 2);
    // round robin elects validator 1 for round 1 and validator 2 for round 2
    assert_eq!(batches[0].anchor, nodes[1].id());
    assert_eq!(batches[0].nodes.len(), 1);
    assert_eq!(batches[0].first_commit_index, 0);
    assert_eq!(batches[1].anchor, nodes[4 + 2].id());
    assert_eq!(batches[1].first_commit_index, 1);

    let ids = ordered_ids(&batches);
    assert_eq!(ids.len(), 5);
    let mut round_one: Vec<NodeId> = ids[..4].to_vec();
    round_one.sort();
    let mut expected: Vec<NodeId> = nodes[..4].iter().map(CertifiedNode::id).collect();
    expected.sort();
    assert_eq!(round_one, expected);
    assert_eq!(ids[4], nodes[6].id());

    assert_eq!(inserter.next_commit_index(), 5);
    assert_eq!(inserter.lowest_unordered_anchor_round(), 3);
}

#[test]
fn test_ordering_is_deterministic() {
    let validators = TestValidators::new(4);
    let nodes = create_test_dag(&validators, 8);

    let (first, mut first_rx) = setup(&validators);
    let (second, mut second_rx) = setup(&validators);
    for node in nodes.clone() {
        first.insert(node).unwrap();
    }
    // same DAG in one atomic batch
    second.insert_batch(nodes).unwrap();

    let first_batches = drain(&mut first_rx);
    let second_ids = ordered_ids(&drain(&mut second_rx));
    assert!(!first_batches.is_empty());
    assert_eq!(ordered_ids(&first_batches), second_ids);
    assert_eq!(first.next_commit_index(), second.next_commit_index());
}

#[test]
fn test_reinsert_is_noop() {
    let validators = TestValidators::new(4);
    let (inserter, mut rx) = setup(&validators);
    let nodes = create_test_dag(&validators, 5);
    for node in nodes.clone() {
        inserter.insert(node).unwrap();
    }
    let before = drain(&mut rx);
    let version = inserter.dag().snapshot().version();
    let commit_index = inserter.next_commit_index();

    for node in nodes.clone() {
        assert!(!inserter.insert(node).unwrap());
    }
    assert_eq!(inserter.insert_batch(nodes).unwrap(), 0);

    assert!(drain(&mut rx).is_empty());
    assert!(!before.is_empty());
    assert_eq!(inserter.dag().snapshot().version(), version);
    assert_eq!(inserter.next_commit_index(), commit_index);
}

#[test]
fn test_weak_parent_quorum_rejected() {
    let validators = TestValidators::new(4);
    let epoch = validators.epoch_context();
    let (inserter, _rx) = setup(&validators);
    let round_one = validators.build_round(1, &[0, 1, 2, 3], &[]);
    for node in round_one.clone() {
        inserter.insert(node).unwrap();
    }

    // two of four is below 2f + 1 = 3
    let parents: Vec<NodeId> = round_one[..2].iter().map(CertifiedNode::id).collect();
    let node = validators.node(2, 0, parents);
    assert!(matches!(
        verify_node(&node, &epoch),
        Err(DagError::ParentQuorumNotMet { voting_power: 2, expected: 3, .. })
    ));
    assert!(matches!(
        inserter.insert(validators.certify(&node)),
        Err(DagError::ParentQuorumNotMet { .. })
    ));
    assert_eq!(inserter.dag().highest_round(), 1);
}

fn fast_config() -> DagConfig {
    DagConfig {
        window_size: 20,
        rpc_timeout_ms: 200,
        fetch_retry_backoff_ms: 20,
        adaptive_wait_time_ms: 20,
        payload_poll_timeout_ms: 5,
        broadcast_backoff_base_ms: 10,
        broadcast_max_backoff_ms: 50,
        ..DagConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_validators_order_identically() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cluster = LocalCluster::with_round_limit(4, &fast_config(), Some(6)).unwrap();
    cluster.start();

    let progressed = cluster
        .wait_for(Duration::from_secs(30), |cluster| {
            cluster
                .nodes()
                .iter()
                .all(|node| node.dag().snapshot().highest_quorum_round() >= 6)
        })
        .await;
    assert!(progressed, "cluster did not reach round 6");

    let converged = cluster
        .wait_for(Duration::from_secs(30), |cluster| {
            let first = cluster.node(0).ordered_ids();
            !first.is_empty()
                && cluster
                    .nodes()
                    .iter()
                    .all(|node| node.ordered_ids() == first)
        })
        .await;
    assert!(converged, "ordered sequences diverged");

    for node in cluster.nodes() {
        let batches = node.ordered_batches();
        for pair in batches.windows(2) {
            assert_eq!(pair[1].first_commit_index, pair[0].last_commit_index() + 1);
            assert!(pair[1].anchor_round() > pair[0].anchor_round());
        }
    }
    cluster.shutdown().await;
}
