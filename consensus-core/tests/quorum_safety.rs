// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Safety properties of quorum arithmetic and ordering.
//!
//! Validators that receive the same certified nodes in different causal
//! orders must commit the same anchors and the same sequence.

use dag_consensus_core::{
    dag::{
        AnchorElection, DagInserter, DagStore, DagStoreConfig, OrderRule, OrderingConfig,
        RoundRobinAnchorElection, WeightedAnchorElection,
    },
    epoch::EpochContext,
    pipeline::ChannelOrderedAdapter,
    testing::{create_test_dag, TestValidators},
};
use dag_consensus_traits::{CertifiedNode, NodeId, OrderedBatch, Round, VerifyError};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::{collections::HashSet, sync::Arc};

/// Quorum is total minus f where f = (total - 1) / 3.
#[test]
fn test_quorum_threshold_calculation() {
    let test_cases = vec![
        (vec![1u64; 4], 4, 3, 2),
        (vec![100u64; 3], 300, 201, 100),
        (vec![100u64; 4], 400, 267, 134),
        (vec![50u64; 10], 500, 334, 167),
        (vec![100u64; 10], 1000, 667, 334),
    ];

    for (powers, total, quorum, validity) in test_cases {
        let validators = TestValidators::with_powers(&powers);
        let epoch = validators.epoch_context();
        assert_eq!(epoch.total_voting_power(), total);
        assert_eq!(epoch.quorum_voting_power(), quorum);
        assert_eq!(epoch.validity_voting_power(), validity);
    }
}

#[test]
fn test_quorum_rejection_insufficient_power() {
    let validators = TestValidators::with_powers(&[100, 100, 100, 100]);
    let epoch = validators.epoch_context();
    for signers in [vec![0], vec![0, 1]] {
        let authors: Vec<_> = signers.iter().map(|&i| validators.author(i)).collect();
        assert!(matches!(
            epoch.check_voting_power(authors.iter(), true),
            Err(VerifyError::TooLittleVotingPower { .. })
        ));
    }
    let authors: Vec<_> = (0..3).map(|i| validators.author(i)).collect();
    assert_eq!(epoch.check_voting_power(authors.iter(), true).unwrap(), 300);
}

#[test]
fn test_duplicate_signers_do_not_count_twice() {
    let validators = TestValidators::new(4);
    let epoch = validators.epoch_context();
    let a = validators.author(0);
    let b = validators.author(1);
    assert!(matches!(
        epoch.check_voting_power([a, b, a].iter(), true),
        Err(VerifyError::DuplicateSigner(_))
    ));
}

#[test]
fn test_empty_validator_set_rejected() {
    assert!(EpochContext::new(1, vec![]).is_err());
}

/// A random insertion order that never inserts a node before its links.
fn causal_shuffle(nodes: &[CertifiedNode], rng: &mut StdRng) -> Vec<CertifiedNode> {
    let mut pending: Vec<CertifiedNode> = nodes.to_vec();
    pending.shuffle(rng);
    let mut inserted: HashSet<NodeId> = HashSet::new();
    let mut order = Vec::with_capacity(nodes.len());
    while !pending.is_empty() {
        let ready: Vec<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, node)| node.links().all(|link| inserted.contains(link)))
            .map(|(i, _)| i)
            .collect();
        let pick = ready[rng.gen_range(0..ready.len())];
        let node = pending.swap_remove(pick);
        inserted.insert(node.id());
        order.push(node);
    }
    order
}

fn replay(
    validators: &TestValidators,
    election: Arc<dyn AnchorElection>,
    nodes: Vec<CertifiedNode>,
) -> Vec<OrderedBatch> {
    let epoch = validators.epoch_context();
    let dag = Arc::new(DagStore::new(epoch.clone(), DagStoreConfig::default()));
    let (adapter, mut rx) = ChannelOrderedAdapter::new();
    let rule = OrderRule::new(
        epoch,
        dag.clone(),
        election,
        Arc::new(adapter),
        OrderingConfig::default(),
    );
    let inserter = DagInserter::new(dag, rule);
    for node in nodes {
        inserter.insert(node).unwrap();
    }
    let mut batches = vec![];
    while let Ok(batch) = rx.try_recv() {
        batches.push(batch);
    }
    batches
}

fn summary(batches: &[OrderedBatch]) -> (Vec<NodeId>, Vec<NodeId>) {
    let anchors = batches.iter().map(|b| b.anchor.clone()).collect();
    let sequence = batches
        .iter()
        .flat_map(|b| b.nodes.iter().map(|n| n.id()))
        .collect();
    (anchors, sequence)
}

/// A DAG where validator 3 misses every round `r` with `r % 4 == 3`. Those
/// are exactly the rounds it is elected for, so their anchors are skipped.
fn sparse_dag(validators: &TestValidators, rounds: Round) -> Vec<CertifiedNode> {
    let mut nodes = vec![];
    let mut parents: Vec<NodeId> = vec![];
    for round in 1..=rounds {
        let authors: Vec<usize> = (0..validators.len())
            .filter(|&i| !(round % 4 == 3 && i == 3))
            .collect();
        let round_nodes = validators.build_round(round, &authors, &parents);
        parents = round_nodes.iter().map(CertifiedNode::id).collect();
        nodes.extend(round_nodes);
    }
    nodes
}

#[test]
fn test_insertion_order_does_not_change_commits() {
    let validators = TestValidators::new(4);
    let election: Arc<dyn AnchorElection> =
        Arc::new(RoundRobinAnchorElection::new(&validators.epoch_context()));
    let nodes = sparse_dag(&validators, 10);
    let batches = replay(&validators, election.clone(), nodes.clone());
    assert!(batches
        .iter()
        .any(|batch| batch.failed_authors.contains(&(3, validators.author(3)))));
    let reference = summary(&batches);
    assert!(!reference.0.is_empty());

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..10 {
        let order = causal_shuffle(&nodes, &mut rng);
        assert_eq!(summary(&replay(&validators, election.clone(), order)), reference);
    }
}

#[test]
fn test_weighted_election_orders_identically() {
    let validators = TestValidators::with_powers(&[5, 1, 3, 2, 4]);
    let election: Arc<dyn AnchorElection> =
        Arc::new(WeightedAnchorElection::new(&validators.epoch_context()));
    let nodes = create_test_dag(&validators, 9);
    let reference = summary(&replay(&validators, election.clone(), nodes.clone()));

    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..5 {
        let order = causal_shuffle(&nodes, &mut rng);
        assert_eq!(summary(&replay(&validators, election.clone(), order)), reference);
    }

    // every ordered node appears exactly once
    let unique: HashSet<&NodeId> = reference.1.iter().collect();
    assert_eq!(unique.len(), reference.1.len());
}

/// Round 2 splits on the round-1 anchor and rounds 3 and 4 only build on
/// part of round 2. A validator that never receives one of the round-2
/// linkers must still commit every anchor the others commit directly.
#[test]
fn test_partial_round_view_commits_same_sequence() {
    let validators = TestValidators::new(4);
    let election: Arc<dyn AnchorElection> =
        Arc::new(RoundRobinAnchorElection::new(&validators.epoch_context()));

    // round 1 elects slot 1
    let r1 = validators.build_round(1, &[0, 1, 2, 3], &[]);
    let r1_ids: Vec<NodeId> = r1.iter().map(CertifiedNode::id).collect();
    let without_anchor = vec![r1_ids[0].clone(), r1_ids[2].clone(), r1_ids[3].clone()];
    let mut r2 = validators.build_round(2, &[0, 1, 3], &r1_ids);
    r2.insert(2, validators.certify(&validators.node(2, 2, without_anchor)));
    let late = r2.remove(1);
    let r2_ids: Vec<NodeId> = r2.iter().map(CertifiedNode::id).collect();
    let r3 = validators.build_round(3, &[0, 1, 2, 3], &r2_ids);
    let r3_ids: Vec<NodeId> = r3.iter().map(CertifiedNode::id).collect();
    let r4 = validators.build_round(4, &[0, 1, 2, 3], &r3_ids);

    let partial: Vec<CertifiedNode> = r1
        .iter()
        .chain(&r2)
        .chain(&r3)
        .chain(&r4)
        .cloned()
        .collect();
    // the late linker arrives with its round, so round 1 commits directly
    let full: Vec<CertifiedNode> = r1
        .into_iter()
        .chain(std::iter::once(late))
        .chain(r2)
        .chain(r3)
        .chain(r4)
        .collect();

    let with_late = replay(&validators, election.clone(), full.clone());
    let without_late = replay(&validators, election.clone(), partial.clone());
    let anchor_rounds: Vec<Round> = with_late.iter().map(OrderedBatch::anchor_round).collect();
    assert_eq!(anchor_rounds, vec![1, 2, 3]);
    assert_eq!(summary(&without_late), summary(&with_late));

    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..5 {
        let order = causal_shuffle(&full, &mut rng);
        assert_eq!(
            summary(&replay(&validators, election.clone(), order)),
            summary(&with_late)
        );
        let order = causal_shuffle(&partial, &mut rng);
        assert_eq!(
            summary(&replay(&validators, election.clone(), order)),
            summary(&with_late)
        );
    }
}

/// A missing anchor delays the next round's anchor by one round only.
#[test]
fn test_missing_anchor_next_round_commits() {
    let validators = TestValidators::new(4);
    let election: Arc<dyn AnchorElection> =
        Arc::new(RoundRobinAnchorElection::new(&validators.epoch_context()));
    let r1 = validators.build_round(1, &[0, 2, 3], &[]);
    let r1_ids: Vec<NodeId> = r1.iter().map(CertifiedNode::id).collect();
    let r2 = validators.build_round(2, &[0, 1, 2, 3], &r1_ids);
    let r2_ids: Vec<NodeId> = r2.iter().map(CertifiedNode::id).collect();
    let r3 = validators.build_round(3, &[0, 1, 2, 3], &r2_ids);

    let batches = replay(&validators, election, r1.into_iter().chain(r2).chain(r3).collect());
    let anchors: Vec<NodeId> = batches.iter().map(|b| b.anchor.clone()).collect();
    assert_eq!(anchors, vec![r2_ids[2].clone()]);
    assert_eq!(batches[0].failed_authors, vec![(1, validators.author(1))]);
}
