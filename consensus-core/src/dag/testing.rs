// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! DAG testing utilities and helpers.
//!
//! Deterministic validator sets, node builders and certification helpers
//! shared by unit tests, integration tests and the simulator.

use crate::{crypto::ValidatorSigner, epoch::EpochContext};
use dag_consensus_traits::{
    Author, CertifiedNode, Epoch, Node, NodeCertificate, NodeId, Payload, Round, Transaction,
    Vote, VotingPower,
};
use std::sync::Arc;

pub const TEST_EPOCH: Epoch = 1;

/// A validator set with deterministic keys.
///
/// Signers are kept in slot order, so `signer(i)` is the validator at slot
/// `i` of the epoch context.
#[derive(Clone, Debug)]
pub struct TestValidators {
    signers: Vec<ValidatorSigner>,
    epoch: Arc<EpochContext>,
}

impl TestValidators {
    /// `count` validators with one unit of voting power each.
    pub fn new(count: usize) -> Self {
        Self::with_powers(&vec![1; count])
    }

    /// One validator per entry. Powers are assigned in slot order.
    pub fn with_powers(powers: &[VotingPower]) -> Self {
        let mut signers: Vec<ValidatorSigner> = (0..powers.len())
            .map(|i| {
                let mut seed = [0u8; 32];
                seed[..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
                ValidatorSigner::from_seed(seed)
            })
            .collect();
        signers.sort_by_key(|s| s.author());

        let validators = signers
            .iter()
            .zip(powers)
            .map(|(signer, power)| (signer.author(), *power))
            .collect();
        let epoch = EpochContext::new(TEST_EPOCH, validators)
            .expect("test validator set is well formed");
        Self {
            signers,
            epoch: Arc::new(epoch),
        }
    }

    pub fn epoch_context(&self) -> Arc<EpochContext> {
        self.epoch.clone()
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    pub fn signer(&self, index: usize) -> &ValidatorSigner {
        &self.signers[index]
    }

    pub fn signers(&self) -> &[ValidatorSigner] {
        &self.signers
    }

    pub fn author(&self, index: usize) -> Author {
        self.signers[index].author()
    }

    pub fn index_of(&self, author: &Author) -> usize {
        self.signers
            .iter()
            .position(|s| &s.author() == author)
            .expect("author belongs to the test set")
    }

    pub fn builder(&self) -> TestNodeBuilder<'_> {
        TestNodeBuilder::new(self)
    }

    /// A node by validator `index` with a one-transaction payload.
    pub fn node(&self, round: Round, index: usize, strong_links: Vec<NodeId>) -> Node {
        self.builder()
            .round(round)
            .author(index)
            .strong_links(strong_links)
            .build()
    }

    pub fn vote(&self, node: &Node, index: usize) -> Vote {
        self.signers[index].vote(node)
    }

    /// Certify with every validator's signature.
    pub fn certify(&self, node: &Node) -> CertifiedNode {
        let all: Vec<usize> = (0..self.len()).collect();
        self.certify_with(node, &all)
    }

    /// Certify with the given signers only. The certificate may be invalid.
    pub fn certify_with(&self, node: &Node, signers: &[usize]) -> CertifiedNode {
        let signatures = signers
            .iter()
            .map(|&i| {
                let vote = self.vote(node, i);
                (*vote.author(), vote.signature().clone())
            })
            .collect();
        CertifiedNode::new(node.clone(), NodeCertificate::new(node.id(), signatures))
    }

    /// Certified nodes of `round` by `authors`, each strongly linking `parents`.
    pub fn build_round(
        &self,
        round: Round,
        authors: &[usize],
        parents: &[NodeId],
    ) -> Vec<CertifiedNode> {
        authors
            .iter()
            .map(|&index| self.certify(&self.node(round, index, parents.to_vec())))
            .collect()
    }
}

/// Builder for test nodes.
pub struct TestNodeBuilder<'a> {
    validators: &'a TestValidators,
    round: Round,
    author: usize,
    timestamp: Option<u64>,
    payload: Option<Payload>,
    strong_links: Vec<NodeId>,
    weak_links: Vec<NodeId>,
}

impl<'a> TestNodeBuilder<'a> {
    pub fn new(validators: &'a TestValidators) -> Self {
        Self {
            validators,
            round: 1,
            author: 0,
            timestamp: None,
            payload: None,
            strong_links: vec![],
            weak_links: vec![],
        }
    }

    pub fn round(mut self, round: Round) -> Self {
        self.round = round;
        self
    }

    /// Author by slot index.
    pub fn author(mut self, index: usize) -> Self {
        self.author = index;
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn strong_links(mut self, links: Vec<NodeId>) -> Self {
        self.strong_links = links;
        self
    }

    pub fn weak_links(mut self, links: Vec<NodeId>) -> Self {
        self.weak_links = links;
        self
    }

    pub fn build(self) -> Node {
        let payload = self.payload.unwrap_or_else(|| {
            Payload::new(vec![Transaction(vec![self.round as u8, self.author as u8])])
        });
        Node::new(
            TEST_EPOCH,
            self.round,
            self.validators.author(self.author),
            self.timestamp
                .unwrap_or(self.round * 1000 + self.author as u64),
            payload,
            self.strong_links,
            self.weak_links,
        )
    }
}

/// A fully connected DAG: every validator proposes in every round
/// `1..=rounds`, strongly linking all nodes of the previous round.
/// Returned in round order.
pub fn create_test_dag(validators: &TestValidators, rounds: Round) -> Vec<CertifiedNode> {
    let all: Vec<usize> = (0..validators.len()).collect();
    let mut nodes = Vec::new();
    let mut parents: Vec<NodeId> = vec![];
    for round in 1..=rounds {
        let round_nodes = validators.build_round(round, &all, &parents);
        parents = round_nodes.iter().map(CertifiedNode::id).collect();
        nodes.extend(round_nodes);
    }
    nodes
}
