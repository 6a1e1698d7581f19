// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Signature aggregation for node certificate formation.
//!
//! Collects votes for one node digest, tracks the voters' combined power and
//! assembles a [`NodeCertificate`] once that power reaches a quorum.

use crate::epoch::EpochContext;
use dag_consensus_traits::{
    Author, NodeCertificate, NodeId, Signature, VerifyError, VotingPower,
};
use std::collections::BTreeMap;

/// Aggregates signatures over one node and tracks voting power.
///
/// # Example
///
/// ```ignore
/// let mut aggregator = SignatureAggregator::new(node.id());
/// for vote in votes {
///     epoch.verify_vote(&vote)?;
///     let power = epoch.voting_power(vote.author()).unwrap_or(0);
///     aggregator.add_signature(*vote.author(), vote.signature().clone(), power);
/// }
/// if aggregator.check_quorum(&epoch).is_ok() {
///     let certificate = aggregator.aggregate(&epoch)?;
/// }
/// ```
#[derive(Clone, Debug)]
pub struct SignatureAggregator {
    node_id: NodeId,
    signatures: BTreeMap<Author, Signature>,
    voting_power: VotingPower,
}

impl SignatureAggregator {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            signatures: BTreeMap::new(),
            voting_power: 0,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Add a signature. A second signature from the same validator is
    /// ignored. Returns whether the signature was new.
    pub fn add_signature(
        &mut self,
        author: Author,
        signature: Signature,
        voting_power: VotingPower,
    ) -> bool {
        if self.signatures.contains_key(&author) {
            return false;
        }
        self.voting_power = self.voting_power.saturating_add(voting_power);
        self.signatures.insert(author, signature);
        true
    }

    pub fn voting_power(&self) -> VotingPower {
        self.voting_power
    }

    pub fn signer_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn signers(&self) -> impl Iterator<Item = &Author> {
        self.signatures.keys()
    }

    pub fn has_signed(&self, author: &Author) -> bool {
        self.signatures.contains_key(author)
    }

    pub fn check_quorum(&self, epoch: &EpochContext) -> Result<VotingPower, VerifyError> {
        epoch.check_voting_power(self.signers(), true)
    }

    /// Build the certificate. Fails unless the signers form a quorum.
    pub fn aggregate(&self, epoch: &EpochContext) -> Result<NodeCertificate, VerifyError> {
        self.check_quorum(epoch)?;
        let signatures = self
            .signatures
            .iter()
            .map(|(author, signature)| (*author, signature.clone()))
            .collect();
        Ok(NodeCertificate::new(self.node_id.clone(), signatures))
    }
}
