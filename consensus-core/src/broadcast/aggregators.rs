// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::BroadcastStatus;
use crate::{crypto::SignatureAggregator, epoch::EpochContext};
use dag_consensus_traits::{
    Author, DagError, DagMessage, NodeCertificate, NodeId, RpcError, VerifyError,
};
use std::{collections::HashSet, sync::Arc};

/// Collects votes on a local node into a certificate.
pub struct VoteAggregator {
    epoch: Arc<EpochContext>,
    signatures: SignatureAggregator,
}

impl VoteAggregator {
    pub fn new(epoch: Arc<EpochContext>, node_id: NodeId) -> Self {
        Self {
            epoch,
            signatures: SignatureAggregator::new(node_id),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.signatures.node_id()
    }
}

impl BroadcastStatus for VoteAggregator {
    type Aggregated = NodeCertificate;

    fn add(
        &mut self,
        peer: Author,
        response: DagMessage,
    ) -> Result<Option<NodeCertificate>, DagError> {
        let DagMessage::Vote(vote) = response else {
            return Err(RpcError::unexpected(format!("expected Vote, got {}", response.name())).into());
        };
        if vote.author() != &peer || vote.node_id() != self.node_id() {
            return Err(DagError::InvalidVote {
                author: peer,
                reason: VerifyError::InvalidSignature,
            });
        }
        self.epoch
            .verify_vote(&vote)
            .map_err(|reason| DagError::InvalidVote {
                author: peer,
                reason,
            })?;

        let power = self.epoch.voting_power(&peer).unwrap_or(0);
        self.signatures
            .add_signature(peer, vote.signature().clone(), power);
        if !self.epoch.quorum_satisfied(self.signatures.voting_power()) {
            return Ok(None);
        }
        self.signatures
            .aggregate(&self.epoch)
            .map(Some)
            .map_err(|reason| DagError::InvalidVote {
                author: peer,
                reason,
            })
    }
}

/// Completes once every receiver acknowledged a certified node.
pub struct CertifiedAckAggregator {
    node_id: NodeId,
    missing: HashSet<Author>,
}

impl CertifiedAckAggregator {
    pub fn new(node_id: NodeId, receivers: impl IntoIterator<Item = Author>) -> Self {
        Self {
            node_id,
            missing: receivers.into_iter().collect(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl BroadcastStatus for CertifiedAckAggregator {
    type Aggregated = ();

    fn add(&mut self, peer: Author, response: DagMessage) -> Result<Option<()>, DagError> {
        let DagMessage::CertifiedAck(ack) = response else {
            return Err(RpcError::unexpected(format!(
                "expected CertifiedAck, got {}",
                response.name()
            ))
            .into());
        };
        if ack.node_id != self.node_id || ack.author != peer {
            return Err(RpcError::unexpected(format!("ack for {} from {}", ack.node_id, ack.author)).into());
        }
        self.missing.remove(&peer);
        Ok(self.missing.is_empty().then_some(()))
    }
}
