// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Stateless checks on nodes and certified nodes.
//!
//! Everything here depends only on the node and the epoch context, so it
//! runs outside any store lock.

use crate::epoch::EpochContext;
use dag_consensus_traits::{CertifiedNode, DagError, Node, VerifyError};
use std::collections::HashSet;

/// Check epoch, author, digest and link structure of a node.
///
/// Round 1 nodes carry no strong links. Later rounds must strongly link
/// distinct-author nodes of the previous round carrying a quorum. Weak links
/// point strictly below the previous round and never repeat a strong link.
pub fn verify_node(node: &Node, epoch: &EpochContext) -> Result<(), DagError> {
    if node.epoch() != epoch.epoch() {
        return Err(DagError::EpochMismatch {
            expected: epoch.epoch(),
            actual: node.epoch(),
        });
    }
    if !epoch.contains(node.author()) {
        return Err(DagError::UnknownAuthor(*node.author()));
    }
    if !node.verify_digest() {
        return Err(DagError::DigestMismatch(node.id()));
    }
    if node.round() == 0 {
        return Err(DagError::malformed(node.id(), "round 0 is genesis"));
    }

    let mut seen = HashSet::new();
    for link in node.links() {
        if link.epoch() != node.epoch() {
            return Err(DagError::malformed(
                node.id(),
                format!("link {} crosses epochs", link),
            ));
        }
        if !epoch.contains(link.author()) {
            return Err(DagError::malformed(
                node.id(),
                format!("link {} has unknown author", link),
            ));
        }
        if !seen.insert(link) {
            return Err(DagError::malformed(
                node.id(),
                format!("duplicate link {}", link),
            ));
        }
    }

    if node.round() == 1 {
        if !node.strong_links().is_empty() || !node.weak_links().is_empty() {
            return Err(DagError::malformed(node.id(), "round 1 node has links"));
        }
        return Ok(());
    }

    let parent_round = node.round() - 1;
    if let Some(link) = node.strong_links().iter().find(|l| l.round() != parent_round) {
        return Err(DagError::malformed(
            node.id(),
            format!("strong link {} is not from round {}", link, parent_round),
        ));
    }
    if let Some(link) = node.weak_links().iter().find(|l| l.round() >= parent_round) {
        return Err(DagError::malformed(
            node.id(),
            format!("weak link {} is not below round {}", link, parent_round),
        ));
    }

    match epoch.check_voting_power(node.strong_links().iter().map(|l| l.author()), true) {
        Ok(_) => Ok(()),
        Err(VerifyError::TooLittleVotingPower {
            voting_power,
            expected_voting_power,
        }) => Err(DagError::ParentQuorumNotMet {
            id: node.id(),
            voting_power,
            expected: expected_voting_power,
        }),
        Err(_) => Err(DagError::malformed(
            node.id(),
            "strong links repeat an author",
        )),
    }
}

/// [`verify_node`] plus the certificate.
pub fn verify_certified_node(node: &CertifiedNode, epoch: &EpochContext) -> Result<(), DagError> {
    verify_node(node.node(), epoch)?;
    let id = node.id();
    if node.certificate().node_id() != &id {
        return Err(DagError::InvalidCertificate {
            id,
            reason: VerifyError::InvalidSignature,
        });
    }
    epoch
        .verify_certificate(node.certificate())
        .map_err(|reason| DagError::InvalidCertificate { id, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::testing::TestValidators;
    use dag_consensus_traits::{ErrorKind, NodeCertificate};

    #[test]
    fn test_round_one_without_links_is_valid() {
        let validators = TestValidators::new(4);
        let node = validators.node(1, 0, vec![]);
        assert!(verify_node(&node, &validators.epoch_context()).is_ok());
    }

    #[test]
    fn test_parent_quorum_not_met() {
        let validators = TestValidators::new(4);
        let parents: Vec<_> = (0..2).map(|i| validators.node(1, i, vec![]).id()).collect();
        let node = validators.node(2, 0, parents);
        assert!(matches!(
            verify_node(&node, &validators.epoch_context()),
            Err(DagError::ParentQuorumNotMet { voting_power: 2, expected: 3, .. })
        ));
    }

    #[test]
    fn test_strong_link_from_wrong_round() {
        let validators = TestValidators::new(4);
        let mut parents: Vec<_> = (0..3).map(|i| validators.node(2, i, vec![]).id()).collect();
        parents.push(validators.node(1, 3, vec![]).id());
        let node = validators.node(3, 0, parents);
        let err = verify_node(&node, &validators.epoch_context()).unwrap_err();
        assert!(matches!(err, DagError::MalformedNode { .. }));
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_weak_link_must_be_older() {
        let validators = TestValidators::new(4);
        let parents: Vec<_> = (0..3).map(|i| validators.node(2, i, vec![]).id()).collect();
        let weak = validators.node(2, 3, vec![]).id();
        let node = validators
            .builder()
            .round(3)
            .strong_links(parents)
            .weak_links(vec![weak])
            .build();
        assert!(matches!(
            verify_node(&node, &validators.epoch_context()),
            Err(DagError::MalformedNode { .. })
        ));
    }

    #[test]
    fn test_duplicate_strong_link_author() {
        let validators = TestValidators::new(4);
        let a = validators.builder().round(1).author(0).timestamp(1).build().id();
        let b = validators.builder().round(1).author(0).timestamp(2).build().id();
        let c = validators.node(1, 1, vec![]).id();
        let node = validators.node(2, 0, vec![a, b, c]);
        assert!(matches!(
            verify_node(&node, &validators.epoch_context()),
            Err(DagError::MalformedNode { .. })
        ));
    }

    #[test]
    fn test_certificate_for_other_node_rejected() {
        let validators = TestValidators::new(4);
        let node = validators.node(1, 0, vec![]);
        let other = validators.certify(&validators.node(1, 1, vec![]));
        let forged = CertifiedNode::new(node, other.certificate().clone());
        assert!(matches!(
            verify_certified_node(&forged, &validators.epoch_context()),
            Err(DagError::InvalidCertificate { .. })
        ));
    }

    #[test]
    fn test_certificate_without_quorum_rejected() {
        let validators = TestValidators::new(4);
        let node = validators.node(1, 0, vec![]);
        let weak_cert = validators.certify_with(&node, &[0, 1]);
        assert!(matches!(
            verify_certified_node(&weak_cert, &validators.epoch_context()),
            Err(DagError::InvalidCertificate {
                reason: VerifyError::TooLittleVotingPower { .. },
                ..
            })
        ));

        let empty = CertifiedNode::new(node.clone(), NodeCertificate::new(node.id(), vec![]));
        assert!(verify_certified_node(&empty, &validators.epoch_context()).is_err());
    }
}
