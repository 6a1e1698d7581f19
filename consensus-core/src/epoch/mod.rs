// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Per-epoch validator set and quorum arithmetic.
//!
//! An [`EpochContext`] is built once when the epoch starts and shared as
//! `Arc<EpochContext>` by every other component. It never changes.

use anyhow::{ensure, Result};
use dag_consensus_traits::{
    Author, Epoch, NodeCertificate, VerifyError, Vote, VotingPower,
};
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug)]
pub struct EpochContext {
    epoch: Epoch,
    /// Validators sorted by author; the position is the validator's slot.
    validators: Vec<(Author, VotingPower)>,
    author_to_index: HashMap<Author, usize>,
    total_voting_power: VotingPower,
    quorum_voting_power: VotingPower,
    validity_voting_power: VotingPower,
}

impl EpochContext {
    pub fn new(epoch: Epoch, mut validators: Vec<(Author, VotingPower)>) -> Result<Self> {
        ensure!(!validators.is_empty(), "validator set is empty");
        validators.sort_by(|a, b| a.0.cmp(&b.0));

        let mut author_to_index = HashMap::with_capacity(validators.len());
        let mut total_voting_power: VotingPower = 0;
        for (index, (author, power)) in validators.iter().enumerate() {
            ensure!(
                author_to_index.insert(*author, index).is_none(),
                "duplicate validator {}",
                author
            );
            total_voting_power = total_voting_power
                .checked_add(*power)
                .ok_or_else(|| anyhow::anyhow!("total voting power overflows"))?;
        }
        ensure!(total_voting_power > 0, "total voting power is zero");

        // f = floor((total - 1) / 3); quorum = total - f, which is 2f + 1
        // when total = 3f + 1 and always intersects in more than f.
        let f = (total_voting_power - 1) / 3;
        Ok(Self {
            epoch,
            validators,
            author_to_index,
            total_voting_power,
            quorum_voting_power: total_voting_power - f,
            validity_voting_power: f + 1,
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Authors in slot order.
    pub fn authors(&self) -> impl Iterator<Item = &Author> + '_ {
        self.validators.iter().map(|(author, _)| author)
    }

    pub fn validators(&self) -> &[(Author, VotingPower)] {
        &self.validators
    }

    pub fn author_index(&self, author: &Author) -> Option<usize> {
        self.author_to_index.get(author).copied()
    }

    pub fn author_at(&self, index: usize) -> Option<&Author> {
        self.validators.get(index).map(|(author, _)| author)
    }

    pub fn contains(&self, author: &Author) -> bool {
        self.author_to_index.contains_key(author)
    }

    pub fn voting_power(&self, author: &Author) -> Option<VotingPower> {
        self.author_index(author).map(|i| self.validators[i].1)
    }

    pub fn total_voting_power(&self) -> VotingPower {
        self.total_voting_power
    }

    pub fn quorum_voting_power(&self) -> VotingPower {
        self.quorum_voting_power
    }

    pub fn validity_voting_power(&self) -> VotingPower {
        self.validity_voting_power
    }

    pub fn quorum_satisfied(&self, power_sum: VotingPower) -> bool {
        power_sum >= self.quorum_voting_power
    }

    /// Sum the power of distinct, known authors.
    pub fn sum_voting_power<'a>(
        &self,
        authors: impl IntoIterator<Item = &'a Author>,
    ) -> Result<VotingPower, VerifyError> {
        let mut seen = HashSet::new();
        let mut sum: VotingPower = 0;
        for author in authors {
            let power = self
                .voting_power(author)
                .ok_or(VerifyError::UnknownAuthor)?;
            if !seen.insert(*author) {
                return Err(VerifyError::DuplicateSigner(*author));
            }
            sum = sum.saturating_add(power);
        }
        Ok(sum)
    }

    /// Check that `authors` carry a quorum (or, with `check_super_majority`
    /// false, at least f + 1).
    pub fn check_voting_power<'a>(
        &self,
        authors: impl IntoIterator<Item = &'a Author>,
        check_super_majority: bool,
    ) -> Result<VotingPower, VerifyError> {
        let voting_power = self.sum_voting_power(authors)?;
        let expected_voting_power = if check_super_majority {
            self.quorum_voting_power
        } else {
            self.validity_voting_power
        };
        if voting_power < expected_voting_power {
            return Err(VerifyError::TooLittleVotingPower {
                voting_power,
                expected_voting_power,
            });
        }
        Ok(voting_power)
    }

    pub fn verify_vote(&self, vote: &Vote) -> Result<(), VerifyError> {
        if !self.contains(vote.author()) {
            return Err(VerifyError::UnknownAuthor);
        }
        vote.verify_signature()
    }

    /// Verify every signature over the node digest and the signers' power.
    pub fn verify_certificate(&self, certificate: &NodeCertificate) -> Result<(), VerifyError> {
        self.check_voting_power(certificate.signers(), true)?;
        let digest = certificate.node_id().digest();
        for (author, signature) in certificate.signatures() {
            author.verify(digest.as_bytes(), signature)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::testing::TestValidators;

    fn authors(n: u8) -> Vec<(Author, VotingPower)> {
        (0..n).map(|i| (Author::new([i; 32]), 1)).collect()
    }

    #[test]
    fn test_quorum_thresholds_equal_power() {
        let ctx = EpochContext::new(1, authors(4)).unwrap();
        assert_eq!(ctx.total_voting_power(), 4);
        assert_eq!(ctx.quorum_voting_power(), 3);
        assert_eq!(ctx.validity_voting_power(), 2);
        assert!(ctx.quorum_satisfied(3));
        assert!(!ctx.quorum_satisfied(2));

        let ctx = EpochContext::new(1, authors(7)).unwrap();
        assert_eq!(ctx.quorum_voting_power(), 5);
        assert_eq!(ctx.validity_voting_power(), 3);
    }

    #[test]
    fn test_quorum_with_non_canonical_total() {
        // total = 6, f = 1, quorum = 5
        let ctx = EpochContext::new(1, authors(6)).unwrap();
        assert_eq!(ctx.quorum_voting_power(), 5);

        let ctx = EpochContext::new(1, authors(1)).unwrap();
        assert_eq!(ctx.quorum_voting_power(), 1);
    }

    #[test]
    fn test_weighted_power() {
        let validators = vec![
            (Author::new([1; 32]), 10),
            (Author::new([2; 32]), 1),
            (Author::new([3; 32]), 1),
        ];
        let ctx = EpochContext::new(1, validators).unwrap();
        assert_eq!(ctx.total_voting_power(), 12);
        // f = 3, quorum = 9: the heavy validator alone is a quorum
        assert!(ctx
            .check_voting_power([Author::new([1; 32])].iter(), true)
            .is_ok());
        assert!(matches!(
            ctx.check_voting_power([Author::new([2; 32]), Author::new([3; 32])].iter(), true),
            Err(VerifyError::TooLittleVotingPower { voting_power: 2, expected_voting_power: 9 })
        ));
    }

    #[test]
    fn test_slots_sorted_by_author() {
        let validators = vec![(Author::new([9; 32]), 1), (Author::new([2; 32]), 1)];
        let ctx = EpochContext::new(1, validators).unwrap();
        assert_eq!(ctx.author_index(&Author::new([2; 32])), Some(0));
        assert_eq!(ctx.author_at(1), Some(&Author::new([9; 32])));
    }

    #[test]
    fn test_rejects_duplicates_and_empty_sets() {
        assert!(EpochContext::new(1, vec![]).is_err());
        let dup = vec![(Author::new([1; 32]), 1), (Author::new([1; 32]), 1)];
        assert!(EpochContext::new(1, dup).is_err());
        assert!(EpochContext::new(1, vec![(Author::new([1; 32]), 0)]).is_err());
    }

    #[test]
    fn test_duplicate_and_unknown_signers() {
        let ctx = EpochContext::new(1, authors(4)).unwrap();
        let a = Author::new([0; 32]);
        assert_eq!(
            ctx.sum_voting_power([a, a].iter()),
            Err(VerifyError::DuplicateSigner(a))
        );
        assert_eq!(
            ctx.sum_voting_power([Author::new([99; 32])].iter()),
            Err(VerifyError::UnknownAuthor)
        );
    }

    #[test]
    fn test_verify_certificate() {
        let validators = TestValidators::new(4);
        let node = validators.node(1, 0, vec![]);
        let certified = validators.certify(&node);
        assert!(validators.epoch_context().verify_certificate(certified.certificate()).is_ok());

        let short = validators.certify_with(&node, &[0, 1]);
        assert!(matches!(
            validators.epoch_context().verify_certificate(short.certificate()),
            Err(VerifyError::TooLittleVotingPower { .. })
        ));
    }
}
