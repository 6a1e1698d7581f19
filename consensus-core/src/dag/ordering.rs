// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! DAG ordering rules and anchor election.
//!
//! Every round has an elected anchor author. Each round's slot gets one of
//! three decisions, made from the current DAG:
//!
//! * commit directly once next-round nodes holding a quorum of voting power
//!   link the anchor strongly;
//! * skip directly once next-round nodes holding a quorum do not link it. A
//!   missing anchor is linked by nobody;
//! * otherwise the slot follows the lowest later slot, two or more rounds
//!   up, that is not skipped. If that slot commits, the earlier anchor
//!   commits when at least f+1 voting power of its linkers is in the later
//!   anchor's history, and is skipped otherwise. An undecided later slot
//!   leaves it undecided too.
//!
//! Slots are emitted in round order from `lowest_unordered_anchor_round` and
//! emission stops at the first undecided one. Committing an anchor orders
//! every still unordered node it reaches, sorted by (round, author) with the
//! anchor last. Skipped slots are reported with the next committed anchor.
//!
//! A direct commit puts a quorum of linkers in round r+1, and every anchor two
//! or more rounds up has a quorum of round r+1 in its history, so the two
//! overlap in at least f+1. A direct skip leaves at most f linkers anywhere.
//! Every validator therefore reaches the same decision for a slot, whatever
//! part of the DAG it has seen.

use crate::{
    dag::store::{DagSnapshot, DagStore},
    epoch::EpochContext,
};
use dag_consensus_traits::{
    Author, CertifiedNode, DagError, Epoch, HashValue, NodeId, OrderedBatch,
    OrderedBatchAdapter, Round, VotingPower,
};
use log::{debug, error, info};
use sha2::{Digest, Sha256};
use std::{mem, sync::Arc};

/// Configuration for ordering rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderingConfig {
    /// Rounds below `lowest_unordered_anchor_round` still eligible for
    /// ordering.
    pub window_size: u64,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self { window_size: 10 }
    }
}

/// Commit event produced when an anchor is ordered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitEvent {
    /// The anchor node that triggered ordering
    pub anchor_id: NodeId,
    /// Authors of the anchor's strong links
    pub parents: Vec<Author>,
    /// Elected authors whose anchor candidates were skipped
    pub failed_authors: Vec<(Round, Author)>,
}

/// Anchor election strategy.
///
/// Must be a public deterministic function of the round and the validator
/// set, so every validator elects the same anchor.
pub trait AnchorElection: Send + Sync {
    /// Get the anchor author for the given round.
    fn get_anchor(&self, round: Round) -> Author;

    /// Update reputation based on a commit event.
    fn update_reputation(&self, _event: &CommitEvent) {}
}

/// Cycles through validators in slot order, ignoring stake.
pub struct RoundRobinAnchorElection {
    authors: Vec<Author>,
}

impl RoundRobinAnchorElection {
    pub fn new(epoch: &EpochContext) -> Self {
        Self {
            authors: epoch.authors().copied().collect(),
        }
    }
}

impl AnchorElection for RoundRobinAnchorElection {
    fn get_anchor(&self, round: Round) -> Author {
        self.authors[(round % self.authors.len() as u64) as usize]
    }
}

/// Stake-weighted election keyed by round.
///
/// `sha256(epoch || round)` is reduced modulo the total voting power and the
/// validator whose cumulative stake range contains the result is elected.
pub struct WeightedAnchorElection {
    epoch: Epoch,
    /// Validators with the exclusive upper end of their cumulative range.
    cumulative: Vec<(Author, VotingPower)>,
    total_voting_power: VotingPower,
}

impl WeightedAnchorElection {
    pub fn new(epoch: &EpochContext) -> Self {
        let mut sum = 0;
        let cumulative = epoch
            .validators()
            .iter()
            .filter(|(_, power)| *power > 0)
            .map(|(author, power)| {
                sum += power;
                (*author, sum)
            })
            .collect();
        Self {
            epoch: epoch.epoch(),
            cumulative,
            total_voting_power: epoch.total_voting_power(),
        }
    }

    fn seed(&self, round: Round) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.epoch.to_le_bytes());
        hasher.update(round.to_le_bytes());
        let digest = HashValue::from_hasher(hasher);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl AnchorElection for WeightedAnchorElection {
    fn get_anchor(&self, round: Round) -> Author {
        let target = self.seed(round) % self.total_voting_power;
        let index = self.cumulative.partition_point(|(_, upper)| *upper <= target);
        self.cumulative[index.min(self.cumulative.len() - 1)].0
    }
}

/// Outcome for one round's anchor slot.
#[derive(Clone, Debug)]
enum Decision {
    Commit(Arc<CertifiedNode>),
    Skip,
    Undecided,
}

/// DAG ordering rule engine.
///
/// Owns the committed frontier (`lowest_unordered_anchor_round`) and the
/// next commit index. Must be driven under a lock that also covers the
/// insertion that triggered it; see [`DagInserter`](crate::dag::DagInserter).
pub struct OrderRule {
    epoch: Arc<EpochContext>,
    dag: Arc<DagStore>,
    anchor_election: Arc<dyn AnchorElection>,
    adapter: Arc<dyn OrderedBatchAdapter>,
    lowest_unordered_anchor_round: Round,
    next_commit_index: u64,
    config: OrderingConfig,
}

impl OrderRule {
    pub fn new(
        epoch: Arc<EpochContext>,
        dag: Arc<DagStore>,
        anchor_election: Arc<dyn AnchorElection>,
        adapter: Arc<dyn OrderedBatchAdapter>,
        config: OrderingConfig,
    ) -> Self {
        Self {
            epoch,
            dag,
            anchor_election,
            adapter,
            lowest_unordered_anchor_round: 1,
            next_commit_index: 0,
            config,
        }
    }

    pub fn lowest_unordered_anchor_round(&self) -> Round {
        self.lowest_unordered_anchor_round
    }

    pub fn next_commit_index(&self) -> u64 {
        self.next_commit_index
    }

    /// Lowest round any future ordering can reach.
    pub fn ordering_lower_bound(&self) -> Round {
        self.lowest_unordered_anchor_round
            .saturating_sub(self.config.window_size)
    }

    pub fn anchor_election(&self) -> &Arc<dyn AnchorElection> {
        &self.anchor_election
    }

    /// Commit and order every anchor the current DAG allows. Returns the
    /// number of anchors ordered; 0 when nothing changed.
    pub fn process_all(&mut self) -> Result<usize, DagError> {
        let snapshot = self.dag.snapshot();
        let mut ordered = 0;
        let mut failed_authors = Vec::new();
        for (round, decision) in self.decide_slots(&snapshot) {
            match decision {
                Decision::Commit(anchor) => {
                    self.order_anchor(anchor, mem::take(&mut failed_authors))?;
                    ordered += 1;
                },
                Decision::Skip => {
                    failed_authors.push((round, self.anchor_election.get_anchor(round)))
                },
                Decision::Undecided => break,
            }
        }
        Ok(ordered)
    }

    /// Decisions for every slot from the frontier up to the round below the
    /// highest one, in round order.
    fn decide_slots(&self, snapshot: &DagSnapshot) -> Vec<(Round, Decision)> {
        let lowest = self
            .lowest_unordered_anchor_round
            .max(snapshot.lowest_round())
            .max(1);
        let highest = snapshot.highest_round();
        // built top-down, since indirect decisions look at higher slots
        let mut decisions: Vec<(Round, Decision)> = Vec::new();
        for round in (lowest..highest).rev() {
            let decision = match self.direct_decision(snapshot, round) {
                Some(decision) => decision,
                None => self.indirect_decision(snapshot, round, &decisions),
            };
            decisions.push((round, decision));
        }
        decisions.reverse();
        decisions
    }

    fn direct_decision(&self, snapshot: &DagSnapshot, round: Round) -> Option<Decision> {
        let author = self.anchor_election.get_anchor(round);
        let next_round = snapshot.round_nodes(round + 1).map(|s| s.as_node());
        let linking = self.linking_power(next_round, round, &author);
        let not_linking = snapshot.round_voting_power(round + 1).saturating_sub(linking);
        if self.epoch.quorum_satisfied(linking) {
            snapshot.get_node(round, &author).map(Decision::Commit)
        } else if self.epoch.quorum_satisfied(not_linking) {
            Some(Decision::Skip)
        } else {
            None
        }
    }

    /// Decide `round` from the lowest non-skipped slot at least two rounds
    /// above it. `higher` holds the slots above `round`, highest first.
    fn indirect_decision(
        &self,
        snapshot: &DagSnapshot,
        round: Round,
        higher: &[(Round, Decision)],
    ) -> Decision {
        let next = higher
            .iter()
            .rev()
            .filter(|(r, _)| *r >= round + 2)
            .find(|(_, decision)| !matches!(decision, Decision::Skip));
        let Some((_, Decision::Commit(later))) = next else {
            return Decision::Undecided;
        };
        let author = self.anchor_election.get_anchor(round);
        let history = snapshot.reachable(&later.id(), round + 1, |_| true);
        let support = self.linking_power(
            history.iter().filter(|node| node.round() == round + 1),
            round,
            &author,
        );
        match snapshot.get_node(round, &author) {
            Some(anchor) if support >= self.epoch.validity_voting_power() => {
                Decision::Commit(anchor)
            },
            _ => Decision::Skip,
        }
    }

    /// Voting power of the `nodes` strongly linking the slot of `author` in
    /// `round`.
    fn linking_power<'a>(
        &self,
        nodes: impl Iterator<Item = &'a Arc<CertifiedNode>>,
        round: Round,
        author: &Author,
    ) -> VotingPower {
        nodes
            .filter(|node| {
                node.strong_links()
                    .iter()
                    .any(|link| link.round() == round && link.author() == author)
            })
            .filter_map(|node| self.epoch.voting_power(node.author()))
            .sum()
    }

    fn order_anchor(
        &mut self,
        anchor: Arc<CertifiedNode>,
        failed_authors: Vec<(Round, Author)>,
    ) -> Result<(), DagError> {
        let anchor_id = anchor.id();
        let lower_bound = self.ordering_lower_bound();
        let mut nodes = self
            .dag
            .snapshot()
            .reachable_unordered(&anchor_id, lower_bound);
        // (round, author) ascending puts the anchor last: it is the only
        // reachable node of its round
        nodes.sort_by(|a, b| (a.round(), a.author()).cmp(&(b.round(), b.author())));

        let ids: Vec<NodeId> = nodes.iter().map(|node| node.id()).collect();
        let first_commit_index = self.next_commit_index;
        self.dag.mark_ordered(&ids, first_commit_index)?;
        self.next_commit_index += ids.len() as u64;
        self.lowest_unordered_anchor_round = anchor.round() + 1;

        let event = CommitEvent {
            anchor_id: anchor_id.clone(),
            parents: anchor.strong_links().iter().map(|l| *l.author()).collect(),
            failed_authors: failed_authors.clone(),
        };
        self.anchor_election.update_reputation(&event);

        info!(
            "Ordered anchor {} with {} nodes, commit indices {}..{}",
            anchor_id,
            nodes.len(),
            first_commit_index,
            self.next_commit_index
        );
        if !failed_authors.is_empty() {
            debug!("Skipped anchors {:?}", failed_authors);
        }

        let batch = OrderedBatch {
            epoch: self.epoch.epoch(),
            anchor: anchor_id,
            first_commit_index,
            nodes,
            failed_authors,
        };
        if let Err(e) = self.adapter.on_ordered_batch(batch) {
            error!("Adapter rejected ordered batch: {:#}", e);
        }
        Ok(())
    }
}
