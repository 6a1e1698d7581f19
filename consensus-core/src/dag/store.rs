// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! In-memory DAG storage.
//!
//! The DAG lives in an immutable [`DagSnapshot`] behind a short-lived
//! `RwLock<Arc<_>>`. Readers clone the `Arc` and scan without holding the
//! lock. Writers build the next snapshot copy-on-write: only the rounds they
//! touch are cloned, every other round is shared with the previous snapshot.

use crate::{dag::validation::verify_certified_node, epoch::EpochContext};
use dag_consensus_traits::{
    Author, CertifiedNode, DagBitmask, DagError, NodeId, NodeStatus, Round, VotingPower,
};
use log::{debug, trace};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Instant,
};
use tokio::sync::watch;

/// A stored certified node and its ordering state.
#[derive(Clone, Debug)]
pub enum StoredNodeStatus {
    /// Not yet ordered. Tracks the voting power of later nodes linking this
    /// one strongly, and through any link.
    Unordered {
        node: Arc<CertifiedNode>,
        inserted_at: Instant,
        strong_link_power: VotingPower,
        any_link_power: VotingPower,
    },
    Ordered {
        node: Arc<CertifiedNode>,
        inserted_at: Instant,
        commit_index: u64,
    },
}

impl StoredNodeStatus {
    fn new(node: Arc<CertifiedNode>) -> Self {
        StoredNodeStatus::Unordered {
            node,
            inserted_at: Instant::now(),
            strong_link_power: 0,
            any_link_power: 0,
        }
    }

    pub fn as_node(&self) -> &Arc<CertifiedNode> {
        match self {
            StoredNodeStatus::Unordered { node, .. } | StoredNodeStatus::Ordered { node, .. } => {
                node
            }
        }
    }

    /// When the certified node entered the local store.
    pub fn inserted_at(&self) -> Instant {
        match self {
            StoredNodeStatus::Unordered { inserted_at, .. }
            | StoredNodeStatus::Ordered { inserted_at, .. } => *inserted_at,
        }
    }

    pub fn status(&self) -> NodeStatus {
        match self {
            StoredNodeStatus::Unordered { .. } => NodeStatus::Unordered,
            StoredNodeStatus::Ordered { commit_index, .. } => NodeStatus::Ordered {
                commit_index: *commit_index,
            },
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, StoredNodeStatus::Ordered { .. })
    }

    /// Strong-link power, for unordered nodes.
    pub fn strong_link_power(&self) -> Option<VotingPower> {
        match self {
            StoredNodeStatus::Unordered {
                strong_link_power, ..
            } => Some(*strong_link_power),
            StoredNodeStatus::Ordered { .. } => None,
        }
    }

    /// Strong-or-weak link power, for unordered nodes.
    pub fn any_link_power(&self) -> Option<VotingPower> {
        match self {
            StoredNodeStatus::Unordered { any_link_power, .. } => Some(*any_link_power),
            StoredNodeStatus::Ordered { .. } => None,
        }
    }

    fn add_link_power(&mut self, power: VotingPower, strong: bool) {
        if let StoredNodeStatus::Unordered {
            strong_link_power,
            any_link_power,
            ..
        } = self
        {
            if strong {
                *strong_link_power = strong_link_power.saturating_add(power);
            }
            *any_link_power = any_link_power.saturating_add(power);
        }
    }

    fn mark_as_ordered(&mut self, commit_index: u64) -> Result<(), DagError> {
        if self.is_ordered() {
            return Err(DagError::AlreadyOrdered(self.as_node().id()));
        }
        *self = StoredNodeStatus::Ordered {
            node: self.as_node().clone(),
            inserted_at: self.inserted_at(),
            commit_index,
        };
        Ok(())
    }
}

/// Configuration for the DAG storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DagStoreConfig {
    /// The store keeps at most `3 * window_size` rounds.
    pub window_size: u64,
}

impl Default for DagStoreConfig {
    fn default() -> Self {
        Self { window_size: 10 }
    }
}

impl DagStoreConfig {
    pub fn max_retained_rounds(&self) -> u64 {
        self.window_size.saturating_mul(3)
    }
}

type RoundSlots = Arc<Vec<Option<StoredNodeStatus>>>;

/// Immutable view of the DAG at one version.
///
/// Rounds map to arrays indexed by validator slot. Arrays are allocated when
/// the first node of a round arrives.
#[derive(Clone, Debug)]
pub struct DagSnapshot {
    epoch: Arc<EpochContext>,
    nodes_by_round: BTreeMap<Round, RoundSlots>,
    /// Rounds below this were garbage collected.
    lowest_round: Round,
    version: u64,
}

impl DagSnapshot {
    fn new(epoch: Arc<EpochContext>) -> Self {
        Self {
            epoch,
            nodes_by_round: BTreeMap::new(),
            lowest_round: 0,
            version: 0,
        }
    }

    pub fn epoch_context(&self) -> &Arc<EpochContext> {
        &self.epoch
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Lowest round still retained.
    pub fn lowest_round(&self) -> Round {
        self.lowest_round
    }

    /// Highest round holding any node, or 0 for an empty DAG.
    pub fn highest_round(&self) -> Round {
        self.nodes_by_round
            .iter()
            .rev()
            .find(|(_, slots)| slots.iter().any(Option::is_some))
            .map(|(round, _)| *round)
            .unwrap_or(0)
    }

    pub fn get_status(&self, round: Round, author: &Author) -> Option<&StoredNodeStatus> {
        let index = self.epoch.author_index(author)?;
        self.nodes_by_round.get(&round)?.get(index)?.as_ref()
    }

    pub fn get_node(&self, round: Round, author: &Author) -> Option<Arc<CertifiedNode>> {
        self.get_status(round, author).map(|s| s.as_node().clone())
    }

    /// Look up by id. A different node in the same slot does not match.
    pub fn get_status_by_id(&self, id: &NodeId) -> Option<&StoredNodeStatus> {
        self.get_status(id.round(), id.author())
            .filter(|status| status.as_node().digest() == id.digest())
    }

    pub fn get_node_by_id(&self, id: &NodeId) -> Option<Arc<CertifiedNode>> {
        self.get_status_by_id(id).map(|s| s.as_node().clone())
    }

    pub fn exists(&self, id: &NodeId) -> bool {
        self.get_status_by_id(id).is_some()
    }

    /// Ids among `ids` that are neither stored nor below the retained window.
    pub fn missing<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> Vec<NodeId> {
        ids.into_iter()
            .filter(|id| id.round() >= self.lowest_round && !self.exists(id))
            .cloned()
            .collect()
    }

    /// Nodes of one round in slot order.
    pub fn round_nodes(&self, round: Round) -> impl Iterator<Item = &StoredNodeStatus> + '_ {
        self.nodes_by_round
            .get(&round)
            .into_iter()
            .flat_map(|slots| slots.iter().flatten())
    }

    pub fn certified_ids(&self, round: Round) -> Vec<NodeId> {
        self.round_nodes(round).map(|s| s.as_node().id()).collect()
    }

    /// Voting power of the authors holding a node in `round`.
    pub fn round_voting_power(&self, round: Round) -> VotingPower {
        self.round_nodes(round)
            .filter_map(|s| self.epoch.voting_power(s.as_node().author()))
            .sum()
    }

    /// Highest round whose nodes carry a quorum, or 0.
    pub fn highest_quorum_round(&self) -> Round {
        self.nodes_by_round
            .keys()
            .rev()
            .find(|round| self.epoch.quorum_satisfied(self.round_voting_power(**round)))
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.nodes_by_round
            .values()
            .map(|slots| slots.iter().flatten().count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk strong and weak links backwards from `from`, not descending below
    /// `lower_bound`, collecting every node that satisfies `predicate`. The
    /// walk does not continue through nodes that fail the predicate.
    ///
    /// The result is in no particular order.
    pub fn reachable(
        &self,
        from: &NodeId,
        lower_bound: Round,
        predicate: impl Fn(&StoredNodeStatus) -> bool,
    ) -> Vec<Arc<CertifiedNode>> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![from.clone()];
        while let Some(id) = stack.pop() {
            if id.round() < lower_bound || !visited.insert(id.clone()) {
                continue;
            }
            let Some(status) = self.get_status_by_id(&id) else {
                continue;
            };
            if !predicate(status) {
                continue;
            }
            let node = status.as_node();
            stack.extend(
                node.links()
                    .filter(|link| link.round() >= lower_bound && !visited.contains(*link))
                    .cloned(),
            );
            result.push(node.clone());
        }
        result
    }

    /// Unordered nodes reachable from `from` down to `lower_bound`.
    pub fn reachable_unordered(&self, from: &NodeId, lower_bound: Round) -> Vec<Arc<CertifiedNode>> {
        self.reachable(from, lower_bound, |status| !status.is_ordered())
    }

    /// Presence bitmap for rounds `lowest..=highest`.
    pub fn bitmask(&self, lowest: Round, highest: Round) -> DagBitmask {
        let lowest = lowest.max(self.lowest_round);
        let rows = (lowest..=highest)
            .map(|round| {
                let mut row = vec![false; self.epoch.len()];
                if let Some(slots) = self.nodes_by_round.get(&round) {
                    for (index, slot) in slots.iter().enumerate() {
                        row[index] = slot.is_some();
                    }
                }
                row
            })
            .collect();
        DagBitmask::new(lowest, rows)
    }

    fn slot_mut(&mut self, round: Round, index: usize) -> &mut Option<StoredNodeStatus> {
        let width = self.epoch.len();
        let slots = self
            .nodes_by_round
            .entry(round)
            .or_insert_with(|| Arc::new(vec![None; width]));
        &mut Arc::make_mut(slots)[index]
    }

    /// Stateful insertion checks and the write itself. The node was already
    /// verified against the epoch.
    fn insert_verified(&mut self, node: Arc<CertifiedNode>) -> Result<bool, DagError> {
        let round = node.round();
        if round < self.lowest_round {
            return Err(DagError::RoundPruned {
                round,
                lowest: self.lowest_round,
            });
        }
        let index = self
            .epoch
            .author_index(node.author())
            .ok_or(DagError::UnknownAuthor(*node.author()))?;

        if let Some(existing) = self.get_status(round, node.author()) {
            if existing.as_node().digest() == node.digest() {
                return Ok(false);
            }
            return Err(DagError::Equivocation {
                round,
                author: *node.author(),
            });
        }

        let missing = self.missing(node.links());
        if !missing.is_empty() {
            return Err(DagError::MissingParents(missing));
        }

        let power = self.epoch.voting_power(node.author()).unwrap_or(0);
        let strong: HashSet<&NodeId> = node.strong_links().iter().collect();
        for link in node.links() {
            if link.round() < self.lowest_round {
                continue;
            }
            if let Some(parent_index) = self.epoch.author_index(link.author()) {
                if let Some(parent) = self.slot_mut(link.round(), parent_index) {
                    parent.add_link_power(power, strong.contains(link));
                }
            }
        }
        *self.slot_mut(round, index) = Some(StoredNodeStatus::new(node));
        Ok(true)
    }

    fn mark_ordered(&mut self, id: &NodeId, commit_index: u64) -> Result<(), DagError> {
        if self.get_status_by_id(id).is_none() {
            return Err(DagError::NodeNotFound(id.clone()));
        }
        let index = self
            .epoch
            .author_index(id.author())
            .ok_or_else(|| DagError::NodeNotFound(id.clone()))?;
        match self.slot_mut(id.round(), index) {
            Some(status) => status.mark_as_ordered(commit_index),
            None => Err(DagError::NodeNotFound(id.clone())),
        }
    }
}

/// Thread-safe handle to the DAG of one epoch.
///
/// Every successful mutation publishes a new snapshot and bumps the version
/// observable through [`DagStore::subscribe`].
pub struct DagStore {
    epoch: Arc<EpochContext>,
    config: DagStoreConfig,
    current: RwLock<Arc<DagSnapshot>>,
    version_tx: watch::Sender<u64>,
}

impl DagStore {
    pub fn new(epoch: Arc<EpochContext>, config: DagStoreConfig) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(DagSnapshot::new(epoch.clone()))),
            epoch,
            config,
            version_tx,
        }
    }

    pub fn epoch_context(&self) -> &Arc<EpochContext> {
        &self.epoch
    }

    pub fn config(&self) -> &DagStoreConfig {
        &self.config
    }

    /// The current snapshot. Holding it never blocks writers.
    pub fn snapshot(&self) -> Arc<DagSnapshot> {
        self.current.read().clone()
    }

    /// Version counter bumped on every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Apply `f` to a private copy of the current snapshot and publish the
    /// copy only if `f` succeeds.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut DagSnapshot) -> Result<T, DagError>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, DagError> {
        let mut current = self.current.write();
        let mut next = DagSnapshot::clone(&current);
        let result = f(&mut next)?;
        if changed(&result) {
            next.version += 1;
            let version = next.version;
            *current = Arc::new(next);
            drop(current);
            self.version_tx.send_replace(version);
        }
        Ok(result)
    }

    /// Insert a certified node whose links are all present.
    ///
    /// Returns `Ok(false)` if the identical node is already stored.
    pub fn insert(&self, node: CertifiedNode) -> Result<bool, DagError> {
        verify_certified_node(&node, &self.epoch)?;
        let id = node.id();
        let node = Arc::new(node);
        let inserted = self.update(|dag| dag.insert_verified(node), |inserted| *inserted)?;
        if inserted {
            trace!("Inserted {}", id);
        }
        Ok(inserted)
    }

    /// Insert a causally closed batch atomically: either every new node is
    /// inserted or none is. Returns the number of newly inserted nodes.
    pub fn insert_batch(&self, nodes: Vec<CertifiedNode>) -> Result<usize, DagError> {
        for node in &nodes {
            verify_certified_node(node, &self.epoch)?;
        }
        let mut nodes: Vec<Arc<CertifiedNode>> = nodes.into_iter().map(Arc::new).collect();
        nodes.sort_by(|a, b| a.id().cmp(&b.id()));

        let inserted = self.update(
            |dag| {
                let mut inserted = 0;
                for node in nodes {
                    if dag.insert_verified(node)? {
                        inserted += 1;
                    }
                }
                Ok(inserted)
            },
            |inserted| *inserted > 0,
        )?;
        debug!("Batch inserted {} nodes", inserted);
        Ok(inserted)
    }

    pub fn get_node(&self, round: Round, author: &Author) -> Option<Arc<CertifiedNode>> {
        self.snapshot().get_node(round, author)
    }

    pub fn get_node_by_id(&self, id: &NodeId) -> Option<Arc<CertifiedNode>> {
        self.snapshot().get_node_by_id(id)
    }

    pub fn get_status(&self, round: Round, author: &Author) -> Option<NodeStatus> {
        self.snapshot()
            .get_status(round, author)
            .map(StoredNodeStatus::status)
    }

    pub fn exists(&self, id: &NodeId) -> bool {
        self.snapshot().exists(id)
    }

    pub fn missing<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> Vec<NodeId> {
        self.snapshot().missing(ids)
    }

    pub fn highest_round(&self) -> Round {
        self.snapshot().highest_round()
    }

    pub fn lowest_round(&self) -> Round {
        self.snapshot().lowest_round()
    }

    pub fn round_voting_power(&self, round: Round) -> VotingPower {
        self.snapshot().round_voting_power(round)
    }

    /// Unordered nodes reachable from `from` down to `lower_bound`, computed
    /// on the current snapshot.
    pub fn reachable_unordered(
        &self,
        from: &NodeId,
        lower_bound: Round,
        predicate: impl Fn(&StoredNodeStatus) -> bool,
    ) -> Vec<Arc<CertifiedNode>> {
        self.snapshot()
            .reachable(from, lower_bound, |s| !s.is_ordered() && predicate(s))
    }

    /// Assign `commit_index_base + i` to `ids[i]`. Fails without changing
    /// anything if any id is absent or already ordered.
    pub fn mark_ordered(&self, ids: &[NodeId], commit_index_base: u64) -> Result<(), DagError> {
        self.update(
            |dag| {
                for (offset, id) in ids.iter().enumerate() {
                    dag.mark_ordered(id, commit_index_base + offset as u64)?;
                }
                Ok(())
            },
            |_| !ids.is_empty(),
        )
    }

    /// Drop every round below `before_round`. Callers only pass rounds that
    /// are fully behind the committed frontier.
    pub fn gc(&self, before_round: Round) -> Result<usize, DagError> {
        let snapshot = self.snapshot();
        if before_round > snapshot.highest_round().saturating_add(1) {
            return Err(DagError::Internal(format!(
                "cannot gc ahead of the DAG frontier ({} > {})",
                before_round,
                snapshot.highest_round()
            )));
        }
        if before_round <= snapshot.lowest_round() {
            return Ok(0);
        }
        let removed = self.update(
            |dag| {
                let kept = dag.nodes_by_round.split_off(&before_round);
                let removed = dag.nodes_by_round.len();
                dag.nodes_by_round = kept;
                dag.lowest_round = before_round;
                Ok(removed)
            },
            |_| true,
        )?;
        debug!("Gc below round {}: dropped {} rounds", before_round, removed);
        Ok(removed)
    }

    pub fn bitmask(&self, lowest: Round, highest: Round) -> DagBitmask {
        self.snapshot().bitmask(lowest, highest)
    }
}
