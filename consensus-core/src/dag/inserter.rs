// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{ordering::OrderRule, store::DagStore};
use dag_consensus_traits::{CertifiedNode, DagError, Round};
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

/// Single entry point for DAG mutations that may commit anchors.
///
/// Insertion and the order rule run under one lock, so every insertion is
/// followed by an ordering pass over a snapshot that contains it.
pub struct DagInserter {
    dag: Arc<DagStore>,
    order_rule: Mutex<OrderRule>,
}

impl DagInserter {
    pub fn new(dag: Arc<DagStore>, order_rule: OrderRule) -> Self {
        Self {
            dag,
            order_rule: Mutex::new(order_rule),
        }
    }

    pub fn dag(&self) -> &Arc<DagStore> {
        &self.dag
    }

    /// Insert one certified node and order whatever it unlocks.
    pub fn insert(&self, node: CertifiedNode) -> Result<bool, DagError> {
        let mut order_rule = self.order_rule.lock();
        let inserted = self.dag.insert(node)?;
        if inserted {
            Self::run_order_rule(&mut order_rule);
        }
        Ok(inserted)
    }

    /// Insert a causally closed batch atomically, then order.
    pub fn insert_batch(&self, nodes: Vec<CertifiedNode>) -> Result<usize, DagError> {
        let mut order_rule = self.order_rule.lock();
        let inserted = self.dag.insert_batch(nodes)?;
        if inserted > 0 {
            Self::run_order_rule(&mut order_rule);
        }
        Ok(inserted)
    }

    fn run_order_rule(order_rule: &mut OrderRule) {
        if let Err(e) = order_rule.process_all() {
            warn!("Ordering failed: {}", e);
        }
    }

    pub fn lowest_unordered_anchor_round(&self) -> Round {
        self.order_rule.lock().lowest_unordered_anchor_round()
    }

    pub fn ordering_lower_bound(&self) -> Round {
        self.order_rule.lock().ordering_lower_bound()
    }

    pub fn next_commit_index(&self) -> u64 {
        self.order_rule.lock().next_commit_index()
    }

    /// Whether the elected anchor of `round` is present.
    pub fn has_anchor(&self, round: Round) -> bool {
        let author = self.order_rule.lock().anchor_election().get_anchor(round);
        self.dag.get_node(round, &author).is_some()
    }

    /// Garbage collect rounds below `before_round`, clamped to what
    /// ordering may still reach.
    pub fn gc(&self, before_round: Round) -> Result<usize, DagError> {
        let order_rule = self.order_rule.lock();
        let bound = before_round.min(order_rule.ordering_lower_bound());
        self.dag.gc(bound)
    }
}
