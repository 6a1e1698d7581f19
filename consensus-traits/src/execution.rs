// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Seams to the collaborators that feed and consume the DAG: the payload
//! source and the execution pipeline.

use crate::core::{Author, Epoch, Round};
use crate::dag::{CertifiedNode, NodeId, Payload};
use async_trait::async_trait;
use std::sync::Arc;

/// Nodes ordered by one anchor commit, in commit order with the anchor last.
#[derive(Clone, Debug)]
pub struct OrderedBatch {
    pub epoch: Epoch,
    pub anchor: NodeId,
    /// Commit index of `nodes[0]`; the rest follow consecutively.
    pub first_commit_index: u64,
    pub nodes: Vec<Arc<CertifiedNode>>,
    /// Elected authors of skipped anchor rounds since the previous commit.
    pub failed_authors: Vec<(Round, Author)>,
}

impl OrderedBatch {
    pub fn anchor_round(&self) -> Round {
        self.anchor.round()
    }

    pub fn last_commit_index(&self) -> u64 {
        self.first_commit_index + self.nodes.len().saturating_sub(1) as u64
    }

    pub fn num_transactions(&self) -> usize {
        self.nodes.iter().map(|n| n.node().payload().len()).sum()
    }
}

/// Sole consumer of ordering output.
pub trait OrderedBatchAdapter: Send + Sync + 'static {
    fn on_ordered_batch(&self, batch: OrderedBatch) -> anyhow::Result<()>;
}

/// Source of transactions for local proposals.
#[async_trait]
pub trait PayloadClient: Send + Sync + 'static {
    /// Return at most `max_txns` transactions totalling at most `max_bytes`.
    /// May wait for transactions; callers bound the wait.
    async fn pull_payload(&self, max_txns: u64, max_bytes: u64) -> anyhow::Result<Payload>;
}
