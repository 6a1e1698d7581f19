// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Hand-off from ordering to the execution pipeline.
//!
//! The order rule pushes every [`OrderedBatch`] through an
//! [`OrderedBatchAdapter`]. [`ChannelOrderedAdapter`] forwards batches over an
//! unbounded channel to whatever executes them, and [`LatencyTracker`] feeds
//! the time between an anchor's certification and the execution of its batch
//! back into the health monitor.

use crate::{dag::DagStore, health::PipelineBackoff};
use anyhow::anyhow;
use dag_consensus_traits::{NodeId, OrderedBatch, OrderedBatchAdapter};
use log::{trace, warn};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

/// Statistics for ordered output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Batches handed to the pipeline
    pub batches: u64,
    /// Certified nodes across all batches
    pub nodes: u64,
    pub transactions: u64,
    /// Highest commit index handed over
    pub last_commit_index: Option<u64>,
}

/// Tracks batches between ordering and execution.
///
/// Latency is counted from the moment the anchor entered the local store.
pub struct LatencyTracker {
    backoff: Arc<PipelineBackoff>,
    dag: Arc<DagStore>,
}

impl LatencyTracker {
    pub fn new(backoff: Arc<PipelineBackoff>, dag: Arc<DagStore>) -> Self {
        Self { backoff, dag }
    }

    pub fn on_ordered(&self, anchor: &NodeId) {
        let certified_at = self
            .dag
            .snapshot()
            .get_status_by_id(anchor)
            .map(|status| status.inserted_at())
            .unwrap_or_else(Instant::now);
        self.backoff.batch_ordered(anchor.clone(), certified_at);
    }

    /// Record the latency of the batch committed by `anchor`. Returns the
    /// latency, or `None` for a batch this tracker never saw.
    pub fn on_executed(&self, anchor: &NodeId) -> Option<Duration> {
        self.backoff.batch_executed(anchor)
    }

    /// Report an externally measured latency.
    pub fn report(&self, latency: Duration) {
        self.backoff.record_latency(latency);
    }

    pub fn in_flight(&self) -> usize {
        self.backoff.num_pending()
    }
}

/// Adapter that forwards ordered batches to a channel.
pub struct ChannelOrderedAdapter {
    sender: mpsc::UnboundedSender<OrderedBatch>,
    stats: Mutex<PipelineStats>,
    latency: Option<Arc<LatencyTracker>>,
}

impl ChannelOrderedAdapter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrderedBatch>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                stats: Mutex::new(PipelineStats::default()),
                latency: None,
            },
            receiver,
        )
    }

    pub fn with_latency_tracker(mut self, tracker: Arc<LatencyTracker>) -> Self {
        self.latency = Some(tracker);
        self
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }
}

impl OrderedBatchAdapter for ChannelOrderedAdapter {
    fn on_ordered_batch(&self, batch: OrderedBatch) -> anyhow::Result<()> {
        {
            let mut stats = self.stats.lock();
            if let Some(last) = stats.last_commit_index {
                if batch.first_commit_index != last + 1 {
                    warn!(
                        "Commit index gap: expected {}, got {}",
                        last + 1,
                        batch.first_commit_index
                    );
                }
            }
            stats.batches += 1;
            stats.nodes += batch.nodes.len() as u64;
            stats.transactions += batch.num_transactions() as u64;
            if !batch.nodes.is_empty() {
                stats.last_commit_index = Some(batch.last_commit_index());
            }
        }
        if let Some(tracker) = &self.latency {
            tracker.on_ordered(&batch.anchor);
        }
        trace!(
            "Forwarding batch for anchor {} ({} nodes)",
            batch.anchor,
            batch.nodes.len()
        );
        self.sender
            .send(batch)
            .map_err(|_| anyhow!("ordered batch receiver dropped"))
    }
}
