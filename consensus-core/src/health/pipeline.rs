// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use dag_consensus_traits::NodeId;
use log::{info, warn};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

pub const MAX_LATENCY_SAMPLES: usize = 100;

/// Ordered batches awaiting execution beyond this count are dropped from
/// tracking, oldest first.
pub const MAX_PENDING_BATCHES: usize = 1_000;

/// Withholds votes while certification-to-execution latency is above the
/// configured limit.
///
/// Two inputs count: the latest completed sample, and the age of the oldest
/// batch that was ordered but has not executed yet. The second one keeps a
/// stalled executor from looking healthy just because it stopped reporting.
pub struct PipelineBackoff {
    limit: Duration,
    samples: Mutex<VecDeque<Duration>>,
    /// Anchor of each in-flight batch with its certification time, in
    /// ordering order.
    pending: Mutex<VecDeque<(NodeId, Instant)>>,
}

impl PipelineBackoff {
    pub fn new(limit_ms: u64) -> Self {
        Self {
            limit: Duration::from_millis(limit_ms),
            samples: Mutex::new(VecDeque::with_capacity(MAX_LATENCY_SAMPLES)),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Append a sample, evicting the oldest once the history is full.
    pub fn record_latency(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        let was_lagging = samples.back().is_some_and(|l| *l > self.limit);
        if samples.len() == MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(latency);
        let lagging = latency > self.limit;
        if lagging && !was_lagging {
            warn!(
                "Pipeline latency {:?} above {:?}, withholding votes",
                latency, self.limit
            );
        } else if !lagging && was_lagging {
            info!("Pipeline latency {:?} recovered", latency);
        }
    }

    /// Start tracking the batch committed by `anchor`, certified at
    /// `certified_at`.
    pub fn batch_ordered(&self, anchor: NodeId, certified_at: Instant) {
        let evicted = {
            let mut pending = self.pending.lock();
            let evicted = if pending.len() == MAX_PENDING_BATCHES {
                pending.pop_front()
            } else {
                None
            };
            pending.push_back((anchor, certified_at));
            evicted
        };
        if let Some((anchor, certified_at)) = evicted {
            warn!(
                "Dropping latency tracking for batch {} after {} pending batches",
                anchor, MAX_PENDING_BATCHES
            );
            self.record_latency(certified_at.elapsed());
        }
    }

    /// Stop tracking the batch committed by `anchor` and record its latency.
    /// Returns `None` for a batch that is not tracked.
    pub fn batch_executed(&self, anchor: &NodeId) -> Option<Duration> {
        let certified_at = {
            let mut pending = self.pending.lock();
            let position = pending.iter().position(|(id, _)| id == anchor)?;
            pending.remove(position)?.1
        };
        let latency = certified_at.elapsed();
        self.record_latency(latency);
        Some(latency)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Time since the certification of the oldest batch still awaiting
    /// execution.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.pending
            .lock()
            .iter()
            .map(|(_, certified_at)| certified_at.elapsed())
            .max()
    }

    pub fn latest_latency(&self) -> Option<Duration> {
        self.samples.lock().back().copied()
    }

    pub fn num_samples(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn stop_voting(&self) -> bool {
        self.latest_latency().is_some_and(|l| l > self.limit)
            || self.oldest_pending_age().is_some_and(|age| age > self.limit)
    }
}
