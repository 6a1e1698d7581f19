// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use dag_consensus_traits::{Payload, PayloadClient, Transaction};
use parking_lot::Mutex;

/// Produces synthetic transactions of a fixed size on demand.
pub struct MockPayloadClient {
    txn_size: usize,
    txns_per_pull: u64,
    next: Mutex<u64>,
    /// `(max_txns, max_bytes)` of every pull.
    pulls: Mutex<Vec<(u64, u64)>>,
}

impl MockPayloadClient {
    pub fn new(txn_size: usize, txns_per_pull: u64) -> Self {
        Self {
            txn_size: txn_size.max(8),
            txns_per_pull,
            next: Mutex::new(0),
            pulls: Mutex::new(Vec::new()),
        }
    }

    pub fn pulls(&self) -> Vec<(u64, u64)> {
        self.pulls.lock().clone()
    }

    pub fn last_pull(&self) -> Option<(u64, u64)> {
        self.pulls.lock().last().copied()
    }
}

impl Default for MockPayloadClient {
    fn default() -> Self {
        Self::new(32, 10)
    }
}

#[async_trait]
impl PayloadClient for MockPayloadClient {
    async fn pull_payload(&self, max_txns: u64, max_bytes: u64) -> anyhow::Result<Payload> {
        self.pulls.lock().push((max_txns, max_bytes));
        let by_bytes = max_bytes / self.txn_size as u64;
        let count = self.txns_per_pull.min(max_txns).min(by_bytes);

        let mut next = self.next.lock();
        let transactions = (0..count)
            .map(|_| {
                let mut bytes = vec![0u8; self.txn_size];
                bytes[..8].copy_from_slice(&next.to_le_bytes());
                *next += 1;
                Transaction(bytes)
            })
            .collect();
        Ok(Payload::new(transactions))
    }
}
