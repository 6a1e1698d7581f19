// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Reliable broadcast of a message to every validator.
//!
//! A broadcast sends one request to each validator and feeds the responses
//! into a [`BroadcastStatus`] until it yields an aggregate. Peers that have
//! not answered usefully are retried in waves: the first wave reaches every
//! validator, each later wave reaches `min_fanout << (wave - 1)` of the
//! remaining peers after an exponentially growing backoff. A peer never has
//! more than one request in flight.

mod aggregators;

pub use aggregators::{CertifiedAckAggregator, VoteAggregator};

use dag_consensus_traits::{Author, DagError, DagMessage, DagNetworkSender, RpcError};
use futures::{stream::FuturesUnordered, StreamExt};
use log::{debug, trace, warn};
use std::{collections::HashSet, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for reliable broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Timeout of a single RPC
    pub rpc_timeout_ms: u64,
    /// Delay before the first retry wave
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
    /// Peers targeted by the first retry wave
    pub min_fanout: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 1_000,
            backoff_base_ms: 100,
            max_backoff_ms: 3_000,
            min_fanout: 1,
        }
    }
}

impl BroadcastConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Delay before retry wave `wave` (1-based).
    pub fn backoff(&self, wave: u32) -> Duration {
        let factor = 1u64 << wave.saturating_sub(1).min(32);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    /// Peers targeted by retry wave `wave` (1-based).
    pub fn fanout(&self, wave: u32) -> usize {
        let factor = 1usize << wave.saturating_sub(1).min(32);
        self.min_fanout.max(1).saturating_mul(factor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("Broadcast cancelled")]
    Cancelled,

    #[error("Every peer answered but the aggregate is incomplete")]
    Exhausted,
}

/// Accumulates responses to one broadcast.
pub trait BroadcastStatus: Send {
    type Aggregated: Send;

    /// Feed the response of `peer`. `Ok(Some(_))` completes the broadcast;
    /// an error marks the response as useless and the peer is not retried.
    fn add(
        &mut self,
        peer: Author,
        response: DagMessage,
    ) -> Result<Option<Self::Aggregated>, DagError>;
}

type RpcFuture = Pin<Box<dyn Future<Output = (Author, Result<DagMessage, RpcError>)> + Send>>;

/// Broadcasts requests to a fixed set of receivers.
#[derive(Clone)]
pub struct ReliableBroadcast {
    receivers: Vec<Author>,
    sender: Arc<dyn DagNetworkSender>,
    config: BroadcastConfig,
}

impl ReliableBroadcast {
    pub fn new(
        receivers: Vec<Author>,
        sender: Arc<dyn DagNetworkSender>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            receivers,
            sender,
            config,
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    fn send(&self, peer: Author, message: DagMessage) -> RpcFuture {
        let sender = self.sender.clone();
        let timeout = self.config.rpc_timeout();
        Box::pin(async move {
            let result = tokio::time::timeout(timeout, sender.send_rpc(peer, message, timeout))
                .await
                .unwrap_or_else(|_| {
                    Err(RpcError::Timeout {
                        peer,
                        timeout_ms: timeout.as_millis() as u64,
                    })
                });
            (peer, result)
        })
    }

    /// Send `message` to every receiver until `status` aggregates.
    pub async fn multicast<S: BroadcastStatus>(
        &self,
        message: DagMessage,
        mut status: S,
        cancel: &CancellationToken,
    ) -> Result<S::Aggregated, BroadcastError> {
        let name = message.name();
        let mut remaining: Vec<Author> = self.receivers.clone();
        let mut in_flight: HashSet<Author> = HashSet::new();
        let mut rpcs: FuturesUnordered<RpcFuture> = FuturesUnordered::new();
        let mut wave = 0;
        let mut fanout = remaining.len();
        let retry = tokio::time::sleep(self.config.backoff(1));
        tokio::pin!(retry);

        loop {
            let targets: Vec<Author> = remaining
                .iter()
                .filter(|peer| !in_flight.contains(*peer))
                .take(fanout)
                .copied()
                .collect();
            fanout = 0;
            for peer in targets {
                in_flight.insert(peer);
                rpcs.push(self.send(peer, message.clone()));
            }
            if remaining.is_empty() {
                return Err(BroadcastError::Exhausted);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BroadcastError::Cancelled),
                Some((peer, result)) = rpcs.next(), if !rpcs.is_empty() => {
                    in_flight.remove(&peer);
                    match result {
                        Ok(response) => {
                            match status.add(peer, response) {
                                Ok(Some(aggregated)) => {
                                    debug!("{} complete after {} waves", name, wave);
                                    return Ok(aggregated);
                                }
                                Ok(None) => {}
                                Err(e) => warn!("Useless {} response from {}: {}", name, peer, e),
                            }
                            remaining.retain(|p| p != &peer);
                        }
                        Err(e) if e.is_rejection() => {
                            warn!("{} rejected by {}: {}", name, peer, e);
                            remaining.retain(|p| p != &peer);
                        }
                        Err(e) => trace!("{} to {} failed, will retry: {}", name, peer, e),
                    }
                }
                _ = &mut retry => {
                    wave += 1;
                    fanout = self.config.fanout(wave);
                    retry.as_mut().reset(Instant::now() + self.config.backoff(wave + 1));
                    trace!(
                        "{} retry wave {}: {} peers outstanding",
                        name, wave, remaining.len()
                    );
                }
            }
        }
    }
}
