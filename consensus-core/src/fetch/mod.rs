// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Catch-up of missing certified nodes.
//!
//! A fetch asks peers for a set of target nodes plus whatever ancestry the
//! local DAG lacks. Responses are all-or-nothing: a response is inserted only
//! if it holds every target, every certificate verifies and the nodes are
//! causally closed against the local store.

mod service;

pub use service::{FetchRequester, FetchService};

use crate::{
    dag::{validation::verify_certified_node, DagInserter, DagStore},
    epoch::EpochContext,
};
use dag_consensus_traits::{
    Author, CertifiedNode, DagError, DagMessage, DagNetworkSender, FetchRequest, FetchResponse,
    NodeId, RpcError,
};
use futures::{stream::FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

/// Configuration for fetching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchConfig {
    /// Fetches allowed to run at once; the rest queue in arrival order
    pub max_concurrent_fetches: usize,
    pub min_concurrent_responders: usize,
    pub max_concurrent_responders: usize,
    /// Backoff unit between responder waves
    pub retry_backoff_ms: u64,
    pub rpc_timeout_ms: u64,
    pub window_size: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            min_concurrent_responders: 1,
            max_concurrent_responders: 4,
            retry_backoff_ms: 200,
            rpc_timeout_ms: 1_000,
            window_size: 10,
        }
    }
}

impl FetchConfig {
    /// Responders asked concurrently in wave `wave` (0-based).
    pub fn responders_in_wave(&self, wave: u32) -> usize {
        let doubled = self
            .min_concurrent_responders
            .max(1)
            .saturating_mul(1usize << wave.min(32));
        doubled.min(self.max_concurrent_responders.max(1))
    }

    /// Pause after wave `wave` (0-based).
    pub fn backoff(&self, wave: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(wave as u64 + 1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Inserted this many new nodes.
    Fetched(usize),
    /// The targets arrived through other means.
    AvailableLocally,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Fetch cancelled")]
    Cancelled,

    #[error("No responders to fetch from")]
    NoResponders,

    #[error("Fetch failed after asking {attempted} responders")]
    Exhausted { attempted: usize },

    #[error("Peer {0} does not hold the targets yet")]
    Pending(Author),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Invalid fetch response from {peer}: {error}")]
    InvalidResponse {
        peer: Author,
        #[source]
        error: DagError,
    },

    #[error("Fetch admission closed")]
    Closed,
}

/// Runs fetches under a global concurrency limit.
pub struct DagFetcher {
    epoch: Arc<EpochContext>,
    inserter: Arc<DagInserter>,
    sender: Arc<dyn DagNetworkSender>,
    permits: Arc<Semaphore>,
    config: FetchConfig,
}

impl DagFetcher {
    pub fn new(
        epoch: Arc<EpochContext>,
        inserter: Arc<DagInserter>,
        sender: Arc<dyn DagNetworkSender>,
        config: FetchConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));
        Self {
            epoch,
            inserter,
            sender,
            permits,
            config,
        }
    }

    /// Share an admission limit with other fetchers in the process.
    pub fn with_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = permits;
        self
    }

    pub fn permits(&self) -> &Arc<Semaphore> {
        &self.permits
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn dag(&self) -> &Arc<DagStore> {
        self.inserter.dag()
    }

    pub fn inserter(&self) -> &Arc<DagInserter> {
        &self.inserter
    }

    /// Fetch `targets` and their missing ancestry from `responders`.
    pub async fn fetch(
        &self,
        targets: &[NodeId],
        responders: &[Author],
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let dag = self.inserter.dag().clone();
        let mut versions = dag.subscribe();
        if dag.missing(targets).is_empty() {
            return Ok(FetchOutcome::AvailableLocally);
        }
        if responders.is_empty() {
            return Err(FetchError::NoResponders);
        }

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = wait_until_available(&dag, &mut versions, targets) => {
                return Ok(FetchOutcome::AvailableLocally);
            }
            permit = self.permits.acquire() => permit.map_err(|_| FetchError::Closed)?,
        };

        let mut next = 0;
        let mut wave = 0;
        while next < responders.len() {
            let width = self.config.responders_in_wave(wave);
            let peers = &responders[next..(next + width).min(responders.len())];
            next += peers.len();

            let request = self.build_request(targets);
            debug!(
                "Wave {}: asking {} peers for {} targets",
                wave,
                peers.len(),
                targets.len()
            );
            let mut rpcs: FuturesUnordered<_> = peers
                .iter()
                .map(|peer| self.request(*peer, request.clone()))
                .collect();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = wait_until_available(&dag, &mut versions, targets) => {
                        return Ok(FetchOutcome::AvailableLocally);
                    }
                    response = rpcs.next() => match response {
                        None => break,
                        Some((peer, Ok(nodes))) => match self.accept(peer, targets, nodes) {
                            Ok(inserted) => {
                                info!(
                                    "Fetched {} nodes from {} for {} targets",
                                    inserted, peer, targets.len()
                                );
                                return Ok(FetchOutcome::Fetched(inserted));
                            }
                            Err(e) => warn!("Discarding response: {}", e),
                        },
                        Some((peer, Err(e))) => debug!("No nodes from {}: {}", peer, e),
                    }
                }
            }

            if next < responders.len() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = wait_until_available(&dag, &mut versions, targets) => {
                        return Ok(FetchOutcome::AvailableLocally);
                    }
                    _ = tokio::time::sleep(self.config.backoff(wave)) => {}
                }
            }
            wave += 1;
        }

        if dag.missing(targets).is_empty() {
            return Ok(FetchOutcome::AvailableLocally);
        }
        Err(FetchError::Exhausted {
            attempted: responders.len(),
        })
    }

    fn build_request(&self, targets: &[NodeId]) -> FetchRequest {
        let snapshot = self.inserter.dag().snapshot();
        let lower_bound = snapshot.lowest_round().max(1);
        let highest = targets.iter().map(NodeId::round).max().unwrap_or(lower_bound);
        FetchRequest {
            epoch: self.epoch.epoch(),
            targets: targets.to_vec(),
            lower_bound,
            known: snapshot.bitmask(lower_bound, highest),
        }
    }

    async fn request(
        &self,
        peer: Author,
        request: FetchRequest,
    ) -> (Author, Result<Vec<CertifiedNode>, FetchError>) {
        let timeout = self.config.rpc_timeout();
        let response = tokio::time::timeout(
            timeout,
            self.sender
                .send_rpc(peer, DagMessage::FetchRequest(request), timeout),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RpcError::Timeout {
                peer,
                timeout_ms: timeout.as_millis() as u64,
            })
        });
        let result = match response {
            Ok(DagMessage::FetchResponse(FetchResponse::Nodes(nodes))) => Ok(nodes),
            Ok(DagMessage::FetchResponse(FetchResponse::Pending)) => Err(FetchError::Pending(peer)),
            Ok(other) => Err(RpcError::unexpected(format!(
                "expected FetchResponse, got {}",
                other.name()
            ))
            .into()),
            Err(e) => Err(e.into()),
        };
        (peer, result)
    }

    /// Validate a response as a whole and insert it atomically.
    fn accept(
        &self,
        peer: Author,
        targets: &[NodeId],
        nodes: Vec<CertifiedNode>,
    ) -> Result<usize, FetchError> {
        let invalid = |error| FetchError::InvalidResponse { peer, error };
        let snapshot = self.inserter.dag().snapshot();
        let ids: HashSet<NodeId> = nodes.iter().map(CertifiedNode::id).collect();

        let absent: Vec<NodeId> = snapshot
            .missing(targets)
            .into_iter()
            .filter(|target| !ids.contains(target))
            .collect();
        if !absent.is_empty() {
            return Err(invalid(DagError::MissingParents(absent)));
        }
        for node in &nodes {
            verify_certified_node(node, &self.epoch).map_err(invalid)?;
        }
        let unresolved: Vec<NodeId> = nodes
            .iter()
            .flat_map(|node| node.links())
            .filter(|link| {
                link.round() >= snapshot.lowest_round()
                    && !ids.contains(*link)
                    && !snapshot.exists(link)
            })
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            return Err(invalid(DagError::MissingParents(unresolved)));
        }
        self.inserter.insert_batch(nodes).map_err(invalid)
    }
}

/// Resolves once every target is present locally. Never resolves if the
/// store is dropped.
async fn wait_until_available(
    dag: &DagStore,
    versions: &mut watch::Receiver<u64>,
    targets: &[NodeId],
) {
    loop {
        if dag.missing(targets).is_empty() {
            return;
        }
        if versions.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_waves_double_up_to_max() {
        let config = FetchConfig {
            min_concurrent_responders: 1,
            max_concurrent_responders: 5,
            ..FetchConfig::default()
        };
        let widths: Vec<usize> = (0..5).map(|w| config.responders_in_wave(w)).collect();
        assert_eq!(widths, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_backoff_is_linear() {
        let config = FetchConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(600));
    }
}
