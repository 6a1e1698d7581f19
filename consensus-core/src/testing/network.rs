// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use dag_consensus_traits::{Author, DagMessage, DagNetworkSender, RpcError, RpcHandler};
use log::trace;
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<Author, Arc<dyn RpcHandler>>,
    offline: HashSet<Author>,
}

/// Routes RPCs between handlers registered in the same process.
///
/// Every request and response goes through the bincode codec, so anything
/// that would not survive the wire fails here too. An offline validator can
/// neither send nor receive.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
    rpcs: Arc<AtomicU64>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, author: Author, handler: Arc<dyn RpcHandler>) {
        self.state.write().handlers.insert(author, handler);
    }

    pub fn set_online(&self, author: Author, online: bool) {
        let mut state = self.state.write();
        if online {
            state.offline.remove(&author);
        } else {
            state.offline.insert(author);
        }
    }

    pub fn is_online(&self, author: &Author) -> bool {
        !self.state.read().offline.contains(author)
    }

    pub fn sender(&self, from: Author) -> InMemorySender {
        InMemorySender {
            network: self.clone(),
            from,
        }
    }

    /// RPCs delivered to a handler so far.
    pub fn rpc_count(&self) -> u64 {
        self.rpcs.load(Ordering::Relaxed)
    }

    fn route(&self, from: &Author, to: &Author) -> Option<Arc<dyn RpcHandler>> {
        let state = self.state.read();
        if state.offline.contains(from) || state.offline.contains(to) {
            return None;
        }
        state.handlers.get(to).cloned()
    }
}

/// [`DagNetworkSender`] of one validator on an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemorySender {
    network: InMemoryNetwork,
    from: Author,
}

#[async_trait]
impl DagNetworkSender for InMemorySender {
    async fn send_rpc(
        &self,
        to: Author,
        message: DagMessage,
        timeout: Duration,
    ) -> Result<DagMessage, RpcError> {
        let handler = self
            .network
            .route(&self.from, &to)
            .ok_or(RpcError::Unreachable(to))?;
        let request = DagMessage::from_bytes(&message.to_bytes()?)?;
        trace!("{} -> {}: {}", self.from, to, request);
        self.network.rpcs.fetch_add(1, Ordering::Relaxed);

        let response = tokio::time::timeout(timeout, handler.process_rpc(self.from, request))
            .await
            .map_err(|_| RpcError::Timeout {
                peer: to,
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| RpcError::remote(to, &e))?;
        // the peer may have gone offline while handling
        if self.network.route(&self.from, &to).is_none() {
            return Err(RpcError::Unreachable(to));
        }
        DagMessage::from_bytes(&response.to_bytes()?)
    }
}
