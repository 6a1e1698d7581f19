// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! DAG round driver.
//!
//! Runs the local validator through one round at a time:
//!
//! ```text
//! Open -> Proposing -> Broadcasting -> AwaitingCertificate -> Certified -> RoundAdvance
//!   ^                                                                          |
//!   +--------------------------------------------------------------------------+
//! ```
//!
//! The driver only composes the other components. Voting happens in the
//! handlers, ordering in the [`DagInserter`], catch-up in the fetch service.

use super::{handler::DagHandler, inserter::DagInserter, store::DagSnapshot};
use crate::{
    broadcast::{BroadcastError, CertifiedAckAggregator, ReliableBroadcast, VoteAggregator},
    crypto::ValidatorSigner,
    epoch::EpochContext,
    health::HealthBackoff,
};
use dag_consensus_traits::{
    CertifiedNode, CertifiedNodeMsg, DagMessage, Node, NodeCertificate, NodeId, NodeMsg, Payload,
    PayloadClient, Round,
};
use log::{debug, info, warn};
use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Configuration for the DAG driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DagDriverConfig {
    /// Window size for DAG retention
    pub window_size: u64,
    /// Bound on waiting for the payload client
    pub payload_poll_timeout_ms: u64,
    /// Bound on waiting for the previous round's anchor
    pub adaptive_wait_time_ms: u64,
}

impl Default for DagDriverConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            payload_poll_timeout_ms: 50,
            adaptive_wait_time_ms: 300,
        }
    }
}

impl DagDriverConfig {
    pub fn payload_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.payload_poll_timeout_ms)
    }

    pub fn adaptive_wait_time(&self) -> Duration {
        Duration::from_millis(self.adaptive_wait_time_ms)
    }

    /// Rounds kept in the store.
    pub fn retained_rounds(&self) -> u64 {
        self.window_size.saturating_mul(3)
    }
}

/// Phase of the local validator in its current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundState {
    Open(Round),
    Proposing(Round),
    Broadcasting(Round),
    AwaitingCertificate(Round),
    Certified(Round),
    RoundAdvance(Round),
}

impl RoundState {
    pub fn round(&self) -> Round {
        match self {
            RoundState::Open(r)
            | RoundState::Proposing(r)
            | RoundState::Broadcasting(r)
            | RoundState::AwaitingCertificate(r)
            | RoundState::Certified(r)
            | RoundState::RoundAdvance(r) => *r,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RoundState::Open(_) => "open",
            RoundState::Proposing(_) => "proposing",
            RoundState::Broadcasting(_) => "broadcasting",
            RoundState::AwaitingCertificate(_) => "awaiting_certificate",
            RoundState::Certified(_) => "certified",
            RoundState::RoundAdvance(_) => "round_advance",
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.round())
    }
}

/// Outcome of waiting on the DAG.
enum Wait {
    Ready,
    Cancelled,
}

/// Resolves when `ready` holds on the current snapshot.
async fn wait_until(
    inserter: &DagInserter,
    versions: &mut watch::Receiver<u64>,
    cancel: &CancellationToken,
    ready: impl Fn(&DagSnapshot) -> bool,
) -> Wait {
    loop {
        if ready(&inserter.dag().snapshot()) {
            return Wait::Ready;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Wait::Cancelled,
            changed = versions.changed() => {
                if changed.is_err() {
                    return Wait::Cancelled;
                }
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Drives local proposals round by round.
pub struct DagDriver {
    epoch: Arc<EpochContext>,
    signer: ValidatorSigner,
    inserter: Arc<DagInserter>,
    broadcast: ReliableBroadcast,
    health: Arc<HealthBackoff>,
    payload_client: Arc<dyn PayloadClient>,
    handler: Arc<DagHandler>,
    config: DagDriverConfig,
    state: watch::Sender<RoundState>,
    /// Phase-2 broadcasts still running, by round.
    certified_broadcasts: BTreeMap<Round, CancellationToken>,
    current_round: Round,
    /// Last round to propose in; the driver idles afterwards.
    round_limit: Option<Round>,
}

impl DagDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        epoch: Arc<EpochContext>,
        signer: ValidatorSigner,
        inserter: Arc<DagInserter>,
        broadcast: ReliableBroadcast,
        health: Arc<HealthBackoff>,
        payload_client: Arc<dyn PayloadClient>,
        handler: Arc<DagHandler>,
        config: DagDriverConfig,
    ) -> Self {
        let (state, _) = watch::channel(RoundState::Open(1));
        Self {
            epoch,
            signer,
            inserter,
            broadcast,
            health,
            payload_client,
            handler,
            config,
            state,
            certified_broadcasts: BTreeMap::new(),
            current_round: 1,
            round_limit: None,
        }
    }

    /// Stop proposing after `round`. Certified broadcasts keep running until
    /// the driver is cancelled.
    pub fn with_round_limit(mut self, round: Round) -> Self {
        self.round_limit = Some(round);
        self
    }

    pub fn state(&self) -> RoundState {
        *self.state.borrow()
    }

    /// Follow the state after the driver has been moved into its task.
    pub fn state_receiver(&self) -> watch::Receiver<RoundState> {
        self.state.subscribe()
    }

    pub fn current_round(&self) -> Round {
        self.current_round
    }

    fn set_state(&self, state: RoundState) {
        debug!("Validator {} -> {}", self.signer.author(), state);
        self.state.send_replace(state);
    }

    /// Run rounds until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(
            "Validator {} starting in epoch {}",
            self.signer.author(),
            self.epoch.epoch()
        );
        while !cancel.is_cancelled() {
            let round = self.open_round();
            if self.round_limit.is_some_and(|limit| round > limit) {
                info!(
                    "Validator {} reached its round limit, idling",
                    self.signer.author()
                );
                cancel.cancelled().await;
                break;
            }
            if !self.run_round(round, &cancel).await {
                break;
            }
        }
        for (_, token) in std::mem::take(&mut self.certified_broadcasts) {
            token.cancel();
        }
        info!("Validator {} stopped", self.signer.author());
        Ok(())
    }

    /// Pick the round to propose in, jumping ahead after catch-up.
    fn open_round(&mut self) -> Round {
        let highest_quorum = self.inserter.dag().snapshot().highest_quorum_round();
        let round = self.current_round.max(highest_quorum + 1);
        if round > self.current_round + 1 {
            info!(
                "Validator {} jumping from round {} to {}",
                self.signer.author(),
                self.current_round,
                round
            );
        }
        self.current_round = round;
        self.set_state(RoundState::Open(round));
        round
    }

    /// One pass through the round state machine. Returns false when
    /// cancelled.
    async fn run_round(&mut self, round: Round, cancel: &CancellationToken) -> bool {
        self.set_state(RoundState::Proposing(round));
        let node = self.create_node(round).await;
        let id = node.id();

        self.set_state(RoundState::Broadcasting(round));
        let certificate = match self.certify(node.clone(), cancel).await {
            Some(Some(certificate)) => certificate,
            // superseded: the rest of the validators already moved on
            Some(None) => return true,
            None => return false,
        };

        self.set_state(RoundState::Certified(round));
        let certified = CertifiedNode::new(node, certificate);
        if let Err(e) = self.inserter.insert(certified.clone()) {
            warn!("Failed to insert own node {}: {}", id, e);
        }
        self.spawn_certified_broadcast(certified, cancel);

        self.set_state(RoundState::RoundAdvance(round));
        if !self.advance(round, cancel).await {
            return false;
        }
        self.gc(round);
        self.current_round = round + 1;
        true
    }

    async fn create_node(&self, round: Round) -> Node {
        let limits = self.health.calculate_payload_limits(round);
        let payload = match tokio::time::timeout(
            self.config.payload_poll_timeout(),
            self.payload_client
                .pull_payload(limits.max_txns, limits.max_bytes),
        )
        .await
        {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                warn!("Payload pull failed: {:#}", e);
                Payload::empty()
            }
            Err(_) => Payload::empty(),
        };

        let snapshot = self.inserter.dag().snapshot();
        let strong_links = if round > 1 {
            snapshot.certified_ids(round - 1)
        } else {
            vec![]
        };
        let weak_links = self.weak_links(&snapshot, round);
        Node::new(
            self.epoch.epoch(),
            round,
            self.signer.author(),
            now_ms(),
            payload,
            strong_links,
            weak_links,
        )
    }

    /// Unordered nodes below the previous round that nothing links yet.
    fn weak_links(&self, snapshot: &DagSnapshot, round: Round) -> Vec<NodeId> {
        if round < 3 {
            return vec![];
        }
        let start = (round - 1)
            .saturating_sub(self.config.window_size)
            .max(snapshot.lowest_round())
            .max(1);
        (start..round - 1)
            .flat_map(|r| snapshot.round_nodes(r))
            .filter(|status| status.any_link_power() == Some(0))
            .map(|status| status.as_node().id())
            .collect()
    }

    /// Broadcast the node until a certificate forms. `Some(None)` when the
    /// round was superseded, `None` when cancelled.
    async fn certify(
        &self,
        node: Node,
        cancel: &CancellationToken,
    ) -> Option<Option<NodeCertificate>> {
        let round = node.round();
        let mut versions = self.inserter.dag().subscribe();
        let message = DagMessage::Node(NodeMsg { node: node.clone() });
        self.set_state(RoundState::AwaitingCertificate(round));
        loop {
            let aggregator = VoteAggregator::new(self.epoch.clone(), node.id());
            let result = tokio::select! {
                result = self.broadcast.multicast(message.clone(), aggregator, cancel) => result,
                wait = wait_until(&self.inserter, &mut versions, cancel, |s| {
                    s.highest_quorum_round() > round
                }) => match wait {
                    Wait::Ready => {
                        info!(
                            "Validator {} abandoning round {}: superseded",
                            self.signer.author(),
                            round
                        );
                        return Some(None);
                    }
                    Wait::Cancelled => return None,
                },
            };
            match result {
                Ok(certificate) => return Some(Some(certificate)),
                Err(BroadcastError::Cancelled) => return None,
                Err(BroadcastError::Exhausted) => {
                    warn!(
                        "No certificate for {} yet, rebroadcasting",
                        node.id()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.broadcast.config().backoff(1)) => {}
                    }
                }
            }
        }
    }

    fn spawn_certified_broadcast(&mut self, node: CertifiedNode, cancel: &CancellationToken) {
        let round = node.round();
        let token = cancel.child_token();
        self.certified_broadcasts.insert(round, token.clone());
        let broadcast = self.broadcast.clone();
        let aggregator =
            CertifiedAckAggregator::new(node.id(), self.epoch.authors().copied());
        let id = node.id();
        let message = DagMessage::CertifiedNode(CertifiedNodeMsg {
            certified_node: node,
        });
        tokio::spawn(async move {
            match broadcast.multicast(message, aggregator, &token).await {
                Ok(()) => debug!("{} acknowledged by all", id),
                Err(BroadcastError::Cancelled) => debug!("Stopped broadcasting {}", id),
                Err(e) => warn!("Certified broadcast of {} ended: {}", id, e),
            }
        });
    }

    /// Wait for a quorum of round `round`, then briefly for its anchor.
    async fn advance(&self, round: Round, cancel: &CancellationToken) -> bool {
        let mut versions = self.inserter.dag().subscribe();
        let epoch = self.epoch.clone();
        let quorum = wait_until(&self.inserter, &mut versions, cancel, |s| {
            epoch.quorum_satisfied(s.round_voting_power(round))
        })
        .await;
        if let Wait::Cancelled = quorum {
            return false;
        }

        let inserter = self.inserter.clone();
        let anchor = tokio::time::timeout(
            self.config.adaptive_wait_time(),
            wait_until(&self.inserter, &mut versions, cancel, move |_| {
                inserter.has_anchor(round)
            }),
        )
        .await;
        match anchor {
            Ok(Wait::Cancelled) => false,
            Ok(Wait::Ready) => true,
            Err(_) => {
                debug!("Proposing past round {} without its anchor", round);
                true
            }
        }
    }

    fn gc(&mut self, round: Round) {
        let before = (round + 1).saturating_sub(self.config.retained_rounds());
        if let Err(e) = self.inserter.gc(before) {
            warn!("Gc failed: {}", e);
        }
        let lowest = self.inserter.dag().lowest_round();
        self.handler.node_handler().gc(lowest);
        let kept = self.certified_broadcasts.split_off(&lowest);
        for (_, token) in std::mem::replace(&mut self.certified_broadcasts, kept) {
            token.cancel();
        }
    }
}
