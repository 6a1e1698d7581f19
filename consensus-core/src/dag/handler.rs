// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Inbound RPC handlers.
//!
//! - [`NodeBroadcastHandler`] votes on proposed nodes.
//! - [`CertifiedNodeHandler`] inserts certified nodes and acknowledges them.
//! - [`FetchRequestHandler`] serves catch-up requests.
//!
//! [`DagHandler`] dispatches a [`DagMessage`] to the right one.

use super::{inserter::DagInserter, store::DagStore, validation::verify_node};
use crate::{crypto::ValidatorSigner, epoch::EpochContext, fetch::FetchRequester, health::HealthBackoff};
use async_trait::async_trait;
use dag_consensus_traits::{
    Author, CertifiedAck, CertifiedNode, DagError, DagMessage, FetchRequest, FetchResponse,
    Node, NodeId, Round, RpcError, RpcHandler, Vote,
};
use log::{debug, warn};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

/// Responders for a fetch: the peer that made us notice the gap first, then
/// every other validator except ourselves.
fn fetch_responders(epoch: &EpochContext, first: Author, local: Author) -> Vec<Author> {
    std::iter::once(first)
        .chain(epoch.authors().copied().filter(|a| *a != first))
        .filter(|a| *a != local)
        .collect()
}

/// Signs at most one vote per (round, author).
pub struct NodeBroadcastHandler {
    epoch: Arc<EpochContext>,
    dag: Arc<DagStore>,
    signer: ValidatorSigner,
    health: Arc<HealthBackoff>,
    fetch: FetchRequester,
    votes_by_round: Mutex<BTreeMap<Round, HashMap<Author, Vote>>>,
}

impl NodeBroadcastHandler {
    pub fn new(
        epoch: Arc<EpochContext>,
        dag: Arc<DagStore>,
        signer: ValidatorSigner,
        health: Arc<HealthBackoff>,
        fetch: FetchRequester,
    ) -> Self {
        Self {
            epoch,
            dag,
            signer,
            health,
            fetch,
            votes_by_round: Mutex::new(BTreeMap::new()),
        }
    }

    fn validate(&self, from: Author, node: &Node) -> Result<(), DagError> {
        verify_node(node, &self.epoch)?;
        if node.author() != &from {
            return Err(DagError::malformed(
                node.id(),
                format!("relayed by {}", from),
            ));
        }
        let config = self.health.config();
        let txns = node.payload().len() as u64;
        let bytes = node.payload().size() as u64;
        if txns > config.max_txns_per_round || bytes > config.max_payload_bytes_per_round {
            return Err(DagError::PayloadTooLarge {
                id: node.id(),
                txns,
                bytes,
            });
        }
        let lowest = self.dag.lowest_round();
        if node.round() < lowest {
            return Err(DagError::RoundPruned {
                round: node.round(),
                lowest,
            });
        }
        Ok(())
    }

    pub fn process(&self, from: Author, node: Node) -> Result<Vote, DagError> {
        self.validate(from, &node)?;

        if let Some(vote) = self
            .votes_by_round
            .lock()
            .get(&node.round())
            .and_then(|votes| votes.get(node.author()))
        {
            if vote.node_id() == &node.id() {
                return Ok(vote.clone());
            }
            return Err(DagError::Equivocation {
                round: node.round(),
                author: *node.author(),
            });
        }
        let snapshot = self.dag.snapshot();
        if let Some(existing) = snapshot.get_node(node.round(), node.author()) {
            if existing.digest() != node.digest() {
                return Err(DagError::Equivocation {
                    round: node.round(),
                    author: *node.author(),
                });
            }
        }

        let missing = snapshot.missing(node.links());
        if !missing.is_empty() {
            debug!(
                "{} misses {} parents, fetching",
                node.id(),
                missing.len()
            );
            let responders = fetch_responders(&self.epoch, from, self.signer.author());
            self.fetch.request(missing.clone(), responders, None);
            return Err(DagError::MissingParents(missing));
        }

        if self.health.stop_voting() {
            return Err(DagError::VotingPaused);
        }

        let mut votes = self.votes_by_round.lock();
        let round_votes = votes.entry(node.round()).or_default();
        if let Some(vote) = round_votes.get(node.author()) {
            // raced with a concurrent request for the same slot
            if vote.node_id() == &node.id() {
                return Ok(vote.clone());
            }
            return Err(DagError::Equivocation {
                round: node.round(),
                author: *node.author(),
            });
        }
        let vote = self.signer.vote(&node);
        round_votes.insert(*node.author(), vote.clone());
        debug!("Voted for {}", node.id());
        Ok(vote)
    }

    /// Forget votes below `round`.
    pub fn gc(&self, round: Round) {
        let mut votes = self.votes_by_round.lock();
        *votes = votes.split_off(&round);
    }

    pub fn voted_rounds(&self) -> usize {
        self.votes_by_round.lock().len()
    }
}

/// Inserts certified nodes from peers, fetching missing parents first.
pub struct CertifiedNodeHandler {
    epoch: Arc<EpochContext>,
    inserter: Arc<DagInserter>,
    fetch: FetchRequester,
    local: Author,
}

impl CertifiedNodeHandler {
    pub fn new(
        epoch: Arc<EpochContext>,
        inserter: Arc<DagInserter>,
        fetch: FetchRequester,
        local: Author,
    ) -> Self {
        Self {
            epoch,
            inserter,
            fetch,
            local,
        }
    }

    pub fn process(&self, from: Author, node: CertifiedNode) -> Result<CertifiedAck, DagError> {
        let ack = CertifiedAck {
            epoch: self.epoch.epoch(),
            node_id: node.id(),
            author: self.local,
        };
        match self.inserter.insert(node.clone()) {
            Ok(_) => Ok(ack),
            // already behind our window; nothing left to do with it
            Err(DagError::RoundPruned { .. }) => Ok(ack),
            Err(DagError::MissingParents(missing)) => {
                debug!(
                    "{} misses {} parents, fetching",
                    ack.node_id,
                    missing.len()
                );
                let responders = fetch_responders(&self.epoch, from, self.local);
                self.fetch.request(missing.clone(), responders, Some(node));
                Err(DagError::MissingParents(missing))
            }
            Err(e) => Err(e),
        }
    }
}

/// Serves certified nodes to peers that are catching up.
pub struct FetchRequestHandler {
    epoch: Arc<EpochContext>,
    dag: Arc<DagStore>,
}

impl FetchRequestHandler {
    pub fn new(epoch: Arc<EpochContext>, dag: Arc<DagStore>) -> Self {
        Self { epoch, dag }
    }

    /// The targets and every ancestor down to the request's lower bound that
    /// the requester does not report, parents first. `Pending` unless every
    /// target is held locally.
    pub fn process(&self, request: FetchRequest) -> Result<FetchResponse, DagError> {
        if request.epoch != self.epoch.epoch() {
            return Err(DagError::EpochMismatch {
                expected: self.epoch.epoch(),
                actual: request.epoch,
            });
        }
        let snapshot = self.dag.snapshot();
        let all_present = request
            .targets
            .iter()
            .all(|target| target.round() >= snapshot.lowest_round() && snapshot.exists(target));
        if !all_present {
            return Ok(FetchResponse::Pending);
        }

        let targets: HashSet<&NodeId> = request.targets.iter().collect();
        let mut seen = HashSet::new();
        let mut nodes: Vec<CertifiedNode> = Vec::new();
        for target in &request.targets {
            let reachable = snapshot.reachable(target, request.lower_bound, |status| {
                let node = status.as_node();
                let known = self
                    .epoch
                    .author_index(node.author())
                    .is_some_and(|index| request.known.has(node.round(), index));
                !known || targets.contains(&node.id())
            });
            for node in reachable {
                if seen.insert(node.id()) {
                    nodes.push(CertifiedNode::clone(&node));
                }
            }
        }
        nodes.sort_by(|a, b| (a.round(), a.author()).cmp(&(b.round(), b.author())));
        debug!(
            "Serving {} nodes for {} targets",
            nodes.len(),
            request.targets.len()
        );
        Ok(FetchResponse::Nodes(nodes))
    }
}

/// Dispatches inbound requests.
pub struct DagHandler {
    node: NodeBroadcastHandler,
    certified: CertifiedNodeHandler,
    fetch: FetchRequestHandler,
}

impl DagHandler {
    pub fn new(
        node: NodeBroadcastHandler,
        certified: CertifiedNodeHandler,
        fetch: FetchRequestHandler,
    ) -> Self {
        Self {
            node,
            certified,
            fetch,
        }
    }

    pub fn node_handler(&self) -> &NodeBroadcastHandler {
        &self.node
    }

    pub fn handle(&self, from: Author, message: DagMessage) -> Result<DagMessage, DagError> {
        let name = message.name();
        let result = match message {
            DagMessage::Node(msg) => self.node.process(from, msg.node).map(DagMessage::Vote),
            DagMessage::CertifiedNode(msg) => self
                .certified
                .process(from, msg.certified_node)
                .map(DagMessage::CertifiedAck),
            DagMessage::FetchRequest(request) => {
                self.fetch.process(request).map(DagMessage::FetchResponse)
            }
            other => Err(RpcError::unexpected(format!("{} is not a request", other.name())).into()),
        };
        if let Err(e) = &result {
            if e.is_protocol_violation() {
                warn!("Rejected {} from {}: {}", name, from, e);
            } else {
                debug!("{} from {} not served: {}", name, from, e);
            }
        }
        result
    }
}

#[async_trait]
impl RpcHandler for DagHandler {
    async fn process_rpc(&self, from: Author, message: DagMessage) -> Result<DagMessage, DagError> {
        self.handle(from, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dag::{
            ordering::{OrderRule, OrderingConfig, RoundRobinAnchorElection},
            store::DagStoreConfig,
            testing::{create_test_dag, TestValidators},
        },
        fetch::{DagFetcher, FetchConfig, FetchService},
        health::HealthConfig,
        pipeline::ChannelOrderedAdapter,
        testing::InMemoryNetwork,
    };
    use dag_consensus_traits::{DagBitmask, ErrorKind, Payload, Transaction};
    use std::time::Duration;

    struct Fixture {
        validators: TestValidators,
        inserter: Arc<DagInserter>,
        health: Arc<HealthBackoff>,
        handler: DagHandler,
    }

    /// Handlers for validator 0. The fetch service is never started, so
    /// fetch requests are only queued.
    fn fixture() -> Fixture {
        let validators = TestValidators::new(4);
        let epoch = validators.epoch_context();
        let dag = Arc::new(DagStore::new(epoch.clone(), DagStoreConfig::default()));
        let (adapter, _rx) = ChannelOrderedAdapter::new();
        let rule = OrderRule::new(
            epoch.clone(),
            dag.clone(),
            Arc::new(RoundRobinAnchorElection::new(&epoch)),
            Arc::new(adapter),
            OrderingConfig::default(),
        );
        let inserter = Arc::new(DagInserter::new(dag.clone(), rule));
        let health = Arc::new(HealthBackoff::new(
            dag.clone(),
            HealthConfig {
                max_txns_per_round: 3,
                ..HealthConfig::default()
            },
        ));
        let network = InMemoryNetwork::new();
        let fetcher = Arc::new(DagFetcher::new(
            epoch.clone(),
            inserter.clone(),
            Arc::new(network.sender(validators.author(0))),
            FetchConfig::default(),
        ));
        let (_service, requester) = FetchService::new(fetcher);
        let local = validators.author(0);
        let handler = DagHandler::new(
            NodeBroadcastHandler::new(
                epoch.clone(),
                dag.clone(),
                validators.signer(0).clone(),
                health.clone(),
                requester.clone(),
            ),
            CertifiedNodeHandler::new(epoch.clone(), inserter.clone(), requester, local),
            FetchRequestHandler::new(epoch, dag),
        );
        Fixture {
            validators,
            inserter,
            health,
            handler,
        }
    }

    fn propose(f: &Fixture, node: Node) -> Result<DagMessage, DagError> {
        let from = *node.author();
        f.handler.handle(
            from,
            DagMessage::Node(dag_consensus_traits::NodeMsg { node }),
        )
    }

    #[test]
    fn test_votes_once_per_round_and_author() {
        let f = fixture();
        let node = f.validators.node(1, 1, vec![]);
        let first = propose(&f, node.clone()).unwrap();
        let again = propose(&f, node).unwrap();
        assert_eq!(first, again);
        let DagMessage::Vote(vote) = first else {
            panic!("expected a vote");
        };
        assert_eq!(vote.author(), &f.validators.author(0));
        assert!(vote.verify_signature().is_ok());

        let equivocation = f.validators.builder().round(1).author(1).timestamp(7).build();
        assert!(matches!(
            propose(&f, equivocation),
            Err(DagError::Equivocation { round: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_parent_quorum_not_met() {
        let f = fixture();
        let parents = create_test_dag(&f.validators, 1);
        for node in &parents {
            f.inserter.insert(node.clone()).unwrap();
        }
        let ids: Vec<_> = parents[..2].iter().map(CertifiedNode::id).collect();
        let node = f.validators.node(2, 1, ids);
        let err = propose(&f, node).unwrap_err();
        assert!(matches!(err, DagError::ParentQuorumNotMet { .. }));
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let f = fixture();
        let payload = Payload::new((0..4).map(|i| Transaction(vec![i])).collect());
        let node = f.validators.builder().round(1).author(2).payload(payload).build();
        assert!(matches!(
            propose(&f, node),
            Err(DagError::PayloadTooLarge { txns: 4, .. })
        ));
    }

    #[test]
    fn test_rejects_relayed_node() {
        let f = fixture();
        let node = f.validators.node(1, 1, vec![]);
        let result = f.handler.handle(
            f.validators.author(2),
            DagMessage::Node(dag_consensus_traits::NodeMsg { node }),
        );
        assert!(matches!(result, Err(DagError::MalformedNode { .. })));
    }

    #[test]
    fn test_missing_parents_requests_fetch() {
        let f = fixture();
        let parents: Vec<_> = create_test_dag(&f.validators, 1)
            .iter()
            .map(CertifiedNode::id)
            .collect();
        let node = f.validators.node(2, 1, parents);
        assert!(matches!(
            propose(&f, node),
            Err(DagError::MissingParents(missing)) if missing.len() == 4
        ));
    }

    #[test]
    fn test_withholds_votes_while_pipeline_lags() {
        let f = fixture();
        f.health
            .pipeline()
            .record_latency(Duration::from_secs(60));
        let node = f.validators.node(1, 1, vec![]);
        let err = propose(&f, node.clone()).unwrap_err();
        assert_eq!(err, DagError::VotingPaused);
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        f.health.pipeline().record_latency(Duration::from_millis(1));
        assert!(propose(&f, node).is_ok());
    }

    #[test]
    fn test_vote_state_gc() {
        let f = fixture();
        let dag = create_test_dag(&f.validators, 1);
        for node in &dag {
            f.inserter.insert(node.clone()).unwrap();
        }
        propose(&f, f.validators.node(1, 1, vec![])).unwrap();
        let ids: Vec<_> = dag.iter().map(CertifiedNode::id).collect();
        propose(&f, f.validators.node(2, 1, ids)).unwrap();
        assert_eq!(f.handler.node_handler().voted_rounds(), 2);
        f.handler.node_handler().gc(2);
        assert_eq!(f.handler.node_handler().voted_rounds(), 1);
    }

    #[test]
    fn test_certified_node_is_inserted_and_acked() {
        let f = fixture();
        let node = create_test_dag(&f.validators, 1).remove(2);
        let response = f
            .handler
            .handle(
                f.validators.author(2),
                DagMessage::CertifiedNode(dag_consensus_traits::CertifiedNodeMsg {
                    certified_node: node.clone(),
                }),
            )
            .unwrap();
        let DagMessage::CertifiedAck(ack) = response else {
            panic!("expected an ack");
        };
        assert_eq!(ack.node_id, node.id());
        assert_eq!(ack.author, f.validators.author(0));
        assert!(f.inserter.dag().exists(&node.id()));
    }

    #[test]
    fn test_fetch_request_pending_until_targets_present() {
        let f = fixture();
        let dag = create_test_dag(&f.validators, 3);
        let target = dag.last().unwrap().id();
        let request = FetchRequest {
            epoch: 1,
            targets: vec![target.clone()],
            lower_bound: 1,
            known: DagBitmask::default(),
        };
        assert_eq!(
            f.handler.fetch.process(request.clone()).unwrap(),
            FetchResponse::Pending
        );

        f.inserter.insert_batch(dag).unwrap();
        let FetchResponse::Nodes(nodes) = f.handler.fetch.process(request).unwrap() else {
            panic!("expected nodes");
        };
        // one round-3 target and the full rounds 1 and 2
        assert_eq!(nodes.len(), 9);
        assert!(nodes.windows(2).all(|w| w[0].round() <= w[1].round()));
        assert_eq!(nodes.last().unwrap().id(), target);
    }

    #[test]
    fn test_fetch_request_skips_known_nodes() {
        let f = fixture();
        let dag = create_test_dag(&f.validators, 3);
        let target = dag.last().unwrap().id();
        f.inserter.insert_batch(dag).unwrap();
        let known = f.inserter.dag().bitmask(1, 1);
        let request = FetchRequest {
            epoch: 1,
            targets: vec![target],
            lower_bound: 1,
            known,
        };
        let FetchResponse::Nodes(nodes) = f.handler.fetch.process(request).unwrap() else {
            panic!("expected nodes");
        };
        assert_eq!(nodes.len(), 5);
        assert!(nodes.iter().all(|n| n.round() >= 2));
    }
}
