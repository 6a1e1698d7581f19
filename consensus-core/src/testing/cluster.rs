// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{InMemoryNetwork, MockPayloadClient};
use crate::{
    broadcast::ReliableBroadcast,
    config::DagConfig,
    dag::{
        testing::TestValidators, CertifiedNodeHandler, DagDriver, DagHandler, DagInserter,
        DagStore, FetchRequestHandler, NodeBroadcastHandler, OrderRule, RoundRobinAnchorElection,
        RoundState,
    },
    fetch::{DagFetcher, FetchService},
    health::HealthBackoff,
    pipeline::{ChannelOrderedAdapter, LatencyTracker},
};
use dag_consensus_traits::{Author, DagNetworkSender, NodeId, OrderedBatch, Round};
use log::{error, info};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Background pieces of a validator, handed over on start.
struct Idle {
    driver: DagDriver,
    fetch_service: FetchService,
    batches: mpsc::UnboundedReceiver<OrderedBatch>,
}

/// One validator of a [`LocalCluster`], fully wired.
pub struct LocalValidator {
    author: Author,
    dag: Arc<DagStore>,
    inserter: Arc<DagInserter>,
    health: Arc<HealthBackoff>,
    handler: Arc<DagHandler>,
    fetcher: Arc<DagFetcher>,
    latency: Arc<LatencyTracker>,
    ordered: Arc<Mutex<Vec<OrderedBatch>>>,
    state: watch::Receiver<RoundState>,
    idle: Option<Idle>,
}

impl LocalValidator {
    pub fn author(&self) -> Author {
        self.author
    }

    pub fn dag(&self) -> &Arc<DagStore> {
        &self.dag
    }

    pub fn inserter(&self) -> &Arc<DagInserter> {
        &self.inserter
    }

    pub fn health(&self) -> &Arc<HealthBackoff> {
        &self.health
    }

    pub fn handler(&self) -> &Arc<DagHandler> {
        &self.handler
    }

    pub fn fetcher(&self) -> &Arc<DagFetcher> {
        &self.fetcher
    }

    pub fn latency(&self) -> &Arc<LatencyTracker> {
        &self.latency
    }

    pub fn state(&self) -> RoundState {
        *self.state.borrow()
    }

    /// Batches executed so far, in commit order.
    pub fn ordered_batches(&self) -> Vec<OrderedBatch> {
        self.ordered.lock().clone()
    }

    /// Ids of every executed node, in commit order.
    pub fn ordered_ids(&self) -> Vec<NodeId> {
        self.ordered
            .lock()
            .iter()
            .flat_map(|batch| batch.nodes.iter().map(|node| node.id()))
            .collect()
    }
}

/// Validators wired over an [`InMemoryNetwork`] in one process.
///
/// Each validator gets its own store, order rule, handlers, fetch service
/// and driver. Ordered batches are "executed" immediately and their latency
/// fed back to the validator's health monitor.
pub struct LocalCluster {
    validators: TestValidators,
    network: InMemoryNetwork,
    nodes: Vec<LocalValidator>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    report_latency: Arc<AtomicBool>,
}

impl LocalCluster {
    pub fn new(count: usize, config: &DagConfig) -> anyhow::Result<Self> {
        Self::with_round_limit(count, config, None)
    }

    /// Like [`LocalCluster::new`], with every driver idling after `limit`.
    pub fn with_round_limit(
        count: usize,
        config: &DagConfig,
        limit: Option<Round>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let validators = TestValidators::new(count);
        let network = InMemoryNetwork::new();
        let nodes = (0..count)
            .map(|index| Self::wire(&validators, &network, index, config, limit))
            .collect();
        Ok(Self {
            validators,
            network,
            nodes,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            report_latency: Arc::new(AtomicBool::new(true)),
        })
    }

    fn wire(
        validators: &TestValidators,
        network: &InMemoryNetwork,
        index: usize,
        config: &DagConfig,
        limit: Option<Round>,
    ) -> LocalValidator {
        let epoch = validators.epoch_context();
        let signer = validators.signer(index).clone();
        let author = signer.author();

        let dag = Arc::new(DagStore::new(epoch.clone(), config.store_config()));
        let health = Arc::new(HealthBackoff::new(dag.clone(), config.health_config()));
        let latency = Arc::new(LatencyTracker::new(health.pipeline().clone(), dag.clone()));
        let (adapter, batches) = ChannelOrderedAdapter::new();
        let order_rule = OrderRule::new(
            epoch.clone(),
            dag.clone(),
            Arc::new(RoundRobinAnchorElection::new(&epoch)),
            Arc::new(adapter.with_latency_tracker(latency.clone())),
            config.ordering_config(),
        );
        let inserter = Arc::new(DagInserter::new(dag.clone(), order_rule));

        let sender: Arc<dyn DagNetworkSender> = Arc::new(network.sender(author));
        let fetcher = Arc::new(DagFetcher::new(
            epoch.clone(),
            inserter.clone(),
            sender.clone(),
            config.fetch_config(),
        ));
        let (fetch_service, requester) = FetchService::new(fetcher.clone());

        let handler = Arc::new(DagHandler::new(
            NodeBroadcastHandler::new(
                epoch.clone(),
                dag.clone(),
                signer.clone(),
                health.clone(),
                requester.clone(),
            ),
            CertifiedNodeHandler::new(epoch.clone(), inserter.clone(), requester, author),
            FetchRequestHandler::new(epoch.clone(), dag.clone()),
        ));
        network.register(author, handler.clone());

        let broadcast = ReliableBroadcast::new(
            epoch.authors().copied().collect(),
            sender,
            config.broadcast_config(),
        );
        let mut driver = DagDriver::new(
            epoch,
            signer,
            inserter.clone(),
            broadcast,
            health.clone(),
            Arc::new(MockPayloadClient::default()),
            handler.clone(),
            config.driver_config(),
        );
        if let Some(limit) = limit {
            driver = driver.with_round_limit(limit);
        }
        let state = driver.state_receiver();

        LocalValidator {
            author,
            dag,
            inserter,
            health,
            handler,
            fetcher,
            latency,
            ordered: Arc::new(Mutex::new(Vec::new())),
            state,
            idle: Some(Idle {
                driver,
                fetch_service,
                batches,
            }),
        }
    }

    pub fn validators(&self) -> &TestValidators {
        &self.validators
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    pub fn node(&self, index: usize) -> &LocalValidator {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[LocalValidator] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Take or stop latency reports from the executors.
    pub fn set_latency_reporting(&self, enabled: bool) {
        self.report_latency.store(enabled, Ordering::Relaxed);
    }

    /// Spawn drivers, fetch services and executors of every validator not
    /// started yet.
    pub fn start(&mut self) {
        for node in &mut self.nodes {
            let Some(idle) = node.idle.take() else {
                continue;
            };
            let author = node.author;
            let Idle {
                driver,
                fetch_service,
                mut batches,
            } = idle;

            self.tasks
                .push(tokio::spawn(fetch_service.run(self.cancel.child_token())));

            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = driver.run(cancel).await {
                    error!("Driver of {} failed: {:#}", author, e);
                }
            }));

            let ordered = node.ordered.clone();
            let tracker = node.latency.clone();
            let report = self.report_latency.clone();
            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let batch = tokio::select! {
                        _ = cancel.cancelled() => break,
                        batch = batches.recv() => match batch {
                            Some(batch) => batch,
                            None => break,
                        },
                    };
                    info!(
                        "Validator {} executed anchor {} with {} nodes, commit index {}",
                        author,
                        batch.anchor,
                        batch.nodes.len(),
                        batch.last_commit_index()
                    );
                    if report.load(Ordering::Relaxed) {
                        tracker.on_executed(&batch.anchor);
                    }
                    ordered.lock().push(batch);
                }
            }));
        }
        info!("Started {} validators", self.nodes.len());
    }

    /// Poll `condition` until it holds or `timeout` elapses.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        mut condition: impl FnMut(&LocalCluster) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Stopped");
    }
}
