// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{DagFetcher, FetchError, FetchOutcome};
use dag_consensus_traits::{Author, CertifiedNode, DagError, NodeId, Round};
use futures::{stream::FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

struct FetchTask {
    targets: Vec<NodeId>,
    responders: Vec<Author>,
    /// Certified node to insert once its parents are fetched.
    trigger: Option<CertifiedNode>,
}

/// Cheap handle for queueing fetches.
#[derive(Clone)]
pub struct FetchRequester {
    tx: mpsc::UnboundedSender<FetchTask>,
    in_flight: Arc<Mutex<HashSet<NodeId>>>,
}

impl FetchRequester {
    /// Queue a fetch of `targets`. Returns false if the service stopped.
    pub fn request(
        &self,
        targets: Vec<NodeId>,
        responders: Vec<Author>,
        trigger: Option<CertifiedNode>,
    ) -> bool {
        self.tx
            .send(FetchTask {
                targets,
                responders,
                trigger,
            })
            .is_ok()
    }

    /// Targets currently being fetched.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

type FetchHandle = JoinHandle<(u64, Vec<NodeId>, Result<FetchOutcome, FetchError>)>;

/// Background task serving [`FetchRequester`]s.
///
/// Targets already being fetched are not requested twice. Certified nodes
/// that triggered a fetch wait here until their parents arrive.
pub struct FetchService {
    fetcher: Arc<DagFetcher>,
    rx: mpsc::UnboundedReceiver<FetchTask>,
    in_flight: Arc<Mutex<HashSet<NodeId>>>,
    waiting: HashMap<NodeId, CertifiedNode>,
    /// Highest target round and cancellation of each running fetch.
    running: HashMap<u64, (Round, CancellationToken)>,
    next_task_id: u64,
}

impl FetchService {
    pub fn new(fetcher: Arc<DagFetcher>) -> (Self, FetchRequester) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let service = Self {
            fetcher,
            rx,
            in_flight: in_flight.clone(),
            waiting: HashMap::new(),
            running: HashMap::new(),
            next_task_id: 0,
        };
        (service, FetchRequester { tx, in_flight })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut versions = self.fetcher.dag().subscribe();
        let mut tasks: FuturesUnordered<FetchHandle> = FuturesUnordered::new();
        info!("Started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                task = self.rx.recv() => match task {
                    Some(task) => {
                        if let Some(handle) = self.start(task, &cancel) {
                            tasks.push(handle);
                        }
                    }
                    None => break,
                },
                Some(done) = tasks.next(), if !tasks.is_empty() => {
                    match done {
                        Ok((id, targets, result)) => self.finish(id, targets, result),
                        Err(e) => warn!("Fetch task panicked: {}", e),
                    }
                    self.retry_waiting();
                }
                changed = versions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.prune();
                    self.retry_waiting();
                }
            }
        }
        for (_, (_, token)) in self.running.drain() {
            token.cancel();
        }
        info!("Stopped");
    }

    fn start(&mut self, task: FetchTask, cancel: &CancellationToken) -> Option<FetchHandle> {
        let dag = self.fetcher.dag();
        if let Some(node) = task.trigger {
            self.waiting.insert(node.id(), node);
        }
        let targets: Vec<NodeId> = {
            let mut in_flight = self.in_flight.lock();
            dag.missing(&task.targets)
                .into_iter()
                .filter(|target| in_flight.insert(target.clone()))
                .collect()
        };
        if targets.is_empty() {
            return None;
        }

        let highest = targets.iter().map(NodeId::round).max().unwrap_or(0);
        let token = cancel.child_token();
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.running.insert(id, (highest, token.clone()));
        let fetcher = self.fetcher.clone();
        let responders = task.responders;
        debug!("Fetching {} targets up to round {}", targets.len(), highest);
        Some(tokio::spawn(async move {
            let result = fetcher.fetch(&targets, &responders, &token).await;
            (id, targets, result)
        }))
    }

    fn finish(&mut self, id: u64, targets: Vec<NodeId>, result: Result<FetchOutcome, FetchError>) {
        {
            let mut in_flight = self.in_flight.lock();
            for target in &targets {
                in_flight.remove(target);
            }
        }
        self.running.remove(&id);
        match result {
            Ok(outcome) => debug!("Fetch done: {:?}", outcome),
            Err(FetchError::Cancelled) => debug!("Fetch cancelled"),
            Err(e) => warn!("Fetch of {} targets failed: {}", targets.len(), e),
        }
    }

    /// Cancel fetches and drop waiting nodes that fell below the retained
    /// window.
    fn prune(&mut self) {
        let lowest = self.fetcher.dag().lowest_round();
        self.running.retain(|_, (round, token)| {
            if *round < lowest {
                token.cancel();
                false
            } else {
                true
            }
        });
        self.waiting.retain(|id, _| id.round() >= lowest);
    }

    fn retry_waiting(&mut self) {
        if self.waiting.is_empty() {
            return;
        }
        let snapshot = self.fetcher.dag().snapshot();
        let ready: Vec<NodeId> = self
            .waiting
            .iter()
            .filter(|(_, node)| snapshot.missing(node.links()).is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ready {
            let Some(node) = self.waiting.remove(&id) else {
                continue;
            };
            match self.fetcher.inserter().insert(node) {
                Ok(_) => debug!("Inserted waiting node {}", id),
                Err(DagError::RoundPruned { .. }) => {}
                Err(e) => warn!("Waiting node {} rejected: {}", id, e),
            }
        }
    }
}
