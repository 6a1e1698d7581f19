// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! # DAG Consensus Module
//!
//! Leaderless DAG consensus: every validator proposes one node per round,
//! nodes are certified by a quorum of votes and anchors elected per round
//! order everything they reach.
//!
//! ## Structure
//!
//! - **store**: copy-on-write DAG store indexed by round and validator slot
//! - **validation**: stateless node and certificate checks
//! - **ordering**: anchor election and the order rule
//! - **inserter**: insertion followed by an ordering pass under one lock
//! - **handler**: inbound RPC handlers (votes, certified nodes, fetches)
//! - **driver**: the local round state machine

pub mod driver;
pub mod handler;
pub mod inserter;
pub mod ordering;
pub mod store;
pub mod testing;
pub mod validation;

pub use driver::{DagDriver, DagDriverConfig, RoundState};
pub use handler::{CertifiedNodeHandler, DagHandler, FetchRequestHandler, NodeBroadcastHandler};
pub use inserter::DagInserter;
pub use ordering::{
    AnchorElection, CommitEvent, OrderRule, OrderingConfig, RoundRobinAnchorElection,
    WeightedAnchorElection,
};
pub use store::{DagSnapshot, DagStore, DagStoreConfig, StoredNodeStatus};
