// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! # DAG Consensus Core Library
//!
//! A leaderless, DAG-based Byzantine fault tolerant consensus engine. Every
//! validator proposes one node per round; nodes are certified by a quorum of
//! votes, linked into a DAG and totally ordered by committing elected
//! anchors.
//!
//! ## Architecture
//!
//! - [`dag`] - Store, validation, order rule, RPC handlers and round driver
//! - [`broadcast`] - Reliable broadcast with vote and ack aggregation
//! - [`fetch`] - Catch-up of missing certified nodes
//! - [`health`] - Participation and pipeline backoff
//! - [`pipeline`] - Hand-off of ordered batches to execution
//! - [`crypto`] - Ed25519 signing and signature aggregation
//! - [`epoch`] - Validator set and quorum arithmetic
//! - [`config`] - Flat engine configuration
//!
//! ## Usage
//!
//! The engine talks to the outside world through the traits in
//! `dag-consensus-traits`: a [`DagNetworkSender`](dag_consensus_traits::DagNetworkSender)
//! for outbound RPCs, a [`PayloadClient`](dag_consensus_traits::PayloadClient)
//! for transactions and an
//! [`OrderedBatchAdapter`](dag_consensus_traits::OrderedBatchAdapter) for
//! ordered output.
//!
//! ```rust,no_run,ignore
//! use dag_consensus_core::{config::DagConfig, testing::LocalCluster};
//!
//! let mut cluster = LocalCluster::new(4, &DagConfig::default())?;
//! cluster.start();
//! ```

pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod dag;
pub mod epoch;
pub mod fetch;
pub mod health;
pub mod pipeline;
pub mod testing;

// Re-export commonly used types
pub use config::DagConfig;
pub use dag::{DagDriver, DagInserter, DagStore, OrderRule, RoundState};
pub use dag_consensus_traits::{Epoch, Round};
pub use epoch::EpochContext;

/// Version of the DAG protocol implemented by this library
pub const DAG_PROTOCOL_VERSION: &str = "0.1.0";
