// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! # DAG Consensus Traits
//!
//! Data model, wire messages and collaborator seams for the leaderless
//! DAG-based BFT engine in `dag-consensus-core`.
//!
//! ## Overview
//!
//! - **Core Types**: [`Author`], [`HashValue`], [`Signature`], [`Round`]
//! - **DAG**: [`Node`], [`Vote`], [`NodeCertificate`], [`CertifiedNode`], [`NodeStatus`]
//! - **Network**: [`DagMessage`], [`DagNetworkSender`], [`RpcHandler`]
//! - **Execution**: [`OrderedBatch`], [`OrderedBatchAdapter`], [`PayloadClient`]
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0 (LICENSE or http://www.apache.org/licenses/LICENSE-2.0)

pub mod core;
pub mod dag;
pub mod execution;
pub mod network;

pub use crate::core::{Author, Epoch, HashValue, Round, Signature, VerifyError, VotingPower};
pub use dag::{
    CertifiedNode, DagError, ErrorKind, Node, NodeCertificate, NodeId, NodeStatus, Payload,
    Transaction, Vote,
};
pub use execution::{OrderedBatch, OrderedBatchAdapter, PayloadClient};
pub use network::{
    CertifiedAck, CertifiedNodeMsg, DagBitmask, DagMessage, DagNetworkSender, FetchRequest,
    FetchResponse, NodeMsg, RpcError, RpcHandler,
};

/// Result type alias for consensus operations.
pub type Result<T> = std::result::Result<T, core::Error>;
