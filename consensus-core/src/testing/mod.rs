// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Testing utilities for consensus-core.
//!
//! In-process stand-ins for the collaborators the engine only sees through
//! traits: the network and the payload source. [`LocalCluster`] wires whole
//! validators on top of them; the simulator binary runs on it too.

mod cluster;
mod network;
mod payload;

pub use cluster::{LocalCluster, LocalValidator};
pub use network::{InMemoryNetwork, InMemorySender};
pub use payload::MockPayloadClient;

pub use crate::dag::testing::{create_test_dag, TestNodeBuilder, TestValidators, TEST_EPOCH};
