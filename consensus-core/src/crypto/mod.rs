// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic utilities for consensus.
//!
//! Local signing and the signature aggregation used to form node
//! certificates.

mod signature_aggregator;
mod signer;

pub use signature_aggregator::SignatureAggregator;
pub use signer::ValidatorSigner;
