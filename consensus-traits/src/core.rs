// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Core primitives shared by every component of the DAG engine.
//!
//! Validators are identified by their ed25519 verifying key, digests are
//! SHA-256, and signatures are raw ed25519 signature bytes.

use ed25519_dalek::{Signature as Ed25519Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Error type for glue code around the consensus engine.
pub type Error = anyhow::Error;

/// Epoch-scoped round number. Round 0 is genesis and never holds nodes.
pub type Round = u64;

/// Epoch number.
pub type Epoch = u64;

/// Stake weight of a validator.
pub type VotingPower = u64;

/// Errors possible during signature and voting power verification.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Author is unknown")]
    UnknownAuthor,

    #[error("Author {0} signed more than once")]
    DuplicateSigner(Author),

    #[error(
        "The voting power ({voting_power}) is less than expected ({expected_voting_power})"
    )]
    TooLittleVotingPower {
        voting_power: VotingPower,
        expected_voting_power: VotingPower,
    },

    #[error("Public key is malformed")]
    MalformedPublicKey,

    #[error("Signature verification failed")]
    InvalidSignature,
}

/// Identity of a validator: the bytes of its ed25519 verifying key.
///
/// Ordering is bytewise and is the tie-break used when linearizing a round.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Author([u8; 32]);

impl Author {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form used in logs.
    pub fn short_str(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Verify that `signature` was produced over `message` by this author.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), VerifyError> {
        let key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| VerifyError::MalformedPublicKey)?;
        let signature = Ed25519Signature::from_slice(signature.as_bytes())
            .map_err(|_| VerifyError::InvalidSignature)?;
        key.verify_strict(message, &signature)
            .map_err(|_| VerifyError::InvalidSignature)
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", self.short_str())
    }
}

/// 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct HashValue([u8; 32]);

impl HashValue {
    pub const LENGTH: usize = 32;

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Hash arbitrary bytes.
    pub fn sha256(bytes: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(bytes))
    }

    /// Finalize an in-progress hasher into a digest.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short_str(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashValue({})", hex::encode(self.0))
    }
}

/// Raw ed25519 signature bytes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Ed25519Signature> for Signature {
    fn from(signature: Ed25519Signature) -> Self {
        Self(signature.to_bytes().to_vec())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = &self.0[..self.0.len().min(4)];
        write!(f, "Signature({})", hex::encode(prefix))
    }
}
