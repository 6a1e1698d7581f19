// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use dag_consensus_traits::{Author, Node, Signature, Vote};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use std::fmt;

/// Signing identity of the local validator.
#[derive(Clone)]
pub struct ValidatorSigner {
    author: Author,
    key: SigningKey,
}

impl ValidatorSigner {
    pub fn new(key: SigningKey) -> Self {
        let author = Author::new(key.verifying_key().to_bytes());
        Self { author, key }
    }

    /// Deterministic key, for simulations and tests.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from(self.key.sign(message))
    }

    /// Vote for a node by signing its digest.
    pub fn vote(&self, node: &Node) -> Vote {
        Vote::new(node.id(), self.author, self.sign(node.digest().as_bytes()))
    }
}

impl fmt::Debug for ValidatorSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorSigner({})", self.author)
    }
}
