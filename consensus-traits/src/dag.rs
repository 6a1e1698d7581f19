// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! # DAG Data Model
//!
//! Validators propose one [`Node`] per round. A node references certified
//! nodes of the previous round through strong links and older, still
//! unreferenced nodes through weak links. Once validators holding a quorum of
//! voting power have signed the node digest, the node and its
//! [`NodeCertificate`] form a [`CertifiedNode`], the only unit ever inserted
//! into the DAG.
//!
//! ## Key Concepts
//!
//! - **Strong link**: reference to a round r-1 certified node; counts toward
//!   the parent quorum and reachability
//! - **Weak link**: reference to an older certified node; counts only toward
//!   reachability
//! - **Anchor**: per-round pivot whose commit orders everything it reaches

use crate::core::{Author, Epoch, HashValue, Round, Signature, VerifyError, VotingPower};
use crate::network::RpcError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Unique identifier of a DAG node.
///
/// Ordering is by epoch, round, author and digest, which inside one epoch is
/// the (round, author) tie-break used by the ordering rule.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    epoch: Epoch,
    round: Round,
    author: Author,
    digest: HashValue,
}

impl NodeId {
    pub fn new(epoch: Epoch, round: Round, author: Author, digest: HashValue) -> Self {
        Self {
            epoch,
            round,
            author,
            digest,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn digest(&self) -> &HashValue {
        &self.digest
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}:{}:{}]",
            self.epoch, self.round, self.author, self.digest
        )
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId{}", self)
    }
}

/// Opaque transaction bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction(pub Vec<u8>);

impl Transaction {
    pub fn size(&self) -> usize {
        self.0.len()
    }
}

/// Ordered batch of transactions carried by a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    transactions: Vec<Transaction>,
}

impl Payload {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Number of transactions.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Total transaction bytes.
    pub fn size(&self) -> usize {
        self.transactions.iter().map(Transaction::size).sum()
    }
}

/// A validator's proposal for one round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    epoch: Epoch,
    round: Round,
    author: Author,
    timestamp: u64,
    payload: Payload,
    strong_links: Vec<NodeId>,
    weak_links: Vec<NodeId>,
    digest: HashValue,
}

impl Node {
    pub fn new(
        epoch: Epoch,
        round: Round,
        author: Author,
        timestamp: u64,
        payload: Payload,
        strong_links: Vec<NodeId>,
        weak_links: Vec<NodeId>,
    ) -> Self {
        let digest = Self::calculate_digest(
            epoch,
            round,
            &author,
            timestamp,
            &payload,
            &strong_links,
            &weak_links,
        );
        Self {
            epoch,
            round,
            author,
            timestamp,
            payload,
            strong_links,
            weak_links,
            digest,
        }
    }

    /// SHA-256 over every field but the digest itself. Variable-length
    /// sections are length-prefixed so distinct contents never collide.
    pub fn calculate_digest(
        epoch: Epoch,
        round: Round,
        author: &Author,
        timestamp: u64,
        payload: &Payload,
        strong_links: &[NodeId],
        weak_links: &[NodeId],
    ) -> HashValue {
        let mut hasher = Sha256::new();
        hasher.update(epoch.to_le_bytes());
        hasher.update(round.to_le_bytes());
        hasher.update(author.as_bytes());
        hasher.update(timestamp.to_le_bytes());
        hasher.update((payload.len() as u64).to_le_bytes());
        for txn in payload.transactions() {
            hasher.update((txn.size() as u64).to_le_bytes());
            hasher.update(&txn.0);
        }
        for links in [strong_links, weak_links] {
            hasher.update((links.len() as u64).to_le_bytes());
            for link in links {
                hasher.update(link.epoch().to_le_bytes());
                hasher.update(link.round().to_le_bytes());
                hasher.update(link.author().as_bytes());
                hasher.update(link.digest().as_bytes());
            }
        }
        HashValue::from_hasher(hasher)
    }

    /// Whether the carried digest matches the content.
    pub fn verify_digest(&self) -> bool {
        self.digest
            == Self::calculate_digest(
                self.epoch,
                self.round,
                &self.author,
                self.timestamp,
                &self.payload,
                &self.strong_links,
                &self.weak_links,
            )
    }

    pub fn id(&self) -> NodeId {
        NodeId::new(self.epoch, self.round, self.author, self.digest)
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn strong_links(&self) -> &[NodeId] {
        &self.strong_links
    }

    pub fn weak_links(&self) -> &[NodeId] {
        &self.weak_links
    }

    /// Strong links followed by weak links.
    pub fn links(&self) -> impl Iterator<Item = &NodeId> {
        self.strong_links.iter().chain(self.weak_links.iter())
    }

    pub fn digest(&self) -> &HashValue {
        &self.digest
    }
}

/// A validator's signature over a node digest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    node_id: NodeId,
    author: Author,
    signature: Signature,
}

impl Vote {
    pub fn new(node_id: NodeId, author: Author, signature: Signature) -> Self {
        Self {
            node_id,
            author,
            signature,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Check the signature against the voter's key. Voting power is checked
    /// by the epoch context.
    pub fn verify_signature(&self) -> Result<(), VerifyError> {
        self.author
            .verify(self.node_id.digest().as_bytes(), &self.signature)
    }
}

/// Aggregated votes proving that a quorum has seen a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCertificate {
    node_id: NodeId,
    signatures: Vec<(Author, Signature)>,
}

impl NodeCertificate {
    /// Signatures are kept sorted by signer so equal certificates compare
    /// equal regardless of vote arrival order.
    pub fn new(node_id: NodeId, mut signatures: Vec<(Author, Signature)>) -> Self {
        signatures.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            node_id,
            signatures,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn signatures(&self) -> &[(Author, Signature)] {
        &self.signatures
    }

    pub fn signers(&self) -> impl Iterator<Item = &Author> {
        self.signatures.iter().map(|(author, _)| author)
    }
}

/// A node together with its quorum certificate. Immutable once formed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedNode {
    node: Node,
    certificate: NodeCertificate,
}

impl CertifiedNode {
    pub fn new(node: Node, certificate: NodeCertificate) -> Self {
        Self { node, certificate }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn certificate(&self) -> &NodeCertificate {
        &self.certificate
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn epoch(&self) -> Epoch {
        self.node.epoch()
    }

    pub fn round(&self) -> Round {
        self.node.round()
    }

    pub fn author(&self) -> &Author {
        self.node.author()
    }

    pub fn digest(&self) -> &HashValue {
        self.node.digest()
    }

    pub fn strong_links(&self) -> &[NodeId] {
        self.node.strong_links()
    }

    pub fn weak_links(&self) -> &[NodeId] {
        self.node.weak_links()
    }

    pub fn links(&self) -> impl Iterator<Item = &NodeId> {
        self.node.links()
    }
}

/// Ordering status of a stored certified node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Not yet reached by any committed anchor.
    Unordered,
    /// Assigned a position in the commit sequence.
    Ordered { commit_index: u64 },
}

impl NodeStatus {
    pub fn is_ordered(&self) -> bool {
        matches!(self, NodeStatus::Ordered { .. })
    }
}

/// Classification of a [`DagError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A peer sent something invalid. Rejected, never retried.
    ProtocolViolation,
    /// Data or peers are temporarily unavailable. Retried with backoff.
    Transient,
    /// Admission control refused the work until conditions recover.
    ResourceExhausted,
    /// A local contract was broken. Indicates a bug, not a peer fault.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::Transient => "transient",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// Errors produced by the DAG store and message handlers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("Epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: Epoch, actual: Epoch },

    #[error("Unknown author {0}")]
    UnknownAuthor(Author),

    #[error("Digest does not match content of node {0}")]
    DigestMismatch(NodeId),

    #[error("Invalid certificate for node {id}: {reason}")]
    InvalidCertificate { id: NodeId, reason: VerifyError },

    #[error("Invalid vote from {author}: {reason}")]
    InvalidVote { author: Author, reason: VerifyError },

    #[error("Parent quorum not met for node {id}: {voting_power} < {expected}")]
    ParentQuorumNotMet {
        id: NodeId,
        voting_power: VotingPower,
        expected: VotingPower,
    },

    #[error("Malformed node {id}: {reason}")]
    MalformedNode { id: NodeId, reason: String },

    #[error("Author {author} equivocated at round {round}")]
    Equivocation { round: Round, author: Author },

    #[error("Payload of node {id} exceeds limits: {txns} txns, {bytes} bytes")]
    PayloadTooLarge { id: NodeId, txns: u64, bytes: u64 },

    #[error("Missing {} parent(s)", .0.len())]
    MissingParents(Vec<NodeId>),

    #[error("Round {round} is below the retained window starting at {lowest}")]
    RoundPruned { round: Round, lowest: Round },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Voting is paused by pipeline backoff")]
    VotingPaused,

    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Node {0} is already ordered")]
    AlreadyOrdered(NodeId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DagError {
    pub fn malformed(id: NodeId, reason: impl Into<String>) -> Self {
        DagError::MalformedNode {
            id,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DagError::EpochMismatch { .. }
            | DagError::UnknownAuthor(_)
            | DagError::DigestMismatch(_)
            | DagError::InvalidCertificate { .. }
            | DagError::InvalidVote { .. }
            | DagError::ParentQuorumNotMet { .. }
            | DagError::MalformedNode { .. }
            | DagError::Equivocation { .. }
            | DagError::PayloadTooLarge { .. } => ErrorKind::ProtocolViolation,
            DagError::MissingParents(_) | DagError::RoundPruned { .. } | DagError::Rpc(_) => {
                ErrorKind::Transient
            }
            DagError::VotingPaused => ErrorKind::ResourceExhausted,
            DagError::NodeNotFound(_) | DagError::AlreadyOrdered(_) | DagError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.kind() == ErrorKind::ProtocolViolation
    }
}
