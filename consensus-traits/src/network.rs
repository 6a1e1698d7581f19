// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Wire messages and the RPC seam between validators.
//!
//! Transport is out of scope: the engine only needs a request/response
//! [`DagNetworkSender`] and a [`RpcHandler`] that serves inbound requests.
//! Messages are encoded with bincode.

use crate::core::{Author, Epoch, Round};
use crate::dag::{CertifiedNode, DagError, ErrorKind, Node, NodeId, Vote};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Transport-level failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("RPC to {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: Author, timeout_ms: u64 },

    #[error("Peer {0} is unreachable")]
    Unreachable(Author),

    #[error("Peer {peer} rejected request ({kind}): {message}")]
    Remote {
        peer: Author,
        kind: ErrorKind,
        message: String,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RpcError {
    pub fn remote(peer: Author, err: &DagError) -> Self {
        RpcError::Remote {
            peer,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        RpcError::UnexpectedResponse(msg.into())
    }

    /// A peer judged the request invalid. Retrying it cannot succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RpcError::Remote {
                kind: ErrorKind::ProtocolViolation | ErrorKind::Internal,
                ..
            }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMsg {
    pub node: Node,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedNodeMsg {
    pub certified_node: CertifiedNode,
}

/// Receipt of a certified node, sent by every validator that stored it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedAck {
    pub epoch: Epoch,
    pub node_id: NodeId,
    pub author: Author,
}

/// Per-round presence bitmap of the requester's DAG, indexed by validator
/// slot. Lets a responder skip nodes the requester already holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagBitmask {
    lowest_round: Round,
    bitmask: Vec<Vec<bool>>,
}

impl DagBitmask {
    pub fn new(lowest_round: Round, bitmask: Vec<Vec<bool>>) -> Self {
        Self {
            lowest_round,
            bitmask,
        }
    }

    pub fn lowest_round(&self) -> Round {
        self.lowest_round
    }

    pub fn has(&self, round: Round, author_index: usize) -> bool {
        round
            .checked_sub(self.lowest_round)
            .and_then(|offset| self.bitmask.get(offset as usize))
            .and_then(|row| row.get(author_index))
            .copied()
            .unwrap_or(false)
    }

    pub fn rounds(&self) -> usize {
        self.bitmask.len()
    }
}

/// Request for a set of certified nodes and their missing ancestry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub epoch: Epoch,
    pub targets: Vec<NodeId>,
    /// Ancestors below this round are not requested.
    pub lower_bound: Round,
    pub known: DagBitmask,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchResponse {
    /// Targets plus every ancestor the requester lacks, parents first.
    Nodes(Vec<CertifiedNode>),
    /// The responder does not hold every target yet.
    Pending,
}

/// Every message exchanged between validators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DagMessage {
    Node(NodeMsg),
    Vote(Vote),
    CertifiedNode(CertifiedNodeMsg),
    CertifiedAck(CertifiedAck),
    FetchRequest(FetchRequest),
    FetchResponse(FetchResponse),
}

impl DagMessage {
    pub fn name(&self) -> &'static str {
        match self {
            DagMessage::Node(_) => "Node",
            DagMessage::Vote(_) => "Vote",
            DagMessage::CertifiedNode(_) => "CertifiedNode",
            DagMessage::CertifiedAck(_) => "CertifiedAck",
            DagMessage::FetchRequest(_) => "FetchRequest",
            DagMessage::FetchResponse(_) => "FetchResponse",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RpcError> {
        bincode::serialize(self).map_err(|e| RpcError::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RpcError> {
        bincode::deserialize(bytes).map_err(|e| RpcError::Codec(e.to_string()))
    }
}

impl fmt::Display for DagMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DagMessage::Node(msg) => write!(f, "Node({})", msg.node.id()),
            DagMessage::Vote(vote) => write!(f, "Vote({} by {})", vote.node_id(), vote.author()),
            DagMessage::CertifiedNode(msg) => {
                write!(f, "CertifiedNode({})", msg.certified_node.id())
            }
            DagMessage::CertifiedAck(ack) => {
                write!(f, "CertifiedAck({} by {})", ack.node_id, ack.author)
            }
            DagMessage::FetchRequest(req) => write!(f, "FetchRequest({} targets)", req.targets.len()),
            DagMessage::FetchResponse(FetchResponse::Nodes(nodes)) => {
                write!(f, "FetchResponse({} nodes)", nodes.len())
            }
            DagMessage::FetchResponse(FetchResponse::Pending) => write!(f, "FetchResponse(Pending)"),
        }
    }
}

/// Outbound request/response channel to a peer.
#[async_trait]
pub trait DagNetworkSender: Send + Sync + 'static {
    async fn send_rpc(
        &self,
        to: Author,
        message: DagMessage,
        timeout: Duration,
    ) -> Result<DagMessage, RpcError>;
}

/// Serves inbound requests from peers.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn process_rpc(&self, from: Author, message: DagMessage) -> Result<DagMessage, DagError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HashValue;
    use crate::dag::Payload;

    #[test]
    fn test_bitmask_lookup() {
        let mask = DagBitmask::new(5, vec![vec![true, false], vec![false, true]]);
        assert!(mask.has(5, 0));
        assert!(!mask.has(5, 1));
        assert!(mask.has(6, 1));
        assert!(!mask.has(4, 0));
        assert!(!mask.has(7, 0));
        assert!(!mask.has(5, 9));
    }

    #[test]
    fn test_message_codec() {
        let node = Node::new(1, 1, Author::new([3; 32]), 0, Payload::empty(), vec![], vec![]);
        let msg = DagMessage::FetchRequest(FetchRequest {
            epoch: 1,
            targets: vec![node.id(), NodeId::new(1, 2, Author::new([4; 32]), HashValue::zero())],
            lower_bound: 0,
            known: DagBitmask::new(1, vec![vec![true]]),
        });
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(DagMessage::from_bytes(&bytes).unwrap(), msg);
        assert!(matches!(
            DagMessage::from_bytes(&[0xff, 0xff]),
            Err(RpcError::Codec(_))
        ));
    }

    #[test]
    fn test_rejection_classification() {
        let peer = Author::new([1; 32]);
        assert!(RpcError::remote(peer, &DagError::Internal("x".into())).is_rejection());
        assert!(!RpcError::remote(peer, &DagError::VotingPaused).is_rejection());
        assert!(!RpcError::Unreachable(peer).is_rejection());
    }
}
