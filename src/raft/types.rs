//! openraft type configuration
//!
//! Cluster members are named by string ids; openraft wants `Copy` ids, so
//! each member gets a stable `u64` derived from its name and carries the
//! name and raft address in its [`RaftPeer`] record.

use crate::raft::engine::ApplyOutcome;
use bytes::Bytes;
use openraft::TokioRuntime;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Raft id of a cluster member
pub type NodeId = u64;

/// Member record stored in every openraft membership config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftPeer {
    pub id: String,
    pub address: String,
}

impl RaftPeer {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for RaftPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// An encoded [`crate::common::Command`] on its way through the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub command: Bytes,
}

openraft::declare_raft_types!(
    /// raftroute type configuration
    pub TypeConfig:
        D = Proposal,
        R = ApplyOutcome,
        NodeId = u64,
        Node = RaftPeer,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type KvRaft = openraft::Raft<TypeConfig>;

/// Position and membership of a snapshot, as openraft tracks them
pub type RaftSnapshotMeta = openraft::SnapshotMeta<NodeId, RaftPeer>;

/// Raft id for a member name (FNV-1a). Never 0.
pub fn raft_node_id(id: &str) -> NodeId {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    if hash == 0 {
        1
    } else {
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_stable() {
        assert_eq!(raft_node_id("node0"), raft_node_id("node0"));
        assert_ne!(raft_node_id("node0"), raft_node_id("node1"));
        assert_ne!(raft_node_id(""), 0);
    }

    #[test]
    fn test_proposal_serializes() {
        let proposal = Proposal {
            command: Bytes::from_static(br#"{"op":"set","key":"k","value":"v"}"#),
        };
        let json = serde_json::to_vec(&proposal).unwrap();
        let back: Proposal = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.command, proposal.command);
    }
}
