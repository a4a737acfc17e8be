//! Consensus engine contract
//!
//! Everything above this module talks to consensus through
//! [`ConsensusEngine`]; everything the engine needs from the application
//! is behind [`StateMachine`].

use crate::common::Result;
use crate::raft::types::RaftSnapshotMeta;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Consensus role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl std::fmt::Display for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftState::Follower => write!(f, "Follower"),
            RaftState::Candidate => write!(f, "Candidate"),
            RaftState::Leader => write!(f, "Leader"),
            RaftState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: String,
    pub address: String,
    pub voter: bool,
}

impl ClusterMember {
    pub fn voter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            voter: true,
        }
    }

    pub fn nonvoter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            voter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub id: String,
    pub address: String,
}

/// Describes a persisted snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub index: u64,
    pub term: u64,
    pub members: Vec<ClusterMember>,
    #[serde(default)]
    pub size: u64,
    /// Log id and membership in openraft's own form, for reloading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raft: Option<RaftSnapshotMeta>,
}

/// What changed in a [`StateEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Role(RaftState),
    Leader,
    Membership(Vec<ClusterMember>),
}

/// Observation emitted by the engine
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub timestamp: DateTime<Utc>,
    pub change: StateChange,
    pub leader: Option<LeaderInfo>,
}

impl StateEvent {
    pub fn new(change: StateChange, leader: Option<LeaderInfo>) -> Self {
        Self {
            timestamp: Utc::now(),
            change,
            leader,
        }
    }
}

/// Unbounded, consumer-driven stream of observations
pub type EventStream = BoxStream<'static, StateEvent>;

/// Result of handing one committed entry to the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    /// The entry could not be interpreted; every replica skips it alike
    Skipped(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub last_snapshot_index: u64,
}

/// Destination of a snapshot being persisted
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;
    /// Discard everything written so far
    fn cancel(&mut self) -> Result<()>;
    /// Make the snapshot durable and visible
    fn close(&mut self) -> Result<()>;
}

/// Point-in-time state produced by [`StateMachine::snapshot`]
pub trait FsmSnapshot: Send + Sync {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()>;

    fn release(&mut self) {}
}

/// The deterministic application plugged into the log.
///
/// The engine calls these from a single apply path: never concurrently
/// with each other, and `apply` once per committed entry in index order.
pub trait StateMachine: Send + Sync {
    fn apply(&self, index: u64, term: u64, payload: &[u8]) -> ApplyOutcome;

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>>;

    fn restore(&self, meta: &SnapshotMeta, data: Box<dyn Read + Send>) -> Result<()>;
}

/// Capabilities the rest of the node needs from consensus
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    fn local_id(&self) -> &str;

    fn local_address(&self) -> &str;

    fn state(&self) -> RaftState;

    fn leader(&self) -> Option<LeaderInfo>;

    fn stats(&self) -> EngineStats;

    /// Replicate a command; resolves with its log index once committed and applied.
    async fn propose(&self, payload: Bytes) -> Result<u64>;

    async fn configuration(&self) -> Result<Vec<ClusterMember>>;

    /// Initialize a brand new cluster. Fails if a configuration already exists.
    async fn bootstrap(&self, members: Vec<ClusterMember>) -> Result<()>;

    async fn add_voter(&self, id: &str, address: &str) -> Result<()>;

    async fn add_nonvoter(&self, id: &str, address: &str) -> Result<()>;

    async fn remove_server(&self, id: &str) -> Result<()>;

    /// Snapshot the state machine and truncate the log behind it.
    async fn snapshot(&self) -> Result<SnapshotMeta>;

    fn subscribe(&self) -> EventStream;

    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(RaftState::Leader.to_string(), "Leader");
        assert_eq!(RaftState::Follower.to_string(), "Follower");
        assert_eq!(RaftState::Candidate.to_string(), "Candidate");
        assert_eq!(RaftState::Shutdown.to_string(), "Shutdown");
    }

    #[test]
    fn test_member_constructors() {
        assert!(ClusterMember::voter("a", "addr").voter);
        assert!(!ClusterMember::nonvoter("b", "addr").voter);
    }
}
