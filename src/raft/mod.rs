//! Consensus: the engine contract, the state machine plugged into it, and
//! the openraft-backed engine with its log, snapshot and network plumbing.

pub mod engine;
pub mod fsm;
pub mod log_store;
pub mod network;
pub mod raft_engine;
pub mod snapshot_store;
pub mod state_machine;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{
    ApplyOutcome, ClusterMember, ConsensusEngine, EngineStats, EventStream, LeaderInfo,
    RaftState, SnapshotMeta, StateChange, StateEvent, StateMachine,
};
pub use fsm::KvStateMachine;
pub use raft_engine::RaftEngine;
pub use snapshot_store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use types::{KvRaft, RaftPeer, TypeConfig};
