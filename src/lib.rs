//! # raftroute
//!
//! A replicated key-value store that leaves elections and replication to
//! openraft and publishes its leadership for an external router:
//! - deterministic state machine over a string map (set / delete)
//! - idempotent cluster membership (join / remove / bootstrap)
//! - leader-gated writes, local reads
//! - snapshot scheduling by write count or applied-entry threshold
//! - a `{State, NodeAddr}` state file rewritten on every leadership change
//!
//! ## Architecture
//!
//! ```text
//!   HTTP :11000                      Raft :12000
//!  ┌──────────────────────┐        ┌───────────────────┐
//!  │ /key /join /raft     │        │ /raft/append      │
//!  └──────────┬───────────┘        │ /raft/vote        │
//!             │                    │ /raft/snapshot    │
//!             │                    └─────────┬─────────┘
//!   gateway / membership                     │
//!             │                              │
//!  ┌──────────▼──────────────────────────────▼─────────┐
//!  │          ConsensusEngine (openraft + redb)         │
//!  │  propose · configuration · snapshot · subscribe    │
//!  └──────────┬──────────────────────────────┬─────────┘
//!             │ apply / snapshot / restore   │ events
//!  ┌──────────▼───────────┐        ┌─────────▼─────────┐
//!  │ KvStateMachine       │        │ StatePublisher    │
//!  │  └ ReplicatedStore   │        │  └ /dev/shm/...   │
//!  └──────────────────────┘        └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the first node
//! ```bash
//! raftroute-node --id node0 --haddr 127.0.0.1:11000 --raddr 127.0.0.1:12000 ./node0
//! ```
//!
//! ### Start a second node and join the first
//! ```bash
//! raftroute-node --id node1 --haddr 127.0.0.1:11001 --raddr 127.0.0.1:12001 \
//!   --join 127.0.0.1:11000 ./node1
//! ```
//!
//! ### Use the CLI
//! ```bash
//! raftroute set user1 batman --node 127.0.0.1:11000
//! raftroute get user1 --node 127.0.0.1:11001
//! raftroute status --node 127.0.0.1:11001
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod node;
pub mod raft;
pub mod store;

// Re-export commonly used types
pub use common::{Command, Error, RaftConfig, Result};
pub use node::{Node, RunningNode};
pub use raft::{ConsensusEngine, RaftEngine, RaftState};
pub use store::ReplicatedStore;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
