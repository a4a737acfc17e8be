//! Node services built around the consensus engine
//!
//! - membership: idempotent joins and removals
//! - gateway: leader-gated writes, local reads
//! - scheduler: when to snapshot
//! - publisher: routing artifact for an external router
//! - http / server: the API surface and the wiring that runs it all
//! - client: talks to that API from the outside

pub mod client;
pub mod gateway;
pub mod http;
pub mod membership;
pub mod publisher;
pub mod scheduler;
pub mod server;

pub use client::{NodeClient, RaftStatus};
pub use gateway::WriteGateway;
pub use membership::{JoinOutcome, JoinRequest, MembershipManager};
pub use publisher::{NodeRuntimeState, StatePublisher};
pub use scheduler::{SnapshotPolicy, SnapshotScheduler};
pub use server::{Node, RunningNode};
