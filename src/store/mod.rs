//! Replicated state held by every node

pub mod kv;
pub mod snapshot;

pub use kv::{AppliedPosition, ReplicatedStore};
pub use snapshot::Snapshot;
