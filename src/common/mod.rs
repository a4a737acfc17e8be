//! Common utilities and types shared across raftroute

pub mod command;
pub mod config;
pub mod error;
pub mod tracing_middleware;

pub use command::{Command, Operation};
pub use config::{LogConfig, NodeConfig, RaftConfig, SnapshotConfig, TransportConfig};
pub use error::{Error, Result};
