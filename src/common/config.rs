//! Configuration for raftroute nodes
//!
//! A node is configured either from a JSON/TOML file (layered with
//! `RAFTROUTE__*` environment variables) or from command-line flags.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides (`RAFTROUTE__SINGLE_NODE=true`)
pub const ENV_PREFIX: &str = "RAFTROUTE";

/// Full node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Node list; the first entry describes the local node
    pub nodes: Vec<NodeConfig>,

    /// Directory for snapshots
    #[serde(default = "default_raft_dir")]
    pub raft_dir: PathBuf,

    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default = "default_bootstrap_expect")]
    pub bootstrap_expect: usize,

    /// Bootstrap a fresh cluster containing only this node
    #[serde(default)]
    pub single_node: bool,

    /// Seed node contacted by non-bootstrap nodes
    #[serde(default)]
    pub server: ServerConfig,

    /// Routing artifact rewritten on every state change
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Upper bound on a single write's wait for commit
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_ms: u64,

    /// Delay before a non-bootstrap node sends its join request
    #[serde(default = "default_join_delay")]
    pub join_delay_ms: u64,

    /// Keep the raft log and snapshots in memory instead of `raft_dir`
    #[serde(default)]
    pub inmem: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    /// HTTP API address
    pub address: String,
    /// Raft (internal replication) address
    pub raft_bind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Enables the periodic threshold check
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_sec: u64,

    /// Entries applied since the last snapshot before the periodic check fires
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    #[serde(default = "default_retain_snapshots")]
    pub retain_snapshots: usize,

    /// Snapshot after every Nth successful write (0 disables)
    #[serde(default = "default_every_n_writes")]
    pub every_n_writes: u64,

    #[serde(default = "default_trigger_delay")]
    pub trigger_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Accepted but unused: the raft log is `raft.db` under `raft_dir`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Entries kept in the log after a snapshot truncates it
    #[serde(default = "default_trailing_logs")]
    pub trailing_logs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type", default = "default_transport_type")]
    pub kind: String,

    #[serde(default = "default_max_pool")]
    pub max_pool: usize,

    #[serde(default = "default_transport_timeout")]
    pub timeout_sec: u64,
}

fn default_cluster_name() -> String {
    "raftroute".to_string()
}
fn default_raft_dir() -> PathBuf {
    PathBuf::from("./raft-data")
}
fn default_election_timeout() -> u64 {
    1000
}
fn default_heartbeat_interval() -> u64 {
    250
}
fn default_bootstrap_expect() -> usize {
    1
}
fn default_state_file() -> PathBuf {
    PathBuf::from("/dev/shm/raftstate")
}
fn default_apply_timeout() -> u64 {
    10_000
}
fn default_join_delay() -> u64 {
    5_000
}
fn default_snapshot_interval() -> u64 {
    30
}
fn default_snapshot_threshold() -> u64 {
    1000
}
fn default_retain_snapshots() -> usize {
    3
}
fn default_every_n_writes() -> u64 {
    3
}
fn default_trigger_delay() -> u64 {
    1000
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/raft/logs")
}
fn default_trailing_logs() -> u64 {
    10240
}
fn default_transport_type() -> String {
    "tcp".to_string()
}
fn default_max_pool() -> usize {
    3
}
fn default_transport_timeout() -> u64 {
    5
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            snapshot_interval_sec: default_snapshot_interval(),
            snapshot_threshold: default_snapshot_threshold(),
            retain_snapshots: default_retain_snapshots(),
            every_n_writes: default_every_n_writes(),
            trigger_delay_ms: default_trigger_delay(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            trailing_logs: default_trailing_logs(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_type(),
            max_pool: default_max_pool(),
            timeout_sec: default_transport_timeout(),
        }
    }
}

impl RaftConfig {
    /// Build a config for one node from command-line style arguments.
    ///
    /// Without a seed the node bootstraps itself.
    pub fn for_node(
        id: impl Into<String>,
        http_addr: impl Into<String>,
        raft_addr: impl Into<String>,
        raft_dir: impl Into<PathBuf>,
        seed: Option<String>,
    ) -> Self {
        let seed = seed.filter(|s| !s.is_empty());
        Self {
            cluster_name: default_cluster_name(),
            nodes: vec![NodeConfig {
                id: id.into(),
                address: http_addr.into(),
                raft_bind: raft_addr.into(),
            }],
            raft_dir: raft_dir.into(),
            election_timeout_ms: default_election_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            snapshot: SnapshotConfig::default(),
            log: LogConfig::default(),
            transport: TransportConfig::default(),
            bootstrap_expect: default_bootstrap_expect(),
            single_node: seed.is_none(),
            server: ServerConfig {
                address: seed.unwrap_or_default(),
            },
            state_file: default_state_file(),
            apply_timeout_ms: default_apply_timeout(),
            join_delay_ms: default_join_delay(),
            inmem: false,
        }
    }

    /// Load from a JSON or TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: RaftConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let local = self.local_node()?;
        if local.id.is_empty() {
            return Err(Error::InvalidConfig("node id must not be empty".into()));
        }
        if local.raft_bind.is_empty() || local.address.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "node {} needs both address and raft_bind",
                local.id
            )));
        }
        if !self.single_node && self.server.address.is_empty() {
            return Err(Error::InvalidConfig(
                "server.address is required unless single_node is set".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.election_timeout_ms == 0 {
            return Err(Error::InvalidConfig("raft timeouts must be positive".into()));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_interval_ms ({}) must be below election_timeout_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }
        if self.apply_timeout_ms == 0 {
            return Err(Error::InvalidConfig("apply_timeout_ms must be positive".into()));
        }
        if self.snapshot.enabled && self.snapshot.snapshot_interval_sec == 0 {
            return Err(Error::InvalidConfig(
                "snapshot_interval_sec must be positive when snapshots are enabled".into(),
            ));
        }
        Ok(())
    }

    /// The local node is the first entry of `nodes`.
    pub fn local_node(&self) -> Result<&NodeConfig> {
        self.nodes
            .first()
            .ok_or_else(|| Error::InvalidConfig("at least one node entry is required".into()))
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(self.join_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }
}
