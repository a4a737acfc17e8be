//! [`ConsensusEngine`] on openraft
//!
//! openraft runs elections, replication, commit and snapshot transfer.
//! This wrapper keys members by name, serializes configuration changes,
//! drives snapshots on demand and turns metrics updates into the
//! engine's [`StateEvent`] stream.

use crate::common::{Error, RaftConfig, Result};
use crate::raft::engine::{
    ApplyOutcome, ClusterMember, ConsensusEngine, EngineStats, EventStream, LeaderInfo, RaftState,
    SnapshotMeta, StateChange, StateEvent, StateMachine,
};
use crate::raft::log_store::LogStore;
use crate::raft::network::HttpNetwork;
use crate::raft::snapshot_store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
use crate::raft::state_machine::{cluster_members, StateMachineStore};
use crate::raft::types::{raft_node_id, KvRaft, NodeId, Proposal, RaftPeer};
use async_trait::async_trait;
use bytes::Bytes;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::storage::RaftLogStorage;
use openraft::{ChangeMembers, RaftMetrics, ServerState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::Span;

/// How long a sole voter waits to win its first election
const BOOTSTRAP_WAIT: Duration = Duration::from_secs(10);
const SNAPSHOT_WAIT: Duration = Duration::from_secs(30);
/// How long openraft gets to load a stored log on open
const LOAD_WAIT: Duration = Duration::from_secs(10);

/// Last role, leader and members reported to subscribers
#[derive(Debug, Default)]
struct Observed {
    role: Option<RaftState>,
    leader: Option<LeaderInfo>,
    members: Vec<ClusterMember>,
}

pub struct RaftEngine {
    id: String,
    address: String,
    raft_id: NodeId,
    raft: KvRaft,
    snapshots: Arc<dyn SnapshotStore>,
    /// openraft takes one membership change at a time
    config_changes: tokio::sync::Mutex<()>,
    snapshotting: tokio::sync::Mutex<()>,
    observed: Mutex<Observed>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StateEvent>>>,
    span: Span,
}

fn role_of(state: ServerState) -> RaftState {
    match state {
        ServerState::Leader => RaftState::Leader,
        ServerState::Candidate => RaftState::Candidate,
        ServerState::Shutdown => RaftState::Shutdown,
        ServerState::Follower | ServerState::Learner => RaftState::Follower,
    }
}

fn leader_of(metrics: &RaftMetrics<NodeId, RaftPeer>) -> Option<LeaderInfo> {
    let leader = metrics.current_leader?;
    metrics
        .membership_config
        .membership()
        .get_node(&leader)
        .map(|peer| LeaderInfo {
            id: peer.id.clone(),
            address: peer.address.clone(),
        })
}

fn write_error(err: RaftError<NodeId, ClientWriteError<NodeId, RaftPeer>>) -> Error {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => Error::NotLeader(
            forward
                .leader_node
                .map(|node| node.address)
                .unwrap_or_else(|| "unknown".to_string()),
        ),
        other => Error::Engine(other.to_string()),
    }
}

impl RaftEngine {
    /// Open the log and snapshots for the local node of `config` and start
    /// openraft. `address` is where peers reach this node's raft routes.
    pub async fn open(
        config: &RaftConfig,
        address: impl Into<String>,
        fsm: Arc<dyn StateMachine>,
        parent: &Span,
    ) -> Result<Arc<Self>> {
        let id = config.local_node()?.id.clone();
        let address = address.into();
        let span = tracing::info_span!(parent: parent, "raft");

        let retain = config.snapshot.retain_snapshots;
        let (mut log_store, snapshots): (LogStore, Arc<dyn SnapshotStore>) = if config.inmem {
            (
                LogStore::in_memory(&span)?,
                Arc::new(MemorySnapshotStore::new(retain)),
            )
        } else {
            (
                LogStore::open(&config.raft_dir, &span)?,
                Arc::new(FileSnapshotStore::open(&config.raft_dir, retain)?),
            )
        };
        let stored = log_store
            .get_log_state()
            .await
            .map_err(|e| Error::Engine(e.to_string()))?
            .last_log_id
            .map(|log_id| log_id.index);
        let state_machine = StateMachineStore::open(fsm, snapshots.clone(), &span)?;
        let network = HttpNetwork::new(&config.transport, &span)?;

        let raft_config = openraft::Config {
            cluster_name: config.cluster_name.clone(),
            heartbeat_interval: config.heartbeat_interval_ms,
            election_timeout_min: config.election_timeout_ms,
            election_timeout_max: config.election_timeout_ms * 2,
            // Snapshots are taken by the node's scheduler
            snapshot_policy: openraft::SnapshotPolicy::Never,
            max_in_snapshot_log_to_keep: config.log.trailing_logs,
            ..Default::default()
        }
        .validate()
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let raft_id = raft_node_id(&id);
        let raft = openraft::Raft::new(
            raft_id,
            Arc::new(raft_config),
            network,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| Error::Engine(e.to_string()))?;

        // Membership and positions are only visible once metrics cover the stored log
        raft.wait(Some(LOAD_WAIT))
            .metrics(move |m| m.last_log_index >= stored, "load stored log")
            .await
            .map_err(|e| Error::Engine(e.to_string()))?;
        tracing::info!(
            parent: &span,
            node = %id,
            raft_id,
            address = %address,
            last_log_index = ?stored,
            "raft started"
        );

        let engine = Arc::new(Self {
            id,
            address,
            raft_id,
            raft,
            snapshots,
            config_changes: tokio::sync::Mutex::new(()),
            snapshotting: tokio::sync::Mutex::new(()),
            observed: Mutex::new(Observed::default()),
            subscribers: Mutex::new(Vec::new()),
            span,
        });
        engine.watch_metrics();
        Ok(engine)
    }

    /// Handle for the raft RPC routes.
    pub fn raft(&self) -> &KvRaft {
        &self.raft
    }

    fn metrics(&self) -> RaftMetrics<NodeId, RaftPeer> {
        self.raft.metrics().borrow().clone()
    }

    fn watch_metrics(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let mut metrics = self.raft.metrics();
        tokio::spawn(async move {
            loop {
                let current = metrics.borrow_and_update().clone();
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.observe(&current);
                drop(engine);
                if metrics.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Emit one event per difference from what subscribers last saw:
    /// membership first, then leader, then role.
    fn observe(&self, metrics: &RaftMetrics<NodeId, RaftPeer>) {
        self.transition(
            role_of(metrics.state),
            leader_of(metrics),
            cluster_members(metrics.membership_config.membership()),
        );
    }

    fn transition(&self, role: RaftState, leader: Option<LeaderInfo>, members: Vec<ClusterMember>) {
        let mut observed = self.observed.lock();
        if observed.role == Some(RaftState::Shutdown) {
            return;
        }

        let mut changes = Vec::new();
        if observed.members != members {
            changes.push(StateChange::Membership(members.clone()));
        }
        if observed.leader != leader {
            changes.push(StateChange::Leader);
        }
        if observed.role != Some(role) {
            tracing::info!(parent: &self.span, "entering {} state", role);
            changes.push(StateChange::Role(role));
        }
        if changes.is_empty() {
            return;
        }

        *observed = Observed {
            role: Some(role),
            leader: leader.clone(),
            members,
        };
        let mut subscribers = self.subscribers.lock();
        for change in changes {
            let event = StateEvent::new(change, leader.clone());
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    async fn promote(&self, raft_id: NodeId) -> Result<()> {
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([raft_id])), false)
            .await
            .map_err(write_error)?;
        Ok(())
    }

    /// Add or upsert a member; the caller holds `config_changes`.
    async fn add_member(&self, id: &str, address: &str, voter: bool) -> Result<()> {
        if id.is_empty() || address.is_empty() {
            return Err(Error::InvalidRequest("member id and address must not be empty".into()));
        }
        let raft_id = raft_node_id(id);
        let config = self.metrics().membership_config;
        let membership = config.membership();

        for (existing_id, peer) in membership.nodes() {
            let same_id = peer.id == id;
            let same_address = peer.address == address;
            if same_id && same_address {
                let is_voter = membership.voter_ids().any(|v| v == *existing_id);
                if voter && !is_voter {
                    tracing::info!(parent: &self.span, node = id, "promoting to voter");
                    return self.promote(*existing_id).await;
                }
                return Ok(());
            }
            if same_id || same_address || *existing_id == raft_id {
                return Err(Error::ConfigurationConflict {
                    id: id.to_string(),
                    address: address.to_string(),
                    existing: format!("{} at {}", peer.id, peer.address),
                });
            }
        }

        self.raft
            .add_learner(raft_id, RaftPeer::new(id, address), false)
            .await
            .map_err(write_error)?;
        if voter {
            self.promote(raft_id).await?;
        }
        tracing::info!(parent: &self.span, node = id, address, voter, "member added");
        Ok(())
    }
}

#[async_trait]
impl ConsensusEngine for RaftEngine {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn local_address(&self) -> &str {
        &self.address
    }

    fn state(&self) -> RaftState {
        if self.observed.lock().role == Some(RaftState::Shutdown) {
            return RaftState::Shutdown;
        }
        role_of(self.raft.metrics().borrow().state)
    }

    fn leader(&self) -> Option<LeaderInfo> {
        leader_of(&self.raft.metrics().borrow())
    }

    fn stats(&self) -> EngineStats {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        EngineStats {
            term: metrics.current_term,
            last_log_index: metrics.last_log_index.unwrap_or(0),
            last_applied: metrics.last_applied.map(|l| l.index).unwrap_or(0),
            last_snapshot_index: metrics.snapshot.map(|l| l.index).unwrap_or(0),
        }
    }

    async fn propose(&self, payload: Bytes) -> Result<u64> {
        let resp = self
            .raft
            .client_write(Proposal { command: payload })
            .await
            .map_err(write_error)?;
        if let ApplyOutcome::Skipped(reason) = &resp.data {
            tracing::warn!(parent: &self.span, index = resp.log_id.index, reason = %reason, "committed entry was skipped");
        }
        Ok(resp.log_id.index)
    }

    async fn configuration(&self) -> Result<Vec<ClusterMember>> {
        let config = self.metrics().membership_config;
        Ok(cluster_members(config.membership()))
    }

    async fn bootstrap(&self, members: Vec<ClusterMember>) -> Result<()> {
        let voters: BTreeMap<NodeId, RaftPeer> = members
            .iter()
            .filter(|m| m.voter)
            .map(|m| (raft_node_id(&m.id), RaftPeer::new(&m.id, &m.address)))
            .collect();
        if voters.is_empty() {
            return Err(Error::InvalidRequest("bootstrap needs at least one voter".into()));
        }
        if voters.len() != members.iter().filter(|m| m.voter).count() {
            return Err(Error::InvalidRequest("bootstrap members must have distinct ids".into()));
        }

        let _changes = self.config_changes.lock().await;
        self.raft.initialize(voters.clone()).await.map_err(|e| match e {
            RaftError::APIError(InitializeError::NotAllowed(_)) => {
                Error::Engine("cluster already bootstrapped".into())
            }
            other => Error::Engine(other.to_string()),
        })?;
        tracing::info!(parent: &self.span, voters = voters.len(), "cluster bootstrapped");

        if voters.len() == 1 && voters.contains_key(&self.raft_id) {
            let metrics = self
                .raft
                .wait(Some(BOOTSTRAP_WAIT))
                .state(ServerState::Leader, "bootstrap leadership")
                .await
                .map_err(|e| Error::Engine(e.to_string()))?;
            self.observe(&metrics);
        }

        for member in members.iter().filter(|m| !m.voter) {
            self.add_member(&member.id, &member.address, false).await?;
        }
        Ok(())
    }

    async fn add_voter(&self, id: &str, address: &str) -> Result<()> {
        let _changes = self.config_changes.lock().await;
        self.add_member(id, address, true).await
    }

    async fn add_nonvoter(&self, id: &str, address: &str) -> Result<()> {
        let _changes = self.config_changes.lock().await;
        self.add_member(id, address, false).await
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        let _changes = self.config_changes.lock().await;
        let config = self.metrics().membership_config;
        let membership = config.membership();
        let Some(raft_id) = membership
            .nodes()
            .find(|(_, peer)| peer.id == id)
            .map(|(raft_id, _)| *raft_id)
        else {
            return Ok(());
        };

        let removed = BTreeSet::from([raft_id]);
        let change = if membership.voter_ids().any(|v| v == raft_id) {
            ChangeMembers::RemoveVoters(removed)
        } else {
            ChangeMembers::RemoveNodes(removed)
        };
        self.raft
            .change_membership(change, false)
            .await
            .map_err(write_error)?;
        tracing::info!(parent: &self.span, node = id, "member removed");
        Ok(())
    }

    async fn snapshot(&self) -> Result<SnapshotMeta> {
        let _snapshotting = self.snapshotting.lock().await;
        let (applied, snapshotted) = {
            let metrics = self.raft.metrics();
            let metrics = metrics.borrow();
            (metrics.last_applied, metrics.snapshot)
        };
        let target = match applied {
            Some(applied) if snapshotted.map(|s| s.index) < Some(applied.index) => applied.index,
            _ => return Err(Error::Snapshot("nothing new to snapshot".into())),
        };

        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| Error::Engine(e.to_string()))?;
        self.raft
            .wait(Some(SNAPSHOT_WAIT))
            .metrics(
                move |m| m.snapshot.map(|s| s.index) >= Some(target),
                "snapshot to cover applied entries",
            )
            .await
            .map_err(|e| Error::Snapshot(e.to_string()))?;

        self.snapshots
            .latest()?
            .ok_or_else(|| Error::Snapshot("snapshot missing from store".into()))
    }

    fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            tracing::warn!(parent: &self.span, error = %e, "raft did not stop cleanly");
        }
        let members = self.observed.lock().members.clone();
        self.transition(RaftState::Shutdown, None, members);
        self.subscribers.lock().clear();
        tracing::info!(parent: &self.span, "engine shut down");
    }
}
