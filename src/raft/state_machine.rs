//! openraft state machine over a [`StateMachine`]
//!
//! Committed entries go to the application's `apply`; snapshots are
//! persisted through a [`SnapshotStore`] and carry openraft's own log id
//! and membership so a restart can resume from the newest one.

use crate::raft::engine::{ApplyOutcome, ClusterMember, FsmSnapshot, SnapshotMeta, StateMachine};
use crate::raft::snapshot_store::{snapshot_id, SnapshotStore};
use crate::raft::types::{NodeId, RaftPeer, RaftSnapshotMeta, TypeConfig};
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, Membership, Snapshot, StorageError,
    StoredMembership,
};
use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use tracing::Span;

fn read_err(e: impl std::fmt::Display) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

fn write_err(e: impl std::fmt::Display) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

/// Members of an openraft membership config, voters flagged.
pub fn cluster_members(membership: &Membership<NodeId, RaftPeer>) -> Vec<ClusterMember> {
    let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
    membership
        .nodes()
        .map(|(nid, peer)| ClusterMember {
            id: peer.id.clone(),
            address: peer.address.clone(),
            voter: voters.contains(nid),
        })
        .collect()
}

/// Application-facing description of an openraft snapshot.
pub fn describe_snapshot(raft: &RaftSnapshotMeta) -> SnapshotMeta {
    let (index, term) = raft
        .last_log_id
        .map(|log_id| (log_id.index, log_id.leader_id.term))
        .unwrap_or((0, 0));
    SnapshotMeta {
        id: raft.snapshot_id.clone(),
        index,
        term,
        members: cluster_members(raft.last_membership.membership()),
        size: 0,
        raft: Some(raft.clone()),
    }
}

pub struct StateMachineStore {
    fsm: Arc<dyn StateMachine>,
    snapshots: Arc<dyn SnapshotStore>,
    applied: Option<LogId<NodeId>>,
    membership: StoredMembership<NodeId, RaftPeer>,
    span: Span,
}

impl StateMachineStore {
    /// Wrap `fsm`, first restoring it from the newest stored snapshot.
    pub fn open(
        fsm: Arc<dyn StateMachine>,
        snapshots: Arc<dyn SnapshotStore>,
        parent: &Span,
    ) -> crate::common::Result<Self> {
        let mut store = Self {
            fsm,
            snapshots,
            applied: None,
            membership: StoredMembership::default(),
            span: tracing::info_span!(parent: parent, "state_machine"),
        };

        if let Some(latest) = store.snapshots.latest()? {
            let Some(raft) = latest.raft.clone() else {
                tracing::warn!(parent: &store.span, snapshot = %latest.id, "snapshot without log position, ignoring");
                return Ok(store);
            };
            let (meta, reader) = store.snapshots.open(&latest.id)?;
            store.fsm.restore(&meta, reader)?;
            store.applied = raft.last_log_id;
            store.membership = raft.last_membership;
        }
        Ok(store)
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = KvSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, RaftPeer>), StorageError<NodeId>>
    {
        Ok((self.applied, self.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyOutcome>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut outcomes = Vec::new();
        for entry in entries {
            let log_id = entry.log_id;
            self.applied = Some(log_id);
            let outcome = match entry.payload {
                EntryPayload::Blank => ApplyOutcome::Applied,
                EntryPayload::Normal(proposal) => {
                    self.fsm
                        .apply(log_id.index, log_id.leader_id.term, &proposal.command)
                }
                EntryPayload::Membership(membership) => {
                    tracing::info!(parent: &self.span, index = log_id.index, "configuration committed");
                    self.membership = StoredMembership::new(Some(log_id), membership);
                    ApplyOutcome::Applied
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        // Frozen now: openraft keeps applying while the builder runs
        KvSnapshotBuilder {
            frozen: Some(self.fsm.snapshot().map_err(|e| e.to_string())),
            snapshots: self.snapshots.clone(),
            applied: self.applied,
            membership: self.membership.clone(),
            span: self.span.clone(),
        }
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &RaftSnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        let described = describe_snapshot(meta);

        let mut sink = self.snapshots.create(described.clone()).map_err(write_err)?;
        sink.write_all(&data).map_err(write_err)?;
        sink.close().map_err(write_err)?;

        self.fsm
            .restore(&described, Box::new(Cursor::new(data)))
            .map_err(write_err)?;
        self.applied = meta.last_log_id;
        self.membership = meta.last_membership.clone();
        tracing::info!(parent: &self.span, snapshot = %meta.snapshot_id, index = described.index, "installed snapshot from leader");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let Some(latest) = self.snapshots.latest().map_err(read_err)? else {
            return Ok(None);
        };
        let Some(raft) = latest.raft else {
            return Ok(None);
        };
        let (_, mut reader) = self.snapshots.open(&latest.id).map_err(read_err)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).map_err(read_err)?;
        Ok(Some(Snapshot {
            meta: raft,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

pub struct KvSnapshotBuilder {
    frozen: Option<Result<Box<dyn FsmSnapshot>, String>>,
    snapshots: Arc<dyn SnapshotStore>,
    applied: Option<LogId<NodeId>>,
    membership: StoredMembership<NodeId, RaftPeer>,
    span: Span,
}

impl RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let mut frozen = self
            .frozen
            .take()
            .ok_or_else(|| write_err("snapshot builder already used"))?
            .map_err(write_err)?;

        let (index, term) = self
            .applied
            .map(|log_id| (log_id.index, log_id.leader_id.term))
            .unwrap_or((0, 0));
        let raft = RaftSnapshotMeta {
            last_log_id: self.applied,
            last_membership: self.membership.clone(),
            snapshot_id: snapshot_id(term, index),
        };
        let described = describe_snapshot(&raft);

        let mut sink = self.snapshots.create(described.clone()).map_err(write_err)?;
        let persisted = frozen.persist(sink.as_mut());
        frozen.release();
        persisted.map_err(write_err)?;

        let (stored, mut reader) = self.snapshots.open(&described.id).map_err(read_err)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).map_err(read_err)?;
        tracing::info!(parent: &self.span, snapshot = %stored.id, index, bytes = stored.size, "snapshot persisted");

        Ok(Snapshot {
            meta: raft,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}
