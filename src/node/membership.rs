//! Cluster membership
//!
//! Joins are idempotent: a node that is already a member with the same id
//! and address is left alone. A member sharing only the id or only the
//! address with the joiner is stale and gets removed before the joiner is
//! added as a non-voter. Removal and addition are two separate
//! configuration changes; if the second one fails the caller retries the
//! whole join.

use crate::common::{Error, Result};
use crate::raft::{ClusterMember, ConsensusEngine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// Body of `POST /join`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub addr: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    AlreadyMember,
    Added,
}

pub struct MembershipManager {
    engine: Arc<dyn ConsensusEngine>,
    span: Span,
}

impl MembershipManager {
    pub fn new(engine: Arc<dyn ConsensusEngine>, parent: &Span) -> Self {
        Self {
            engine,
            span: tracing::info_span!(parent: parent, "membership"),
        }
    }

    pub async fn join(&self, node_id: &str, address: &str) -> Result<JoinOutcome> {
        if node_id.is_empty() || address.is_empty() {
            return Err(Error::InvalidRequest(
                "join needs both a node id and an address".into(),
            ));
        }
        tracing::info!(parent: &self.span, node = node_id, address, "received join request");

        let members = self.engine.configuration().await.map_err(|e| {
            tracing::warn!(parent: &self.span, error = %e, "failed to get raft configuration");
            e
        })?;

        if members
            .iter()
            .any(|m| m.id == node_id && m.address == address)
        {
            tracing::info!(
                parent: &self.span,
                node = node_id,
                address,
                "already member of cluster, ignoring join request"
            );
            return Ok(JoinOutcome::AlreadyMember);
        }

        for stale in members
            .iter()
            .filter(|m| m.id == node_id || m.address == address)
        {
            self.engine.remove_server(&stale.id).await.map_err(|e| {
                tracing::error!(
                    parent: &self.span,
                    node = %stale.id,
                    address = %stale.address,
                    error = %e,
                    "failed to remove stale member"
                );
                e
            })?;
            tracing::info!(parent: &self.span, node = %stale.id, address = %stale.address, "removed stale member");
        }

        self.engine.add_nonvoter(node_id, address).await?;
        tracing::info!(parent: &self.span, node = node_id, address, "node joined successfully");
        Ok(JoinOutcome::Added)
    }

    /// Remove a member. Removing an unknown id succeeds without a change.
    pub async fn remove(&self, node_id: &str) -> Result<()> {
        let members = self.engine.configuration().await?;
        if !members.iter().any(|m| m.id == node_id) {
            tracing::debug!(parent: &self.span, node = node_id, "not a member, nothing to remove");
            return Ok(());
        }
        self.engine.remove_server(node_id).await?;
        tracing::info!(parent: &self.span, node = node_id, "member removed");
        Ok(())
    }

    pub async fn members(&self) -> Result<Vec<ClusterMember>> {
        self.engine.configuration().await
    }

    /// Initialize a one-node cluster led by the local node.
    pub async fn bootstrap_self(&self) -> Result<()> {
        let me = ClusterMember::voter(self.engine.local_id(), self.engine.local_address());
        tracing::info!(parent: &self.span, node = %me.id, address = %me.address, "bootstrapping cluster");
        self.engine.bootstrap(vec![me]).await
    }
}

/// Ask the node at `seed` to add us, after waiting `delay`.
pub async fn request_join(
    client: &reqwest::Client,
    seed: &str,
    node_id: &str,
    raft_addr: &str,
    delay: Duration,
    span: &Span,
) -> Result<()> {
    tokio::time::sleep(delay).await;

    let body = JoinRequest {
        addr: raft_addr.to_string(),
        id: node_id.to_string(),
    };
    let url = format!("http://{}/join", seed);
    let resp = client.post(&url).json(&body).send().await.map_err(|e| {
        tracing::warn!(parent: span, seed, error = %e, "failed to join cluster");
        Error::from(e)
    })?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!(parent: span, seed, %status, "join request rejected");
        return Err(Error::Http(format!("join rejected by {}: {} {}", seed, status, text)));
    }
    tracing::info!(parent: span, seed, node = node_id, "join request accepted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::engine::{EngineStats, EventStream, LeaderInfo, RaftState, SnapshotMeta};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// Records the configuration calls made against it.
    #[derive(Default)]
    struct FakeEngine {
        members: Mutex<Vec<ClusterMember>>,
        calls: Mutex<Vec<String>>,
        fail_add: bool,
    }

    impl FakeEngine {
        fn with(members: Vec<ClusterMember>) -> Self {
            Self {
                members: Mutex::new(members),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ConsensusEngine for FakeEngine {
        fn local_id(&self) -> &str {
            "a"
        }
        fn local_address(&self) -> &str {
            "raft-a"
        }
        fn state(&self) -> RaftState {
            RaftState::Leader
        }
        fn leader(&self) -> Option<LeaderInfo> {
            None
        }
        fn stats(&self) -> EngineStats {
            EngineStats::default()
        }
        async fn propose(&self, _payload: Bytes) -> Result<u64> {
            Ok(1)
        }
        async fn configuration(&self) -> Result<Vec<ClusterMember>> {
            Ok(self.members.lock().clone())
        }
        async fn bootstrap(&self, members: Vec<ClusterMember>) -> Result<()> {
            self.calls.lock().push("bootstrap".into());
            *self.members.lock() = members;
            Ok(())
        }
        async fn add_voter(&self, id: &str, address: &str) -> Result<()> {
            self.calls.lock().push(format!("add_voter {}", id));
            self.members.lock().push(ClusterMember::voter(id, address));
            Ok(())
        }
        async fn add_nonvoter(&self, id: &str, address: &str) -> Result<()> {
            if self.fail_add {
                return Err(Error::Engine("leadership lost".into()));
            }
            self.calls.lock().push(format!("add_nonvoter {}", id));
            self.members.lock().push(ClusterMember::nonvoter(id, address));
            Ok(())
        }
        async fn remove_server(&self, id: &str) -> Result<()> {
            self.calls.lock().push(format!("remove {}", id));
            self.members.lock().retain(|m| m.id != id);
            Ok(())
        }
        async fn snapshot(&self) -> Result<SnapshotMeta> {
            Err(Error::Engine("unused".into()))
        }
        fn subscribe(&self) -> EventStream {
            Box::pin(futures_util::stream::empty())
        }
        async fn shutdown(&self) {}
    }

    fn manager(engine: Arc<FakeEngine>) -> MembershipManager {
        MembershipManager::new(engine, &Span::none())
    }

    #[tokio::test]
    async fn test_exact_member_is_noop() {
        let engine = Arc::new(FakeEngine::with(vec![
            ClusterMember::voter("a", "raft-a"),
            ClusterMember::nonvoter("b", "raft-b"),
        ]));
        let outcome = manager(engine.clone()).join("b", "raft-b").await.unwrap();
        assert_eq!(outcome, JoinOutcome::AlreadyMember);
        assert!(engine.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_new_node_added_as_nonvoter() {
        let engine = Arc::new(FakeEngine::with(vec![ClusterMember::voter("a", "raft-a")]));
        let outcome = manager(engine.clone()).join("b", "raft-b").await.unwrap();
        assert_eq!(outcome, JoinOutcome::Added);
        assert_eq!(*engine.calls.lock(), vec!["add_nonvoter b".to_string()]);
        assert!(engine
            .members
            .lock()
            .contains(&ClusterMember::nonvoter("b", "raft-b")));
    }

    #[tokio::test]
    async fn test_same_id_new_address_replaces() {
        let engine = Arc::new(FakeEngine::with(vec![
            ClusterMember::voter("a", "raft-a"),
            ClusterMember::nonvoter("b", "raft-old"),
        ]));
        manager(engine.clone()).join("b", "raft-new").await.unwrap();
        assert_eq!(
            *engine.calls.lock(),
            vec!["remove b".to_string(), "add_nonvoter b".to_string()]
        );
        let members = engine.members.lock().clone();
        assert_eq!(members.iter().filter(|m| m.id == "b").count(), 1);
        assert!(members.contains(&ClusterMember::nonvoter("b", "raft-new")));
    }

    #[tokio::test]
    async fn test_same_address_new_id_replaces() {
        let engine = Arc::new(FakeEngine::with(vec![
            ClusterMember::voter("a", "raft-a"),
            ClusterMember::nonvoter("old", "raft-b"),
        ]));
        manager(engine.clone()).join("b", "raft-b").await.unwrap();
        assert_eq!(
            *engine.calls.lock(),
            vec!["remove old".to_string(), "add_nonvoter b".to_string()]
        );
        assert!(!engine.members.lock().iter().any(|m| m.id == "old"));
    }

    #[tokio::test]
    async fn test_id_and_address_owned_by_two_members() {
        let engine = Arc::new(FakeEngine::with(vec![
            ClusterMember::voter("a", "raft-a"),
            ClusterMember::nonvoter("b", "raft-x"),
            ClusterMember::nonvoter("c", "raft-b"),
        ]));
        manager(engine.clone()).join("b", "raft-b").await.unwrap();
        let members = engine.members.lock().clone();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&ClusterMember::nonvoter("b", "raft-b")));
    }

    #[tokio::test]
    async fn test_engine_error_surfaces() {
        let engine = Arc::new(FakeEngine {
            fail_add: true,
            ..FakeEngine::with(vec![ClusterMember::voter("a", "raft-a")])
        });
        let err = manager(engine).join("b", "raft-b").await.unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }

    #[tokio::test]
    async fn test_join_rejects_empty_fields() {
        let engine = Arc::new(FakeEngine::default());
        let err = manager(engine).join("", "raft-b").await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let engine = Arc::new(FakeEngine::with(vec![ClusterMember::voter("a", "raft-a")]));
        let membership = manager(engine.clone());
        membership.remove("ghost").await.unwrap();
        assert!(engine.calls.lock().is_empty());

        membership.bootstrap_self().await.unwrap();
        assert_eq!(membership.members().await.unwrap(), vec![ClusterMember::voter("a", "raft-a")]);
    }
}
