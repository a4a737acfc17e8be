//! Leader-gated command gateway
//!
//! Reads come straight from the local store. Mutations are refused on
//! non-leaders, validated, and proposed to the engine with a bounded wait.
//! Engine errors are reported as they are; nothing is retried here.

use crate::common::command::{self, Command};
use crate::common::{Error, Result};
use crate::node::scheduler::SnapshotScheduler;
use crate::raft::{ConsensusEngine, RaftState};
use crate::store::ReplicatedStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

pub struct WriteGateway {
    engine: Arc<dyn ConsensusEngine>,
    store: Arc<ReplicatedStore>,
    scheduler: Arc<SnapshotScheduler>,
    apply_timeout: Duration,
    span: Span,
}

impl WriteGateway {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        store: Arc<ReplicatedStore>,
        scheduler: Arc<SnapshotScheduler>,
        apply_timeout: Duration,
        parent: &Span,
    ) -> Self {
        Self {
            engine,
            store,
            scheduler,
            apply_timeout,
            span: tracing::info_span!(parent: parent, "gateway"),
        }
    }

    /// Local read; may lag the leader on followers.
    pub fn read(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub fn is_leader(&self) -> bool {
        self.engine.state() == RaftState::Leader
    }

    /// Submit a mutation and wait until it is committed and applied.
    /// Returns the log index it was applied at.
    pub async fn write(&self, cmd: Command) -> Result<u64> {
        if !self.is_leader() {
            let hint = self
                .engine
                .leader()
                .map(|l| l.address)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::NotLeader(hint));
        }
        cmd.validate()?;

        let payload = command::encode(&cmd)?;
        let index = match tokio::time::timeout(self.apply_timeout, self.engine.propose(payload)).await
        {
            Ok(Ok(index)) => index,
            Ok(Err(e)) => {
                tracing::warn!(parent: &self.span, op = %cmd.op, key = %cmd.key, error = %e, "write failed");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    parent: &self.span,
                    op = %cmd.op,
                    key = %cmd.key,
                    timeout_ms = self.apply_timeout.as_millis() as u64,
                    "write timed out waiting for commit"
                );
                return Err(Error::ConsensusTimeout);
            }
        };

        tracing::debug!(parent: &self.span, op = %cmd.op, key = %cmd.key, index, "write applied");
        self.scheduler.record_write();
        Ok(index)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<u64> {
        self.write(Command::set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<u64> {
        self.write(Command::delete(key)).await
    }

    /// One `set` per pair in key order; stops at the first failure.
    pub async fn set_many(&self, pairs: BTreeMap<String, String>) -> Result<usize> {
        let mut applied = 0;
        for (key, value) in &pairs {
            self.set(key, value).await?;
            applied += 1;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::scheduler::SnapshotPolicy;
    use crate::raft::testing;
    use crate::raft::RaftEngine;

    async fn single_node(bootstrap: bool) -> (WriteGateway, Arc<RaftEngine>) {
        let (engine, store) = testing::single_node("a", bootstrap).await;
        let policy = SnapshotPolicy {
            every_n_writes: 0,
            ..SnapshotPolicy::default()
        };
        let scheduler = Arc::new(SnapshotScheduler::new(engine.clone(), policy, &Span::none()));
        let gateway = WriteGateway::new(
            engine.clone(),
            store,
            scheduler,
            Duration::from_secs(10),
            &Span::none(),
        );
        (gateway, engine)
    }

    #[tokio::test]
    async fn test_leader_write_then_read() {
        let (gateway, _engine) = single_node(true).await;
        gateway.set("k1", "v1").await.unwrap();
        assert_eq!(gateway.read("k1").as_deref(), Some("v1"));

        gateway.delete("k1").await.unwrap();
        assert!(gateway.read("k1").is_none());
        assert_eq!(gateway.scheduler.writes(), 2);
    }

    #[tokio::test]
    async fn test_follower_refuses_writes_but_reads() {
        let (gateway, _engine) = single_node(false).await;
        assert!(!gateway.is_leader());
        let err = gateway.set("k", "v").await.unwrap_err();
        assert!(matches!(err, Error::NotLeader(_)));
        let err = gateway.delete("k").await.unwrap_err();
        assert!(matches!(err, Error::NotLeader(_)));
        assert!(gateway.read("k").is_none());
        assert_eq!(gateway.scheduler.writes(), 0);
    }

    #[tokio::test]
    async fn test_follower_refuses_invalid_write_as_not_leader() {
        let (gateway, _engine) = single_node(false).await;
        let err = gateway.set("", "v").await.unwrap_err();
        assert!(matches!(err, Error::NotLeader(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_invalid_command_rejected_before_propose() {
        let (gateway, engine) = single_node(true).await;
        let before = engine.stats().last_log_index;
        assert!(matches!(
            gateway.set("", "v").await,
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            gateway.set("k", "").await,
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(engine.stats().last_log_index, before);
    }

    #[tokio::test]
    async fn test_set_many_in_key_order() {
        let (gateway, engine) = single_node(true).await;
        let before = engine.stats().last_applied;
        let pairs: BTreeMap<String, String> = [("b", "2"), ("a", "1"), ("c", "3")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(gateway.set_many(pairs).await.unwrap(), 3);
        assert_eq!(gateway.read("a").as_deref(), Some("1"));
        assert_eq!(gateway.read("c").as_deref(), Some("3"));
        assert_eq!(engine.stats().last_applied, before + 3);
    }
}
