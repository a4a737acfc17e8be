//! Routing artifact publisher
//!
//! Follows the engine's event stream and rewrites a small JSON file,
//! `{"State":"Leader","NodeAddr":"127.0.0.1:12000"}`, on every role or
//! leader change. An external router polls that file. A failed write is
//! logged and the next event tries again.

use crate::common::Result;
use crate::raft::{ConsensusEngine, LeaderInfo, RaftState, StateChange};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::Span;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRuntimeState {
    #[serde(rename = "State")]
    pub state: String,
    /// Raft address of the current leader, empty when unknown
    #[serde(rename = "NodeAddr")]
    pub node_addr: String,
}

impl NodeRuntimeState {
    pub fn new(state: RaftState, leader: Option<&LeaderInfo>) -> Self {
        Self {
            state: state.to_string(),
            node_addr: leader.map(|l| l.address.clone()).unwrap_or_default(),
        }
    }
}

pub struct StatePublisher {
    path: PathBuf,
    engine: Arc<dyn ConsensusEngine>,
    span: Span,
}

impl StatePublisher {
    pub fn new(path: impl Into<PathBuf>, engine: Arc<dyn ConsensusEngine>, parent: &Span) -> Self {
        Self {
            path: path.into(),
            engine,
            span: tracing::info_span!(parent: parent, "publisher"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume the engine's events until the stream ends.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let mut events = self.engine.subscribe();
        let mut role = self.engine.state();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event.change {
                    StateChange::Role(state) => role = state,
                    StateChange::Leader => {}
                    StateChange::Membership(_) => continue,
                }
                tracing::info!(parent: &self.span, state = %role, "raft state changed");
                let state = NodeRuntimeState::new(role, event.leader.as_ref());
                if let Err(e) = self.write(&state).await {
                    tracing::warn!(parent: &self.span, path = %self.path.display(), error = %e, "failed to write state file");
                }
            }
            tracing::debug!(parent: &self.span, "event stream closed");
        })
    }

    /// Write the engine's current view right away.
    pub async fn publish_now(&self) -> Result<NodeRuntimeState> {
        let state = NodeRuntimeState::new(self.engine.state(), self.engine.leader().as_ref());
        self.write(&state).await?;
        Ok(state)
    }

    async fn write(&self, state: &NodeRuntimeState) -> Result<()> {
        let body = serde_json::to_vec(state)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        file.write_all(&body).await?;
        file.flush().await?;
        file.sync_all().await?;
        tracing::debug!(parent: &self.span, path = %self.path.display(), state = %state.state, "state file written");
        Ok(())
    }
}

/// Parse a state file written by [`StatePublisher`].
pub fn read_state_file(path: impl AsRef<Path>) -> Result<NodeRuntimeState> {
    let body = std::fs::read(path)?;
    Ok(serde_json::from_slice(&body)?)
}
