//! Raft RPCs over HTTP
//!
//! Every openraft RPC is a JSON POST to the target's raft address. The
//! receiving node answers with openraft's own `Result`, so a remote raft
//! error comes back intact and only transport failures are local.

use crate::common::config::TransportConfig;
use crate::common::Result;
use crate::raft::types::{NodeId, RaftPeer, TypeConfig};
use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::Span;

pub const APPEND_PATH: &str = "/raft/append";
pub const VOTE_PATH: &str = "/raft/vote";
pub const SNAPSHOT_PATH: &str = "/raft/snapshot";

type RpcResult<T, E> = std::result::Result<T, RPCError<NodeId, RaftPeer, E>>;

/// Hands out one [`HttpConnection`] per peer, sharing a client pool.
pub struct HttpNetwork {
    client: reqwest::Client,
    span: Span,
}

impl HttpNetwork {
    pub fn new(config: &TransportConfig, parent: &Span) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec.max(1)))
            .pool_max_idle_per_host(config.max_pool)
            .build()?;
        Ok(Self {
            client,
            span: tracing::info_span!(parent: parent, "network"),
        })
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetwork {
    type Network = HttpConnection;

    async fn new_client(&mut self, target: NodeId, node: &RaftPeer) -> Self::Network {
        tracing::debug!(parent: &self.span, peer = %node, "opening raft connection");
        HttpConnection {
            client: self.client.clone(),
            target,
            peer: node.clone(),
            span: self.span.clone(),
        }
    }
}

pub struct HttpConnection {
    client: reqwest::Client,
    target: NodeId,
    peer: RaftPeer,
    span: Span,
}

impl HttpConnection {
    async fn post<Req, Resp, E>(&self, path: &str, req: &Req, ttl: Duration) -> RpcResult<Resp, E>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let url = format!("http://{}{}", self.peer.address, path);
        let resp = self
            .client
            .post(&url)
            .timeout(ttl)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(parent: &self.span, peer = %self.peer, error = %e, "raft rpc failed");
                if e.is_connect() {
                    RPCError::Unreachable(Unreachable::new(&e))
                } else {
                    RPCError::Network(NetworkError::new(&e))
                }
            })?;

        if !resp.status().is_success() {
            let err = std::io::Error::other(format!("{} answered {}", url, resp.status()));
            return Err(RPCError::Network(NetworkError::new(&err)));
        }

        let result: std::result::Result<Resp, E> = resp
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for HttpConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<NodeId>, RaftError<NodeId>> {
        self.post(APPEND_PATH, &rpc, option.hard_ttl()).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>> {
        self.post(SNAPSHOT_PATH, &rpc, option.hard_ttl()).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> RpcResult<VoteResponse<NodeId>, RaftError<NodeId>> {
        self.post(VOTE_PATH, &rpc, option.hard_ttl()).await
    }
}
