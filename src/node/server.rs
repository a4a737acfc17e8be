//! Node wiring
//!
//! Binds the HTTP and raft listeners, assembles store, state machine,
//! engine and the node services around it, then either bootstraps a new
//! cluster or asks a seed node to let it join.

use crate::common::{RaftConfig, Result};
use crate::node::gateway::WriteGateway;
use crate::node::http::{create_raft_router, create_router, NodeState};
use crate::node::membership::{request_join, MembershipManager};
use crate::node::publisher::StatePublisher;
use crate::node::scheduler::{SnapshotPolicy, SnapshotScheduler};
use crate::raft::{ConsensusEngine, KvStateMachine, RaftEngine};
use crate::store::ReplicatedStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Span;

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

pub struct Node {
    config: RaftConfig,
    span: Span,
}

/// A node whose listeners are bound and whose tasks are running.
pub struct RunningNode {
    pub engine: Arc<RaftEngine>,
    pub store: Arc<ReplicatedStore>,
    pub gateway: Arc<WriteGateway>,
    pub membership: Arc<MembershipManager>,
    pub publisher: Arc<StatePublisher>,
    pub scheduler: Arc<SnapshotScheduler>,
    http_addr: SocketAddr,
    raft_addr: SocketAddr,
    stop: watch::Sender<bool>,
    servers: Vec<JoinHandle<()>>,
    publishing: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    span: Span,
}

impl Node {
    pub fn new(config: RaftConfig) -> Self {
        let span = tracing::info_span!("node", cluster = %config.cluster_name);
        Self { config, span }
    }

    pub async fn start(self) -> Result<RunningNode> {
        let config = self.config;
        let span = self.span;
        config.validate()?;
        let local = config.local_node()?.clone();

        let http_listener = TcpListener::bind(&local.address).await?;
        let raft_listener = TcpListener::bind(&local.raft_bind).await?;
        let http_addr = http_listener.local_addr()?;
        let raft_addr = raft_listener.local_addr()?;

        tracing::info!(parent: &span, "Starting node: {}", local.id);
        tracing::info!(parent: &span, "  HTTP API: {}", http_addr);
        tracing::info!(parent: &span, "  Raft: {}", raft_addr);
        if config.inmem {
            tracing::info!(parent: &span, "  Log and snapshots: in memory");
        } else {
            tracing::info!(parent: &span, "  Log and snapshots: {}", config.raft_dir.display());
        }

        let store = Arc::new(ReplicatedStore::new());
        let fsm = Arc::new(KvStateMachine::new(store.clone(), &span));
        let engine = RaftEngine::open(&config, raft_addr.to_string(), fsm, &span).await?;
        let dyn_engine: Arc<dyn ConsensusEngine> = engine.clone();

        let scheduler = Arc::new(SnapshotScheduler::new(
            dyn_engine.clone(),
            SnapshotPolicy::from_config(&config.snapshot),
            &span,
        ));
        let gateway = Arc::new(WriteGateway::new(
            dyn_engine.clone(),
            store.clone(),
            scheduler.clone(),
            config.apply_timeout(),
            &span,
        ));
        let membership = Arc::new(MembershipManager::new(dyn_engine.clone(), &span));
        let publisher = Arc::new(StatePublisher::new(
            &config.state_file,
            dyn_engine.clone(),
            &span,
        ));

        let publishing = publisher.clone().start();
        let mut background: Vec<JoinHandle<()>> = scheduler.start_periodic().into_iter().collect();

        let (stop, stopped) = watch::channel(false);
        let state = NodeState {
            gateway: gateway.clone(),
            membership: membership.clone(),
            engine: dyn_engine,
        };
        let servers = vec![
            serve(http_listener, create_router(state), stopped.clone(), "http", &span),
            serve(
                raft_listener,
                create_raft_router(engine.raft().clone()),
                stopped,
                "raft",
                &span,
            ),
        ];

        if config.single_node {
            if config.bootstrap_expect > 1 {
                tracing::warn!(
                    parent: &span,
                    expect = config.bootstrap_expect,
                    "bootstrapping alone; other nodes must join"
                );
            }
            if membership.members().await?.is_empty() {
                membership.bootstrap_self().await?;
            } else {
                tracing::info!(parent: &span, "configuration recovered, skipping bootstrap");
            }
        } else {
            background.push(spawn_join(
                &config,
                local.id.clone(),
                raft_addr.to_string(),
                publisher.clone(),
                &span,
            ));
        }

        tracing::info!(parent: &span, "✓ Node ready ({})", engine.state());
        Ok(RunningNode {
            engine,
            store,
            gateway,
            membership,
            publisher,
            scheduler,
            http_addr,
            raft_addr,
            stop,
            servers,
            publishing,
            background,
            span,
        })
    }

    /// Run until ctrl-c or until a listener fails.
    pub async fn serve(self) -> Result<()> {
        let mut node = self.start().await?;
        let mut servers = std::mem::take(&mut node.servers);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(parent: &node.span, "shutdown requested");
            }
            (res, _, _) = futures_util::future::select_all(servers.iter_mut()) => {
                if let Err(e) = res {
                    tracing::error!(parent: &node.span, "server task failed: {}", e);
                }
            }
        }

        node.servers = servers;
        node.shutdown().await;
        Ok(())
    }
}

fn serve(
    listener: TcpListener,
    router: axum::Router,
    mut stopped: watch::Receiver<bool>,
    name: &'static str,
    span: &Span,
) -> JoinHandle<()> {
    let span = span.clone();
    tokio::spawn(async move {
        let shutdown = async move {
            // Also resolves when the sender is dropped
            let _ = stopped.changed().await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(parent: &span, server = name, "server error: {}", e);
        }
    })
}

fn spawn_join(
    config: &RaftConfig,
    node_id: String,
    raft_addr: String,
    publisher: Arc<StatePublisher>,
    span: &Span,
) -> JoinHandle<()> {
    let seed = config.server.address.clone();
    let delay = config.join_delay();
    let timeout = std::time::Duration::from_secs(config.transport.timeout_sec.max(1));
    let span = span.clone();
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(parent: &span, error = %e, "failed to build join client");
                return;
            }
        };
        if request_join(&client, &seed, &node_id, &raft_addr, delay, &span)
            .await
            .is_ok()
        {
            if let Err(e) = publisher.publish_now().await {
                tracing::warn!(parent: &span, error = %e, "failed to write state file after join");
            }
        }
    })
}

impl RunningNode {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn raft_addr(&self) -> SocketAddr {
        self.raft_addr
    }

    pub fn id(&self) -> &str {
        self.engine.local_id()
    }

    /// Stop accepting requests, shut the engine down and wait for tasks.
    pub async fn shutdown(self) {
        let span = self.span.clone();
        let _ = self.stop.send(true);
        self.engine.shutdown().await;
        for server in self.servers {
            // A server that already failed was polled to completion in `serve`
            if !server.is_finished() {
                let _ = server.await;
            }
        }
        // The event stream closed with the engine; let the last state land
        if tokio::time::timeout(SHUTDOWN_GRACE, self.publishing)
            .await
            .is_err()
        {
            tracing::warn!(parent: &span, "state publisher did not finish in time");
        }
        for task in self.background {
            task.abort();
        }
        tracing::info!(parent: &span, "node stopped");
    }
}
