//! Snapshot scheduling
//!
//! Two triggers, both off the write path:
//! - every Nth successful mutation schedules a snapshot after a short delay;
//! - when enabled, a periodic check snapshots once enough entries were
//!   applied since the last one.

use crate::common::SnapshotConfig;
use crate::raft::{ConsensusEngine, RaftState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// 0 disables the write-count trigger
    pub every_n_writes: u64,
    pub trigger_delay: Duration,
    pub periodic: Option<PeriodicCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicCheck {
    pub interval: Duration,
    pub threshold: u64,
}

impl SnapshotPolicy {
    pub fn from_config(config: &SnapshotConfig) -> Self {
        Self {
            every_n_writes: config.every_n_writes,
            trigger_delay: Duration::from_millis(config.trigger_delay_ms),
            periodic: config.enabled.then(|| PeriodicCheck {
                interval: Duration::from_secs(config.snapshot_interval_sec),
                threshold: config.snapshot_threshold,
            }),
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::from_config(&SnapshotConfig::default())
    }
}

pub struct SnapshotScheduler {
    engine: Arc<dyn ConsensusEngine>,
    policy: SnapshotPolicy,
    writes: AtomicU64,
    span: Span,
}

impl SnapshotScheduler {
    pub fn new(engine: Arc<dyn ConsensusEngine>, policy: SnapshotPolicy, parent: &Span) -> Self {
        Self {
            engine,
            policy,
            writes: AtomicU64::new(0),
            span: tracing::info_span!(parent: parent, "snapshots"),
        }
    }

    /// Count one successful mutation. Returns the spawned snapshot task
    /// when this write hit the trigger.
    pub fn record_write(&self) -> Option<JoinHandle<()>> {
        let count = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.policy.every_n_writes;
        if every == 0 || count % every != 0 {
            return None;
        }
        tracing::debug!(parent: &self.span, writes = count, "snapshot trigger reached");
        Some(self.spawn_snapshot(self.policy.trigger_delay))
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn spawn_snapshot(&self, delay: Duration) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let span = self.span.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            run_snapshot(engine.as_ref(), &span).await;
        })
    }

    /// Start the periodic threshold check, if the policy has one.
    pub fn start_periodic(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let check = self.policy.periodic?;
        let scheduler = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check.interval);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                if scheduler.engine.state() == RaftState::Shutdown {
                    break;
                }
                let stats = scheduler.engine.stats();
                let pending = stats.last_applied.saturating_sub(stats.last_snapshot_index);
                if pending >= check.threshold {
                    tracing::debug!(parent: &scheduler.span, pending, "snapshot threshold reached");
                    run_snapshot(scheduler.engine.as_ref(), &scheduler.span).await;
                }
            }
        }))
    }
}

async fn run_snapshot(engine: &dyn ConsensusEngine, span: &Span) {
    match engine.snapshot().await {
        Ok(meta) => {
            tracing::info!(parent: span, snapshot = %meta.id, index = meta.index, "snapshot taken")
        }
        Err(e) => tracing::warn!(parent: span, error = %e, "snapshot failed"),
    }
}
