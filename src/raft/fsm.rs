//! State machine adapter
//!
//! Bridges the engine's [`StateMachine`] calls onto the
//! [`ReplicatedStore`]: decode the payload, apply it, remember the
//! position. A payload that does not decode, or carries an op this
//! version does not know, is logged and skipped. Once an entry is
//! committed every replica has to treat it the same way, and skipping is
//! the only outcome all of them can agree on.

use crate::common::command::{self, Operation};
use crate::common::Result;
use crate::raft::engine::{ApplyOutcome, FsmSnapshot, SnapshotMeta, SnapshotSink, StateMachine};
use crate::store::{ReplicatedStore, Snapshot};
use std::io::Read;
use std::sync::Arc;
use tracing::Span;

pub struct KvStateMachine {
    store: Arc<ReplicatedStore>,
    span: Span,
}

impl KvStateMachine {
    pub fn new(store: Arc<ReplicatedStore>, parent: &Span) -> Self {
        Self {
            store,
            span: tracing::info_span!(parent: parent, "fsm"),
        }
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, index: u64, term: u64, payload: &[u8]) -> ApplyOutcome {
        tracing::debug!(parent: &self.span, index, term, bytes = payload.len(), "received log");

        let outcome = match command::decode(payload) {
            Ok(cmd) => match cmd.op {
                Operation::Set => {
                    let value = cmd.value.as_deref().unwrap_or_default();
                    self.store.apply_set(&cmd.key, value);
                    tracing::debug!(parent: &self.span, index, key = %cmd.key, "applied set");
                    ApplyOutcome::Applied
                }
                Operation::Delete => {
                    self.store.apply_delete(&cmd.key);
                    tracing::debug!(parent: &self.span, index, key = %cmd.key, "applied delete");
                    ApplyOutcome::Applied
                }
                Operation::Unknown(op) => {
                    tracing::error!(parent: &self.span, index, op = %op, "unrecognized command op");
                    ApplyOutcome::Skipped(format!("unrecognized command op: {}", op))
                }
            },
            Err(e) => {
                tracing::error!(parent: &self.span, index, error = %e, "failed to decode command");
                ApplyOutcome::Skipped(e.to_string())
            }
        };

        self.store.record_applied(index, term);
        outcome
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>> {
        let state = self.store.snapshot();
        tracing::debug!(parent: &self.span, keys = state.len(), "snapshot taken");
        Ok(Box::new(KvSnapshot {
            state,
            span: self.span.clone(),
        }))
    }

    fn restore(&self, meta: &SnapshotMeta, data: Box<dyn Read + Send>) -> Result<()> {
        self.store.restore(data)?;
        self.store.record_applied(meta.index, meta.term);
        tracing::info!(
            parent: &self.span,
            snapshot = %meta.id,
            index = meta.index,
            keys = self.store.len(),
            "restored from snapshot"
        );
        Ok(())
    }
}

/// Frozen copy of the mapping waiting to be persisted.
pub struct KvSnapshot {
    state: Snapshot,
    span: Span,
}

impl FsmSnapshot for KvSnapshot {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()> {
        let written = self.state.write_to(sink);
        let result = match written {
            Ok(()) => sink.close(),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            tracing::warn!(parent: &self.span, sink = %sink.id(), error = %e, "snapshot persist failed");
            if let Err(cancel_err) = sink.cancel() {
                tracing::warn!(parent: &self.span, error = %cancel_err, "failed to cancel snapshot sink");
            }
        }
        result
    }
}
