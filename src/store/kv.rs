//! Replicated key-value state
//!
//! Holds the mapping every replica converges on. Only the state machine
//! adapter mutates it, in log order; reads come from the HTTP layer
//! concurrently, so the map carries its own lock.

use crate::common::Result;
use crate::store::snapshot::Snapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;

/// Position of the last log entry applied to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedPosition {
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Default)]
pub struct ReplicatedStore {
    map: Mutex<HashMap<String, String>>,
    applied: Mutex<AppliedPosition>,
}

impl ReplicatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from local state. No consensus round: followers may be stale.
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    pub fn apply_set(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_string(), value.to_string());
    }

    /// Removing an absent key is a no-op.
    pub fn apply_delete(&self, key: &str) {
        self.map.lock().remove(key);
    }

    /// Copy the mapping. The lock is held only for the clone.
    pub fn snapshot(&self) -> Snapshot {
        let copy = self.map.lock().clone();
        Snapshot::from_map(copy)
    }

    /// Replace the whole mapping with a snapshot payload.
    ///
    /// The engine never runs applies concurrently with a restore; decoding
    /// happens before the lock is taken and a bad payload leaves the
    /// current state untouched.
    pub fn restore<R: Read>(&self, reader: R) -> Result<()> {
        let restored = Snapshot::read_from(reader)?.into_map();
        *self.map.lock() = restored;
        Ok(())
    }

    pub fn record_applied(&self, index: u64, term: u64) {
        *self.applied.lock() = AppliedPosition { index, term };
    }

    pub fn last_applied(&self) -> AppliedPosition {
        *self.applied.lock()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::command::{Command, Operation};

    fn apply_all(store: &ReplicatedStore, cmds: &[Command]) {
        for cmd in cmds {
            match cmd.op {
                Operation::Set => store.apply_set(&cmd.key, cmd.value.as_deref().unwrap_or("")),
                Operation::Delete => store.apply_delete(&cmd.key),
                Operation::Unknown(_) => {}
            }
        }
    }

    #[test]
    fn test_set_get_delete() {
        let store = ReplicatedStore::new();
        assert!(store.get("k1").is_none());

        store.apply_set("k1", "v1");
        assert_eq!(store.get("k1").as_deref(), Some("v1"));

        store.apply_set("k1", "v2");
        assert_eq!(store.get("k1").as_deref(), Some("v2"));

        store.apply_delete("k1");
        assert!(store.get("k1").is_none());

        // Deleting again is a no-op
        store.apply_delete("k1");
        assert!(store.is_empty());
    }

    #[test]
    fn test_same_sequence_same_state() {
        let cmds = vec![
            Command::set("a", "1"),
            Command::set("b", "2"),
            Command::delete("a"),
            Command::set("c", "3"),
            Command::set("b", "20"),
            Command::delete("missing"),
        ];
        let left = ReplicatedStore::new();
        let right = ReplicatedStore::new();
        apply_all(&left, &cmds);
        apply_all(&right, &cmds);

        assert_eq!(left.snapshot(), right.snapshot());
        assert_eq!(left.get("b").as_deref(), Some("20"));
        assert!(left.get("a").is_none());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_applies() {
        let store = ReplicatedStore::new();
        store.apply_set("k", "before");
        let snap = store.snapshot();

        store.apply_set("k", "after");
        store.apply_set("other", "x");

        assert_eq!(snap.get("k"), Some("before"));
        assert!(snap.get("other").is_none());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let source = ReplicatedStore::new();
        for i in 0..50 {
            source.apply_set(&format!("key-{}", i), &format!("value-{}", i));
        }
        let payload = source.snapshot().to_json().unwrap();

        let target = ReplicatedStore::new();
        target.apply_set("stale", "gone after restore");
        target.restore(&payload[..]).unwrap();

        for i in 0..50 {
            assert_eq!(
                target.get(&format!("key-{}", i)),
                Some(format!("value-{}", i))
            );
        }
        assert!(target.get("stale").is_none());
        assert!(target.get("key-50").is_none());
        assert_eq!(target.len(), 50);
    }

    #[test]
    fn test_bad_restore_keeps_state() {
        let store = ReplicatedStore::new();
        store.apply_set("k", "v");
        assert!(store.restore(&b"garbage"[..]).is_err());
        assert_eq!(store.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_applied_position() {
        let store = ReplicatedStore::new();
        assert_eq!(store.last_applied(), AppliedPosition::default());
        store.record_applied(7, 2);
        assert_eq!(store.last_applied(), AppliedPosition { index: 7, term: 2 });
    }
}
