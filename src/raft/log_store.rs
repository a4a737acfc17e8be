//! Raft log and vote storage on redb
//!
//! Entries, the vote, the committed id and the last purged id all live in
//! one redb database: `<raft_dir>/raft.db` for durable nodes, an in-memory
//! backend for `inmem` ones. Entries are JSON.

use crate::common::{Error, Result};
use crate::raft::types::{NodeId, TypeConfig};
use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, ErrorSubject, ErrorVerb, LogId, StorageError, Vote};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;
use tracing::Span;

pub const LOG_DB_FILE: &str = "raft.db";

const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const LAST_PURGED_KEY: &str = "last_purged";

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

fn storage_err(e: impl std::fmt::Display) -> Error {
    Error::Engine(format!("log store: {}", e))
}

pub struct LogStore {
    db: Arc<Database>,
    span: Span,
}

/// Read handle handed to openraft's replication tasks
pub struct LogReader {
    db: Arc<Database>,
}

impl LogStore {
    /// Open (or create) the durable log under `dir`.
    pub fn open(dir: impl AsRef<Path>, parent: &Span) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let db = Database::create(dir.as_ref().join(LOG_DB_FILE)).map_err(storage_err)?;
        Self::with_db(db, parent)
    }

    /// A log that disappears with the process.
    pub fn in_memory(parent: &Span) -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(storage_err)?;
        Self::with_db(db, parent)
    }

    fn with_db(db: Database, parent: &Span) -> Result<Self> {
        let txn = db.begin_write().map_err(storage_err)?;
        txn.open_table(LOG_TABLE).map_err(storage_err)?;
        txn.open_table(META_TABLE).map_err(storage_err)?;
        txn.commit().map_err(storage_err)?;
        Ok(Self {
            db: Arc::new(db),
            span: tracing::info_span!(parent: parent, "log_store"),
        })
    }

    fn write_meta<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        let data = serde_json::to_vec(value).map_err(write_err)?;
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(write_err)?;
            table.insert(key, data.as_slice()).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;
        Ok(())
    }

    fn read_meta<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> std::result::Result<Option<T>, StorageError<NodeId>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(META_TABLE).map_err(read_err)?;
        match table.get(key).map_err(read_err)? {
            Some(val) => Ok(Some(serde_json::from_slice(val.value()).map_err(read_err)?)),
            None => Ok(None),
        }
    }

    /// Remove every entry whose index falls in `range`.
    fn remove_range(
        &self,
        range: impl RangeBounds<u64>,
    ) -> std::result::Result<usize, StorageError<NodeId>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        let removed = {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_err)?;
            let keys: Vec<u64> = table
                .range(range)
                .map_err(write_err)?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<std::result::Result<_, _>>()
                .map_err(write_err)?;
            for key in &keys {
                table.remove(*key).map_err(write_err)?;
            }
            keys.len()
        };
        txn.commit().map_err(write_err)?;
        Ok(removed)
    }
}

impl RaftLogReader<TypeConfig> for LogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(read_err)?;

        let mut entries = Vec::new();
        for item in table.range(range).map_err(read_err)? {
            let (_, val) = item.map_err(read_err)?;
            entries.push(serde_json::from_slice(val.value()).map_err(read_err)?);
        }
        Ok(entries)
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let mut reader = LogReader {
            db: Arc::clone(&self.db),
        };
        reader.try_get_log_entries(range).await
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = LogReader;

    async fn get_log_state(
        &mut self,
    ) -> std::result::Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_in_table = {
            let txn = self.db.begin_read().map_err(read_err)?;
            let table = txn.open_table(LOG_TABLE).map_err(read_err)?;
            let last = match table.last().map_err(read_err)? {
                Some((_, val)) => {
                    let entry: Entry<TypeConfig> =
                        serde_json::from_slice(val.value()).map_err(read_err)?;
                    Some(entry.log_id)
                }
                None => None,
            };
            last
        };
        let last_purged_log_id: Option<LogId<NodeId>> = self.read_meta(LAST_PURGED_KEY)?;

        // A fully purged log ends where the purge did
        Ok(LogState {
            last_purged_log_id,
            last_log_id: last_in_table.or(last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        LogReader {
            db: Arc::clone(&self.db),
        }
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> std::result::Result<(), StorageError<NodeId>> {
        self.write_meta(VOTE_KEY, vote)?;
        tracing::debug!(parent: &self.span, vote = ?vote, "saved vote");
        Ok(())
    }

    async fn read_vote(&mut self) -> std::result::Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.read_meta(VOTE_KEY)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> std::result::Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_err)?;
            for entry in entries {
                let data = serde_json::to_vec(&entry).map_err(write_err)?;
                table
                    .insert(entry.log_id.index, data.as_slice())
                    .map_err(write_err)?;
            }
        }
        txn.commit().map_err(write_err)?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> std::result::Result<(), StorageError<NodeId>> {
        let removed = self.remove_range(log_id.index..)?;
        tracing::debug!(parent: &self.span, index = log_id.index, removed, "truncated log");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> std::result::Result<(), StorageError<NodeId>> {
        self.write_meta(LAST_PURGED_KEY, &log_id)?;
        let removed = self.remove_range(..=log_id.index)?;
        tracing::debug!(parent: &self.span, index = log_id.index, removed, "purged log");
        Ok(())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        if let Some(log_id) = committed {
            self.write_meta(COMMITTED_KEY, &log_id)?;
        }
        Ok(())
    }

    async fn read_committed(
        &mut self,
    ) -> std::result::Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        self.read_meta(COMMITTED_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::CommittedLeaderId;

    fn blank(index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 7), index),
            payload: openraft::EntryPayload::Blank,
        }
    }

    // `LogFlushed` cannot be built outside openraft, so entries go in directly.
    fn insert(store: &LogStore, entries: &[Entry<TypeConfig>]) {
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(LOG_TABLE).unwrap();
            for entry in entries {
                let data = serde_json::to_vec(entry).unwrap();
                table.insert(entry.log_id.index, data.as_slice()).unwrap();
            }
        }
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn test_empty_log_state() {
        let mut store = LogStore::in_memory(&Span::none()).unwrap();
        let state = store.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        assert!(state.last_purged_log_id.is_none());
        assert!(store.read_vote().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vote_and_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = LogStore::open(dir.path(), &Span::none()).unwrap();
            store.save_vote(&Vote::new(3, 7)).await.unwrap();
            store
                .save_committed(Some(LogId::new(CommittedLeaderId::new(1, 7), 2)))
                .await
                .unwrap();
            insert(&store, &[blank(1), blank(2)]);
        }

        let mut store = LogStore::open(dir.path(), &Span::none()).unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(Vote::new(3, 7)));
        assert_eq!(store.read_committed().await.unwrap().map(|l| l.index), Some(2));
        let entries = store.try_get_log_entries(1..=2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].log_id.index, 2);
    }

    #[tokio::test]
    async fn test_truncate_and_purge() {
        let mut store = LogStore::in_memory(&Span::none()).unwrap();
        insert(&store, &[blank(1), blank(2), blank(3), blank(4)]);

        store.truncate(blank(4).log_id).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));

        store.purge(blank(3).log_id).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|l| l.index), Some(3));
        // Nothing left in the table, the log still ends at the purge point
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));
        assert!(store.try_get_log_entries(0..).await.unwrap().is_empty());
    }
}
