//! Snapshot persistence for the engine
//!
//! Layout of [`FileSnapshotStore`]:
//!
//! ```text
//! <dir>/snapshots/<term>-<index>-<millis>/meta.json
//! <dir>/snapshots/<term>-<index>-<millis>/state.json
//! ```
//!
//! A snapshot is written into a `.tmp` directory and renamed on close, so
//! a crash mid-write never leaves a half snapshot visible.

use crate::common::{Error, Result};
use crate::raft::engine::{SnapshotMeta, SnapshotSink};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SNAPSHOT_DIR: &str = "snapshots";
const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.json";
const TMP_SUFFIX: &str = ".tmp";

pub trait SnapshotStore: Send + Sync {
    /// Start a new snapshot; it becomes visible when the sink is closed.
    fn create(&self, meta: SnapshotMeta) -> Result<Box<dyn SnapshotSink>>;

    /// All complete snapshots, newest first.
    fn list(&self) -> Result<Vec<SnapshotMeta>>;

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)>;

    fn latest(&self) -> Result<Option<SnapshotMeta>> {
        Ok(self.list()?.into_iter().next())
    }
}

pub fn snapshot_id(term: u64, index: u64) -> String {
    format!(
        "{}-{}-{}",
        term,
        index,
        chrono::Utc::now().timestamp_millis()
    )
}

fn newest_first(metas: &mut [SnapshotMeta]) {
    metas.sort_by(|a, b| (b.index, b.term, &b.id).cmp(&(a.index, a.term, &a.id)));
}

/// Snapshots on disk, keeping the newest `retain` of them.
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    pub fn open(base: impl AsRef<Path>, retain: usize) -> Result<Self> {
        if retain == 0 {
            return Err(Error::InvalidConfig("must retain at least one snapshot".into()));
        }
        let dir = base.as_ref().join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir)?;

        // Leftovers from a crash during persist
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                fs::remove_dir_all(&path)?;
            }
        }

        Ok(Self { dir, retain })
    }

    fn read_meta(path: &Path) -> Result<SnapshotMeta> {
        let file = File::open(path.join(META_FILE))?;
        serde_json::from_reader(file)
            .map_err(|e| Error::Snapshot(format!("bad snapshot meta in {}: {}", path.display(), e)))
    }

    fn reap(&self) -> Result<()> {
        for stale in self.list()?.into_iter().skip(self.retain) {
            fs::remove_dir_all(self.dir.join(&stale.id))?;
        }
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn create(&self, meta: SnapshotMeta) -> Result<Box<dyn SnapshotSink>> {
        let final_dir = self.dir.join(&meta.id);
        let tmp_dir = self.dir.join(format!("{}{}", meta.id, TMP_SUFFIX));
        fs::create_dir_all(&tmp_dir)?;
        let file = File::create(tmp_dir.join(STATE_FILE))?;

        Ok(Box::new(FileSnapshotSink {
            meta,
            writer: Some(BufWriter::new(file)),
            tmp_dir,
            final_dir,
            written: 0,
            store_dir: self.dir.clone(),
            retain: self.retain,
        }))
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() || path.to_string_lossy().ends_with(TMP_SUFFIX) {
                continue;
            }
            match Self::read_meta(&path) {
                Ok(meta) => metas.push(meta),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping snapshot"),
            }
        }
        newest_first(&mut metas);
        Ok(metas)
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let path = self.dir.join(id);
        let meta = Self::read_meta(&path)?;
        let file = File::open(path.join(STATE_FILE))?;
        Ok((meta, Box::new(file)))
    }
}

struct FileSnapshotSink {
    meta: SnapshotMeta,
    writer: Option<BufWriter<File>>,
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    written: u64,
    store_dir: PathBuf,
    retain: usize,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "sink already finished"))?;
        let n = writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn cancel(&mut self) -> Result<()> {
        self.writer = None;
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Snapshot(format!("sink {} already finished", self.meta.id)))?;
        let file = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;

        self.meta.size = self.written;
        let meta_file = File::create(self.tmp_dir.join(META_FILE))?;
        serde_json::to_writer(&meta_file, &self.meta)?;
        meta_file.sync_all()?;

        fs::rename(&self.tmp_dir, &self.final_dir)?;

        let store = FileSnapshotStore {
            dir: self.store_dir.clone(),
            retain: self.retain,
        };
        store.reap()
    }
}

/// Snapshots kept in memory, for `inmem` nodes and tests.
#[derive(Clone)]
pub struct MemorySnapshotStore {
    snapshots: Arc<Mutex<Vec<(SnapshotMeta, Vec<u8>)>>>,
    retain: usize,
}

impl MemorySnapshotStore {
    pub fn new(retain: usize) -> Self {
        Self {
            snapshots: Arc::new(Mutex::new(Vec::new())),
            retain: retain.max(1),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn create(&self, meta: SnapshotMeta) -> Result<Box<dyn SnapshotSink>> {
        Ok(Box::new(MemorySnapshotSink {
            meta,
            buf: Vec::new(),
            done: false,
            store: self.clone(),
        }))
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let mut metas: Vec<_> = self
            .snapshots
            .lock()
            .iter()
            .map(|(meta, _)| meta.clone())
            .collect();
        newest_first(&mut metas);
        Ok(metas)
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let snapshots = self.snapshots.lock();
        let (meta, data) = snapshots
            .iter()
            .find(|(meta, _)| meta.id == id)
            .ok_or_else(|| Error::Snapshot(format!("snapshot {} not found", id)))?;
        Ok((meta.clone(), Box::new(std::io::Cursor::new(data.clone()))))
    }
}

struct MemorySnapshotSink {
    meta: SnapshotMeta,
    buf: Vec<u8>,
    done: bool,
    store: MemorySnapshotStore,
}

impl Write for MemorySnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.done {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "sink already finished"));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn cancel(&mut self) -> Result<()> {
        self.done = true;
        self.buf.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.done {
            return Err(Error::Snapshot(format!("sink {} already finished", self.meta.id)));
        }
        self.done = true;
        self.meta.size = self.buf.len() as u64;

        let mut snapshots = self.store.snapshots.lock();
        snapshots.push((self.meta.clone(), std::mem::take(&mut self.buf)));
        snapshots.sort_by(|(a, _), (b, _)| (b.index, b.term, &b.id).cmp(&(a.index, a.term, &a.id)));
        snapshots.truncate(self.store.retain);
        Ok(())
    }
}
