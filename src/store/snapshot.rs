//! Point-in-time copy of the replicated mapping
//!
//! Wire format: one JSON object mapping key to value.

use crate::common::{Error, Result};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Immutable snapshot of the mapping.
///
/// Built by copying the map under the store lock; nothing can mutate it
/// afterwards, so serialization can run without holding any lock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    entries: HashMap<String, String>,
}

impl Snapshot {
    pub(crate) fn from_map(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize as a single JSON document.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    /// Write the JSON document to `writer` and flush it.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_json()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Decode a snapshot payload.
    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        let entries: HashMap<String, String> = serde_json::from_reader(reader)
            .map_err(|e| Error::Snapshot(format!("invalid snapshot payload: {}", e)))?;
        Ok(Self { entries })
    }

    pub(crate) fn into_map(self) -> HashMap<String, String> {
        self.entries
    }
}
