//! Snapshot types for persisting and restoring the local cache.
//!
//! Snapshots are the bridge between [`MemoryLocalStore`](crate::MemoryLocalStore)
//! and whatever durable storage the host uses. BTreeMaps keep the serialized
//! form deterministic.

use crate::{error::Result, Error, IdMapping, Record, RecordId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Records organized by table, then by primary key
    pub tables: BTreeMap<TableName, BTreeMap<RecordId, Record>>,
    /// Cursor history per sync domain, oldest first
    pub cursors: BTreeMap<String, Vec<Timestamp>>,
    /// Recorded local-to-remote identity mappings
    pub mappings: Vec<IdMapping>,
}

impl Default for LocalSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSnapshot {
    /// Create a new empty snapshot.
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            tables: BTreeMap::new(),
            cursors: BTreeMap::new(),
            mappings: Vec::new(),
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: Record) {
        self.tables
            .entry(record.table.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Get a record from the snapshot.
    pub fn get_record(&self, table: &str, id: &str) -> Option<&Record> {
        self.tables.get(table)?.get(id)
    }

    /// Count total records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Count records still waiting to be pushed.
    pub fn dirty_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(|t| t.values())
            .filter(|r| r.dirty)
            .count()
    }

    /// Check internal consistency: every record is filed under its own table and key.
    pub fn validate(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        for (table, records) in &self.tables {
            for (id, record) in records {
                if &record.table != table || &record.id != id {
                    return Err(Error::InvalidSnapshot(format!(
                        "record {}/{} filed under {}/{}",
                        record.table, record.id, table, id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub table_count: usize,
    pub record_count: usize,
    pub dirty_count: usize,
}

impl From<&LocalSnapshot> for SnapshotMetadata {
    fn from(snapshot: &LocalSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            table_count: snapshot.tables.len(),
            record_count: snapshot.record_count(),
            dirty_count: snapshot.dirty_count(),
        }
    }
}
