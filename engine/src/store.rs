//! Local cache adapter.
//!
//! [`LocalStore`] is the transactional local cache the pipelines read and
//! write one record at a time. [`MemoryLocalStore`] is the in-memory
//! implementation, persisted by the host through [`LocalSnapshot`].

use crate::{
    error::Result, snapshot::LocalSnapshot, Error, IdMapping, Record, RecordId, TableName,
    Timestamp,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Transactional local cache with per-record dirty tracking.
///
/// Every method is a single short transaction; implementations must not
/// hold locks across calls.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get a record by table and primary key, including tombstones.
    async fn get(&self, table: &str, id: &str) -> Result<Option<Record>>;

    /// All dirty records of a table, read through the dirty index.
    async fn get_dirty(&self, table: &str) -> Result<Vec<Record>>;

    /// Number of dirty records in a table.
    async fn dirty_count(&self, table: &str) -> Result<usize>;

    /// All records of a table, including tombstones.
    async fn list(&self, table: &str) -> Result<Vec<Record>>;

    /// Records whose payload field equals `value`.
    async fn find_by_field(&self, table: &str, field: &str, value: &Value)
        -> Result<Vec<Record>>;

    /// Insert or replace a record by primary key.
    async fn put(&self, record: Record) -> Result<()>;

    /// Atomically remove `old_id` and insert `record` under its own key.
    async fn replace(&self, old_id: &str, record: Record) -> Result<()>;

    /// Hard-delete a record.
    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Hard-delete several records. Returns how many existed.
    async fn bulk_delete(&self, table: &str, ids: &[RecordId]) -> Result<usize>;

    /// Number of active (non-tombstoned) records.
    async fn count(&self, table: &str) -> Result<usize>;

    /// Latest cursor value for a domain, 0 when never set.
    async fn get_cursor(&self, domain: &str) -> Result<Timestamp>;

    /// Append a cursor value to the domain's history.
    async fn set_cursor(&self, domain: &str, value: Timestamp) -> Result<()>;

    /// Drop history entries older than `before`, keeping each domain's latest.
    async fn prune_cursor_history(&self, before: Timestamp) -> Result<usize>;

    /// Remember that `local_id` is now known remotely as `remote_id`.
    async fn record_mapping(&self, mapping: IdMapping) -> Result<()>;

    /// Look up the remote id a local id was mapped to.
    async fn resolve_mapping(&self, table: &str, local_id: &str) -> Result<Option<RecordId>>;
}

/// Records of one table plus the dirty index.
#[derive(Debug, Clone, Default)]
struct Table {
    records: HashMap<RecordId, Record>,
    dirty: BTreeSet<RecordId>,
}

impl Table {
    fn insert(&mut self, record: Record) {
        if record.dirty {
            self.dirty.insert(record.id.clone());
        } else {
            self.dirty.remove(&record.id);
        }
        self.records.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &str) -> Option<Record> {
        self.dirty.remove(id);
        self.records.remove(id)
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<TableName, Table>,
    cursors: BTreeMap<String, Vec<Timestamp>>,
    mappings: BTreeMap<(TableName, RecordId), IdMapping>,
}

/// In-memory local cache.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    inner: RwLock<Inner>,
}

impl MemoryLocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a store from a snapshot.
    pub fn from_snapshot(snapshot: LocalSnapshot) -> Result<Self> {
        let store = Self::new();
        store.import_snapshot(snapshot)?;
        Ok(store)
    }

    /// Export the current state as a snapshot.
    pub fn export_snapshot(&self) -> LocalSnapshot {
        let inner = self.inner.read();
        let mut snapshot = LocalSnapshot::new();

        for table in inner.tables.values() {
            for record in table.records.values() {
                snapshot.add_record(record.clone());
            }
        }
        snapshot.cursors = inner.cursors.clone();
        snapshot.mappings = inner.mappings.values().cloned().collect();

        snapshot
    }

    /// Replace the current state with a snapshot's state.
    pub fn import_snapshot(&self, snapshot: LocalSnapshot) -> Result<()> {
        snapshot.validate()?;

        let mut tables: HashMap<TableName, Table> = HashMap::new();
        for (table_name, records) in snapshot.tables {
            let table = tables.entry(table_name).or_default();
            for (_, record) in records {
                table.insert(record);
            }
        }

        let mappings = snapshot
            .mappings
            .into_iter()
            .map(|m| ((m.table.clone(), m.local_id.clone()), m))
            .collect();

        let mut inner = self.inner.write();
        inner.tables = tables;
        inner.cursors = snapshot.cursors;
        inner.mappings = mappings;

        Ok(())
    }

    /// Total records across all tables, including tombstones.
    pub fn record_count(&self) -> usize {
        self.inner
            .read()
            .tables
            .values()
            .map(|t| t.records.len())
            .sum()
    }

    /// Drop every record, cursor, and mapping.
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }

    /// Drop every record but keep cursors and mappings, as when the record
    /// tables of a local database are lost independently.
    pub fn clear_records(&self) {
        self.inner.write().tables.clear();
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<Record>> {
        Ok(self
            .inner
            .read()
            .tables
            .get(table)
            .and_then(|t| t.records.get(id))
            .cloned())
    }

    async fn get_dirty(&self, table: &str) -> Result<Vec<Record>> {
        let inner = self.inner.read();
        let Some(table) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };

        Ok(table
            .dirty
            .iter()
            .filter_map(|id| table.records.get(id))
            .cloned()
            .collect())
    }

    async fn dirty_count(&self, table: &str) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .tables
            .get(table)
            .map(|t| t.dirty.len())
            .unwrap_or(0))
    }

    async fn list(&self, table: &str) -> Result<Vec<Record>> {
        Ok(self
            .inner
            .read()
            .tables
            .get(table)
            .map(|t| t.records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_by_field(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        Ok(self
            .inner
            .read()
            .tables
            .get(table)
            .map(|t| {
                t.records
                    .values()
                    .filter(|r| r.payload.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put(&self, record: Record) -> Result<()> {
        self.inner
            .write()
            .tables
            .entry(record.table.clone())
            .or_default()
            .insert(record);
        Ok(())
    }

    async fn replace(&self, old_id: &str, record: Record) -> Result<()> {
        let mut inner = self.inner.write();
        let table = inner.tables.entry(record.table.clone()).or_default();

        if old_id != record.id && table.records.contains_key(&record.id) {
            return Err(Error::Store(format!(
                "cannot move {}/{} to {}: key already taken",
                record.table, old_id, record.id
            )));
        }

        table.remove(old_id);
        table.insert(record);
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        if let Some(t) = self.inner.write().tables.get_mut(table) {
            t.remove(id);
        }
        Ok(())
    }

    async fn bulk_delete(&self, table: &str, ids: &[RecordId]) -> Result<usize> {
        let mut inner = self.inner.write();
        let Some(t) = inner.tables.get_mut(table) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| t.remove(id).is_some()).count())
    }

    async fn count(&self, table: &str) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .tables
            .get(table)
            .map(|t| t.records.values().filter(|r| r.is_active()).count())
            .unwrap_or(0))
    }

    async fn get_cursor(&self, domain: &str) -> Result<Timestamp> {
        Ok(self
            .inner
            .read()
            .cursors
            .get(domain)
            .and_then(|history| history.last().copied())
            .unwrap_or(0))
    }

    async fn set_cursor(&self, domain: &str, value: Timestamp) -> Result<()> {
        self.inner
            .write()
            .cursors
            .entry(domain.to_string())
            .or_default()
            .push(value);
        Ok(())
    }

    async fn prune_cursor_history(&self, before: Timestamp) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut pruned = 0;

        for history in inner.cursors.values_mut() {
            let Some(&latest) = history.last() else {
                continue;
            };
            let len = history.len();
            let mut kept: Vec<Timestamp> = history[..len - 1]
                .iter()
                .copied()
                .filter(|&value| value >= before)
                .collect();
            kept.push(latest);
            pruned += len - kept.len();
            *history = kept;
        }

        Ok(pruned)
    }

    async fn record_mapping(&self, mapping: IdMapping) -> Result<()> {
        self.inner
            .write()
            .mappings
            .insert((mapping.table.clone(), mapping.local_id.clone()), mapping);
        Ok(())
    }

    async fn resolve_mapping(&self, table: &str, local_id: &str) -> Result<Option<RecordId>> {
        Ok(self
            .inner
            .read()
            .mappings
            .get(&(table.to_string(), local_id.to_string()))
            .map(|m| m.remote_id.clone()))
    }
}
