//! Remote store client.
//!
//! [`RemoteStore`] is the thin query/upsert/delete boundary to the
//! authoritative backend. [`MemoryRemoteStore`] is an in-memory authoritative
//! store with deterministic id assignment and fault injection, used by tests
//! and local demos.

use crate::{
    clock::Clock, error::Result, record::BusinessKey, Error, RecordId, RemoteRow, TableName,
    Timestamp,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a remote store implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("unauthorized")]
    Unauthorized,

    /// A referenced row (typically a parent) does not exist remotely.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The payload violates a remote constraint.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Attach record context and map into the engine taxonomy.
    pub fn for_record(self, table: &str, id: &str) -> Error {
        match self {
            RemoteError::Network(msg) => Error::Transient(msg),
            RemoteError::Unauthorized => Error::Auth(format!("rejected while syncing {}", table)),
            RemoteError::Conflict(reason) => Error::Conflict {
                table: table.to_string(),
                id: id.to_string(),
                reason,
            },
            RemoteError::Rejected(reason) => {
                Error::validation(table, id, format!("rejected by remote: {}", reason))
            }
        }
    }
}

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// How a remote row is addressed for upsert and lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteKey {
    /// By remote primary key
    Id(RecordId),
    /// By natural key; upserts find-or-create and the store assigns the id
    Business(BusinessKey),
}

/// Client for the authoritative remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether an authenticated session exists.
    async fn has_session(&self) -> RemoteResult<bool>;

    /// Insert or update, returning the authoritative row including any assigned id.
    async fn upsert_by_key(
        &self,
        table: &str,
        key: &RemoteKey,
        payload: &Value,
    ) -> RemoteResult<RemoteRow>;

    /// Find a row by key.
    async fn find_by_key(&self, table: &str, key: &RemoteKey) -> RemoteResult<Option<RemoteRow>>;

    /// Rows with `last_modified >= since`, ascending by modification time, at most `limit`.
    async fn list_changed_since(
        &self,
        table: &str,
        since: Timestamp,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>>;

    /// Every row id currently in the table.
    async fn list_all_ids(&self, table: &str) -> RemoteResult<Vec<RecordId>>;

    /// Delete a row. Deleting a missing row is not an error.
    async fn delete_by_id(&self, table: &str, id: &str) -> RemoteResult<()>;
}

#[derive(Debug, Clone, Default)]
struct CallCounts {
    upserts: usize,
    finds: usize,
    lists: usize,
    deletes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<TableName, BTreeMap<RecordId, RemoteRow>>,
    next_id: u64,
    last_stamp: Timestamp,
    authenticated: bool,
    failures: HashMap<TableName, u32>,
    empty_listing: HashSet<TableName>,
    /// table -> (field, parent table)
    foreign_keys: HashMap<TableName, Vec<(String, TableName)>>,
    /// table -> business key fields, declared or learned from business-key upserts
    unique_keys: HashMap<TableName, Vec<String>>,
    calls: CallCounts,
}

impl Inner {
    fn stamp(&mut self, now: Timestamp) -> Timestamp {
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    fn take_failure(&mut self, table: &str) -> RemoteResult<()> {
        if let Some(remaining) = self.failures.get_mut(table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Network(format!(
                    "injected failure for {}",
                    table
                )));
            }
        }
        Ok(())
    }

    fn check_foreign_keys(&self, table: &str, payload: &Value) -> RemoteResult<()> {
        let Some(keys) = self.foreign_keys.get(table) else {
            return Ok(());
        };
        for (field, parent) in keys {
            let Some(Value::String(parent_id)) = payload.get(field) else {
                continue;
            };
            let exists = self
                .tables
                .get(parent)
                .map(|rows| rows.contains_key(parent_id))
                .unwrap_or(false);
            if !exists {
                return Err(RemoteError::Conflict(format!(
                    "{}.{} references missing {} row {}",
                    table, field, parent, parent_id
                )));
            }
        }
        Ok(())
    }

    /// Reject a payload whose business key already belongs to a row other than `id`.
    fn check_unique_key(&self, table: &str, id: &str, payload: &Value) -> RemoteResult<()> {
        let Some(fields) = self.unique_keys.get(table) else {
            return Ok(());
        };
        let mut key = BusinessKey::new();
        for field in fields {
            match payload.get(field) {
                Some(value) if !value.is_null() => {
                    key.insert(field.clone(), value.clone());
                }
                _ => return Ok(()),
            }
        }
        let taken = self.tables.get(table).and_then(|rows| {
            rows.values()
                .find(|row| row.id != id && key.iter().all(|(f, v)| row.payload.get(f) == Some(v)))
        });
        match taken {
            Some(row) => Err(RemoteError::Rejected(format!(
                "{} business key {:?} already belongs to {}",
                table, key, row.id
            ))),
            None => Ok(()),
        }
    }

    fn find(&self, table: &str, key: &RemoteKey) -> Option<RemoteRow> {
        let rows = self.tables.get(table)?;
        match key {
            RemoteKey::Id(id) => rows.get(id).cloned(),
            RemoteKey::Business(key) => rows
                .values()
                .find(|row| key.iter().all(|(f, v)| row.payload.get(f) == Some(v)))
                .cloned(),
        }
    }
}

/// In-memory authoritative store.
///
/// Assigned ids are `"{prefix}{n}"` with `n` counting up from a configurable
/// start. Modification stamps are strictly increasing even when the clock
/// stands still, like a database sequence.
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    id_prefix: String,
    latency: Mutex<Option<Duration>>,
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("id_prefix", &self.id_prefix)
            .field("row_count", &self.row_count())
            .finish()
    }
}

impl MemoryRemoteStore {
    /// Create an empty, authenticated store assigning ids `R-1`, `R-2`, ...
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                authenticated: true,
                ..Inner::default()
            }),
            clock,
            id_prefix: "R-".to_string(),
            latency: Mutex::new(None),
        }
    }

    /// Start id assignment at `next`.
    pub fn with_next_id(self, next: u64) -> Self {
        self.inner.lock().next_id = next;
        self
    }

    /// Use a different prefix for assigned ids.
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Reject upserts into `table` whose `field` names a row missing from `parent`.
    pub fn with_foreign_key(
        self,
        table: impl Into<TableName>,
        field: impl Into<String>,
        parent: impl Into<TableName>,
    ) -> Self {
        self.inner
            .lock()
            .foreign_keys
            .entry(table.into())
            .or_default()
            .push((field.into(), parent.into()));
        self
    }

    /// Keep `fields` unique across the rows of `table`.
    ///
    /// Business-key upserts declare their table's key on first use; this
    /// declares it up front for tables only ever written by id.
    pub fn with_unique_key<I, S>(self, table: impl Into<TableName>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .lock()
            .unique_keys
            .insert(table.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    /// Toggle the authenticated session.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.inner.lock().authenticated = authenticated;
    }

    /// Fail the next `count` calls touching `table` with a network error.
    pub fn fail_next(&self, table: &str, count: u32) {
        self.inner.lock().failures.insert(table.to_string(), count);
    }

    /// Make `list_all_ids` report no rows for `table` regardless of content.
    pub fn force_empty_listing(&self, table: &str, enabled: bool) {
        let mut inner = self.inner.lock();
        if enabled {
            inner.empty_listing.insert(table.to_string());
        } else {
            inner.empty_listing.remove(table);
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Write a row directly, as another device would.
    pub fn insert_row(&self, table: &str, id: &str, payload: Value) -> RemoteRow {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let row = RemoteRow {
            id: id.to_string(),
            table: table.to_string(),
            payload,
            last_modified: inner.stamp(now),
        };
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), row.clone());
        row
    }

    /// Remove a row directly, as another device would.
    pub fn remove_row(&self, table: &str, id: &str) -> bool {
        self.inner
            .lock()
            .tables
            .get_mut(table)
            .map(|rows| rows.remove(id).is_some())
            .unwrap_or(false)
    }

    /// Get a row by id.
    pub fn row(&self, table: &str, id: &str) -> Option<RemoteRow> {
        self.inner.lock().find(table, &RemoteKey::Id(id.to_string()))
    }

    /// All rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<RemoteRow> {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total rows across all tables.
    pub fn row_count(&self) -> usize {
        self.inner.lock().tables.values().map(|t| t.len()).sum()
    }

    /// Number of `upsert_by_key` calls so far.
    pub fn upsert_calls(&self) -> usize {
        self.inner.lock().calls.upserts
    }

    /// Number of `find_by_key` calls so far.
    pub fn find_calls(&self) -> usize {
        self.inner.lock().calls.finds
    }

    /// Number of listing calls so far.
    pub fn list_calls(&self) -> usize {
        self.inner.lock().calls.lists
    }

    /// Number of `delete_by_id` calls so far.
    pub fn delete_calls(&self) -> usize {
        self.inner.lock().calls.deletes
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn authorize(inner: &Inner) -> RemoteResult<()> {
        if inner.authenticated {
            Ok(())
        } else {
            Err(RemoteError::Unauthorized)
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn has_session(&self) -> RemoteResult<bool> {
        self.delay().await;
        Ok(self.inner.lock().authenticated)
    }

    async fn upsert_by_key(
        &self,
        table: &str,
        key: &RemoteKey,
        payload: &Value,
    ) -> RemoteResult<RemoteRow> {
        self.delay().await;
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Self::authorize(&inner)?;
        inner.calls.upserts += 1;
        inner.take_failure(table)?;
        inner.check_foreign_keys(table, payload)?;
        if let RemoteKey::Business(fields) = key {
            inner
                .unique_keys
                .entry(table.to_string())
                .or_insert_with(|| fields.keys().cloned().collect());
        }

        let existing = inner.find(table, key).map(|row| row.id);
        let (id, assigned) = match (existing, key) {
            (Some(id), _) => (id, false),
            (None, RemoteKey::Id(id)) => (id.clone(), false),
            (None, RemoteKey::Business(_)) => (format!("{}{}", self.id_prefix, inner.next_id), true),
        };
        inner.check_unique_key(table, &id, payload)?;
        if assigned {
            inner.next_id += 1;
        }

        let row = RemoteRow {
            id: id.clone(),
            table: table.to_string(),
            payload: payload.clone(),
            last_modified: inner.stamp(now),
        };
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, row.clone());

        Ok(row)
    }

    async fn find_by_key(&self, table: &str, key: &RemoteKey) -> RemoteResult<Option<RemoteRow>> {
        self.delay().await;
        let mut inner = self.inner.lock();
        Self::authorize(&inner)?;
        inner.calls.finds += 1;
        inner.take_failure(table)?;
        Ok(inner.find(table, key))
    }

    async fn list_changed_since(
        &self,
        table: &str,
        since: Timestamp,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>> {
        self.delay().await;
        let mut inner = self.inner.lock();
        Self::authorize(&inner)?;
        inner.calls.lists += 1;
        inner.take_failure(table)?;

        let mut rows: Vec<RemoteRow> = inner
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.last_modified >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.id.cmp(&b.id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_all_ids(&self, table: &str) -> RemoteResult<Vec<RecordId>> {
        self.delay().await;
        let mut inner = self.inner.lock();
        Self::authorize(&inner)?;
        inner.calls.lists += 1;
        inner.take_failure(table)?;

        if inner.empty_listing.contains(table) {
            return Ok(Vec::new());
        }
        Ok(inner
            .tables
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_by_id(&self, table: &str, id: &str) -> RemoteResult<()> {
        self.delay().await;
        let mut inner = self.inner.lock();
        Self::authorize(&inner)?;
        inner.calls.deletes += 1;
        inner.take_failure(table)?;

        if let Some(rows) = inner.tables.get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }
}

/// Check that a remote session exists, mapping failures to [`Error::Auth`].
pub async fn require_session<R: RemoteStore + ?Sized>(remote: &R) -> Result<()> {
    match remote.has_session().await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::Auth("no active session".into())),
        Err(e) => Err(Error::Auth(e.to_string())),
    }
}
