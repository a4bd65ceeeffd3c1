//! Pull: incremental fetch, merge, and guarded reconciliation.
//!
//! Each table has its own cursor domain (`pull:<table>`). Rows are fetched
//! with `last_modified >= cursor` in ascending pages, so the cursor can be
//! advanced after every page without skipping rows that share a timestamp.
//! A full page that cannot move the cursor is fetched again with a larger
//! limit. Re-fetched rows that match local state are not counted.

use crate::{
    clock::Clock,
    config::SyncConfig,
    descriptor::{EntityDescriptor, Registry},
    error::Result,
    remote::RemoteStore,
    result::PullReport,
    retry::remote_call,
    store::LocalStore,
    Record, RecordId, RemoteRow, Timestamp,
};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Cursor domain recorded at the end of every completed `sync_all`.
pub const LAST_CYCLE_CURSOR: &str = "sync:last_cycle";

/// Cursor domain for a table's incremental pull.
pub fn cursor_domain(table: &str) -> String {
    format!("pull:{}", table)
}

/// One pull pass over every declared table.
pub struct PullPipeline<'a, L: LocalStore + ?Sized, R: RemoteStore + ?Sized> {
    local: &'a L,
    remote: &'a R,
    registry: &'a Registry,
    config: &'a SyncConfig,
    clock: &'a dyn Clock,
}

impl<'a, L: LocalStore + ?Sized, R: RemoteStore + ?Sized> PullPipeline<'a, L, R> {
    pub fn new(
        local: &'a L,
        remote: &'a R,
        registry: &'a Registry,
        config: &'a SyncConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            local,
            remote,
            registry,
            config,
            clock,
        }
    }

    /// Pull every table, then reconcile deletions.
    pub async fn run(&self) -> Result<PullReport> {
        let mut report = PullReport::default();
        if self.detect_wipe().await? {
            warn!("Local key tables are empty after a recent sync; forcing a full re-pull");
            self.reset_cursors().await?;
            report.wipe_detected = true;
        }

        for descriptor in self.registry.dependency_order() {
            if self.pull_table(descriptor, &mut report).await? {
                self.reconcile_table(descriptor, &mut report).await?;
            }
        }

        info!(
            pulled = report.pulled,
            unchanged = report.unchanged,
            reconciled = report.reconciled_deletes,
            errors = report.errors.len(),
            "Pull complete"
        );
        Ok(report)
    }

    /// Reset every table cursor to the epoch.
    pub async fn reset_cursors(&self) -> Result<()> {
        for descriptor in self.registry.descriptors() {
            self.local.set_cursor(&cursor_domain(&descriptor.table), 0).await?;
        }
        Ok(())
    }

    /// A recent prior cycle combined with empty key tables means the local
    /// cache was lost, so incremental cursors can no longer be trusted.
    pub async fn detect_wipe(&self) -> Result<bool> {
        let last_cycle = self.local.get_cursor(LAST_CYCLE_CURSOR).await?;
        if last_cycle == 0 {
            return Ok(false);
        }
        let now = self.clock.now();
        if now.saturating_sub(last_cycle) > self.config.wipe_detection_window_ms {
            return Ok(false);
        }

        let mut key_tables = 0;
        for descriptor in self.registry.key_tables() {
            key_tables += 1;
            if self.local.count(&descriptor.table).await? > 0 {
                return Ok(false);
            }
        }
        Ok(key_tables > 0)
    }

    /// Page through changed rows of one table. Returns whether paging
    /// completed, which gates reconciliation.
    pub async fn pull_table(
        &self,
        descriptor: &EntityDescriptor,
        report: &mut PullReport,
    ) -> Result<bool> {
        let table = descriptor.table.as_str();
        let domain = cursor_domain(table);
        let batch = self.config.batch_size;
        let mut limit = batch;
        let mut cursor = self.local.get_cursor(&domain).await?;

        loop {
            let page = match remote_call(self.config, table, "*", || {
                self.remote.list_changed_since(table, cursor, limit)
            })
            .await
            {
                Ok(page) => page,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(table, error = %e, "Pull failed");
                    report.errors.push(format!("pull {}: {}", table, e));
                    return Ok(false);
                }
            };
            debug!(table, cursor, rows = page.len(), "Fetched page");

            let mut watermark = cursor;
            for row in &page {
                match self.apply_row(descriptor, row).await {
                    Ok(true) => report.pulled += 1,
                    Ok(false) => report.unchanged += 1,
                    Err(e) => {
                        // Keep the cursor at the last applied row so this one is fetched again.
                        warn!(table, id = %row.id, "Applying pulled row failed: {}", e);
                        report.errors.push(format!("pull {}/{}: {}", table, row.id, e));
                        self.advance(&domain, cursor, watermark).await?;
                        return Ok(false);
                    }
                }
                watermark = watermark.max(row.last_modified);
            }
            self.advance(&domain, cursor, watermark).await?;

            if page.len() < limit {
                return Ok(true);
            }
            if watermark == cursor {
                // Every row on the page shares the cursor's stamp. Widen the
                // page until it reaches past that stamp or runs out of rows.
                limit = limit.saturating_mul(2);
                debug!(table, cursor, limit, "Page did not advance; widening");
                continue;
            }
            cursor = watermark;
            limit = batch;
        }
    }

    async fn advance(&self, domain: &str, from: Timestamp, to: Timestamp) -> Result<()> {
        if to > from {
            self.local.set_cursor(domain, to).await?;
        }
        Ok(())
    }

    /// Merge one remote row. Returns whether local state changed.
    async fn apply_row(&self, descriptor: &EntityDescriptor, row: &RemoteRow) -> Result<bool> {
        let existing = self.find_local(descriptor, &row.id).await?;

        if let Some(local) = &existing {
            if local.dirty && row.last_modified <= local.last_modified {
                debug!(
                    table = %descriptor.table,
                    id = %local.id,
                    "Keeping newer local edit over pulled row"
                );
                return Ok(false);
            }
            if !local.dirty
                && !local.deleted
                && local.payload == row.payload
                && local.last_modified == row.last_modified
                && local.remote_id.as_deref() == Some(row.id.as_str())
            {
                return Ok(false);
            }
        }

        let mut record = Record::from_remote(row, self.clock.now());
        if let Some(local) = existing {
            // Tables that keep their working key are matched through `remote_id`.
            record.id = local.id;
        }
        self.local.put(record).await?;
        Ok(true)
    }

    async fn find_local(&self, descriptor: &EntityDescriptor, remote_id: &str) -> Result<Option<Record>> {
        if let Some(record) = self.local.get(&descriptor.table, remote_id).await? {
            return Ok(Some(record));
        }
        if descriptor.rekey_on_assign {
            return Ok(None);
        }
        Ok(self
            .local
            .list(&descriptor.table)
            .await?
            .into_iter()
            .find(|r| r.remote_id.as_deref() == Some(remote_id)))
    }

    /// Delete local rows whose remote counterparts are gone.
    ///
    /// Dirty rows are never deleted. An empty remote listing while dirty rows
    /// exist skips the table entirely, since a transient empty response must
    /// not wipe the local dataset.
    pub async fn reconcile_table(
        &self,
        descriptor: &EntityDescriptor,
        report: &mut PullReport,
    ) -> Result<()> {
        let table = descriptor.table.as_str();
        let listing = match remote_call(self.config, table, "*", || self.remote.list_all_ids(table)).await {
            Ok(ids) => ids,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(table, "Reconciliation listing failed: {}", e);
                report.errors.push(format!("reconcile {}: {}", table, e));
                return Ok(());
            }
        };

        if listing.is_empty() {
            let dirty = self.local.dirty_count(table).await?;
            if dirty > 0 {
                warn!(table, dirty, "Remote listing is empty while local edits are pending; skipping reconciliation");
                report.skipped_reconciliations += 1;
                return Ok(());
            }
        }

        let remote_ids: HashSet<RecordId> = listing.into_iter().collect();
        let doomed: Vec<RecordId> = self
            .local
            .list(table)
            .await?
            .into_iter()
            .filter(|r| !r.dirty)
            .filter(|r| {
                descriptor
                    .remote_identity(r)
                    .is_some_and(|id| !remote_ids.contains(id))
            })
            .map(|r| r.id)
            .collect();

        if doomed.is_empty() {
            return Ok(());
        }
        let deleted = self.local.bulk_delete(table, &doomed).await?;
        info!(table, deleted, "Removed rows deleted remotely");
        report.reconciled_deletes += deleted;
        Ok(())
    }
}
