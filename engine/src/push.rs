//! Push: transmit dirty local records to the remote store.
//!
//! Tables are processed in dependency order so a parent is always confirmed
//! (and its assigned identity propagated) before any child referencing it is
//! sent. Records are pushed one at a time; a failing record stays dirty and is
//! retried next cycle without blocking the rest.

use crate::{
    clock::Clock,
    config::SyncConfig,
    corrector::ConsistencyCorrector,
    descriptor::{EntityDescriptor, IdentityMode, Registry},
    error::Result,
    remote::{RemoteKey, RemoteStore},
    result::PushReport,
    retry::remote_call,
    store::LocalStore,
    tracker::DirtyTracker,
    IdMapping, Record, RemoteRow, Timestamp,
};
use serde_json::Value;
use tracing::{debug, info, warn};

/// What happened to one dirty record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pushed {
    Upserted { remapped: usize },
    Deleted,
    /// Gone or already clean by the time it was reached.
    Skipped,
}

/// One push pass over every declared table.
pub struct PushPipeline<'a, L: LocalStore + ?Sized, R: RemoteStore + ?Sized> {
    local: &'a L,
    remote: &'a R,
    registry: &'a Registry,
    corrector: &'a ConsistencyCorrector,
    config: &'a SyncConfig,
    clock: &'a dyn Clock,
}

impl<'a, L: LocalStore + ?Sized, R: RemoteStore + ?Sized> PushPipeline<'a, L, R> {
    pub fn new(
        local: &'a L,
        remote: &'a R,
        registry: &'a Registry,
        corrector: &'a ConsistencyCorrector,
        config: &'a SyncConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            local,
            remote,
            registry,
            corrector,
            config,
            clock,
        }
    }

    /// Push every dirty record.
    ///
    /// Per-record failures are collected in the report. Only fatal errors
    /// (a rejected session) and local storage failures end the pass early.
    pub async fn run(&self) -> Result<PushReport> {
        let mut report = PushReport::default();
        self.run_into(&mut report).await?;
        Ok(report)
    }

    /// Like [`run`](Self::run), but counts into `report` so the work done
    /// before an early exit is still visible to the caller.
    pub async fn run_into(&self, report: &mut PushReport) -> Result<()> {
        for descriptor in self.registry.dependency_order() {
            self.push_table(descriptor, report).await?;
        }

        info!(
            pushed = report.pushed,
            deleted = report.remote_deletes,
            repaired = report.repaired,
            errors = report.errors.len(),
            "Push complete"
        );
        Ok(())
    }

    /// Push the dirty records of one table.
    ///
    /// The dirty set is read when the table is reached, so children re-marked
    /// dirty by a parent's identity change earlier in the pass are included.
    pub async fn push_table(
        &self,
        descriptor: &EntityDescriptor,
        report: &mut PushReport,
    ) -> Result<()> {
        let tracker = DirtyTracker::new(self.local, self.registry);
        let dirty = tracker.scan_table(&descriptor.table).await?;
        if dirty.is_empty() {
            return Ok(());
        }
        debug!(table = %descriptor.table, dirty = dirty.len(), "Pushing table");

        for record in dirty {
            match self.push_record(descriptor, &record.id, report).await {
                Ok(Pushed::Upserted { remapped }) => {
                    report.pushed += 1;
                    report.remapped_dependents += remapped;
                }
                Ok(Pushed::Deleted) => report.remote_deletes += 1,
                Ok(Pushed::Skipped) => report.skipped += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(table = %descriptor.table, id = %record.id, error = %e, "Push failed");
                    report
                        .errors
                        .push(format!("push {}/{}: {}", descriptor.table, record.id, e));
                }
            }
        }
        Ok(())
    }

    async fn push_record(
        &self,
        descriptor: &EntityDescriptor,
        id: &str,
        report: &mut PushReport,
    ) -> Result<Pushed> {
        // Re-read: an earlier record in this pass may have rewritten this one.
        let Some(mut record) = self.local.get(&descriptor.table, id).await? else {
            return Ok(Pushed::Skipped);
        };
        if !record.dirty {
            return Ok(Pushed::Skipped);
        }

        if record.deleted {
            self.push_tombstone(descriptor, &record).await?;
            return Ok(Pushed::Deleted);
        }

        descriptor.validate(&record)?;

        let corrections = self.corrector.correct(&mut record)?;
        if !corrections.is_empty() {
            for c in &corrections {
                warn!(
                    table = %c.table,
                    id = %c.id,
                    field = %c.field,
                    "Repaired derived value ({}): {:?} -> {}",
                    c.invariant,
                    c.stored,
                    c.corrected
                );
            }
            // Persist the repair before transmitting it.
            self.local.put(record.clone()).await?;
            report.repaired += 1;
        }

        let row = self.upsert(descriptor, &record).await?;
        let remapped = self.adopt_identity(descriptor, record, row).await?;
        Ok(Pushed::Upserted { remapped })
    }

    async fn upsert(&self, descriptor: &EntityDescriptor, record: &Record) -> Result<RemoteRow> {
        let table = descriptor.table.as_str();
        let id = record.id.as_str();
        let payload = &record.payload;

        let key = match descriptor.identity_mode {
            IdentityMode::LocalAuthoritative => RemoteKey::Id(record.id.clone()),
            IdentityMode::RemoteAssigned => match &record.remote_id {
                Some(remote_id) => RemoteKey::Id(remote_id.clone()),
                None => {
                    let business = RemoteKey::Business(
                        record.business_key(&descriptor.business_key_fields)?,
                    );
                    let existing = remote_call(self.config, table, id, || {
                        self.remote.find_by_key(table, &business)
                    })
                    .await?;
                    match existing {
                        Some(row) => {
                            debug!(table, id, remote_id = %row.id, "Matched existing remote row");
                            RemoteKey::Id(row.id)
                        }
                        None => business,
                    }
                }
            },
        };

        remote_call(self.config, table, id, || {
            self.remote.upsert_by_key(table, &key, payload)
        })
        .await
    }

    /// Take on the authoritative row, propagating a newly assigned identity.
    /// Returns the number of dependent records re-pointed.
    async fn adopt_identity(
        &self,
        descriptor: &EntityDescriptor,
        mut record: Record,
        row: RemoteRow,
    ) -> Result<usize> {
        let now = self.clock.now();
        let old_id = record.id.clone();
        let newly_assigned = record.remote_id.as_deref() != Some(row.id.as_str()) && row.id != old_id;

        let mut remapped = 0;
        if newly_assigned {
            self.local
                .record_mapping(IdMapping {
                    table: descriptor.table.clone(),
                    local_id: old_id.clone(),
                    remote_id: row.id.clone(),
                    mapped_at: now,
                })
                .await?;
            remapped = self.remap_dependents(descriptor, &old_id, &row.id, now).await?;
            info!(
                table = %descriptor.table,
                id = %old_id,
                remote_id = %row.id,
                remapped,
                "Remote identity assigned"
            );
        }

        record.remote_id = Some(row.id.clone());
        record.payload = row.payload;
        record.last_modified = row.last_modified;
        record.mark_synced(now);

        if newly_assigned && descriptor.rekey_on_assign {
            record.id = row.id;
            // A pulled copy of the same remote row may already sit at the new key.
            if self.local.get(&descriptor.table, &record.id).await?.is_some() {
                self.local.delete(&descriptor.table, &record.id).await?;
            }
            self.local.replace(&old_id, record).await?;
        } else {
            self.local.put(record).await?;
        }

        Ok(remapped)
    }

    /// Re-point every dependent foreign key from `old_id` to `new_id`, marking
    /// each touched record dirty so the change travels with this push.
    async fn remap_dependents(
        &self,
        descriptor: &EntityDescriptor,
        old_id: &str,
        new_id: &str,
        now: Timestamp,
    ) -> Result<usize> {
        let old = Value::String(old_id.to_string());
        let mut remapped = 0;
        for dependent in &descriptor.dependents {
            let children = self
                .local
                .find_by_field(&dependent.table, &dependent.foreign_key_field, &old)
                .await?;
            for mut child in children {
                child.set_field(
                    &dependent.foreign_key_field,
                    Value::String(new_id.to_string()),
                    now,
                );
                self.local.put(child).await?;
                remapped += 1;
            }
        }
        Ok(remapped)
    }

    /// Propagate a local deletion, then drop the tombstone.
    async fn push_tombstone(&self, descriptor: &EntityDescriptor, record: &Record) -> Result<()> {
        let table = descriptor.table.as_str();
        let id = record.id.as_str();

        let mut target = descriptor.remote_identity(record).map(str::to_string);
        if target.is_none() && descriptor.identity_mode == IdentityMode::RemoteAssigned {
            // Never confirmed locally, but an earlier attempt may have reached the remote store.
            if let Ok(key) = record.business_key(&descriptor.business_key_fields) {
                let key = RemoteKey::Business(key);
                target = remote_call(self.config, table, id, || self.remote.find_by_key(table, &key))
                    .await?
                    .map(|row| row.id);
            }
        }

        if let Some(remote_id) = target {
            remote_call(self.config, table, id, || self.remote.delete_by_id(table, &remote_id))
                .await?;
            debug!(table, remote_id = %remote_id, "Deleted remotely");
        }
        self.local.delete(table, id).await
    }
}
