//! Summaries handed back to the calling application.

use crate::{Error, Timestamp};
use serde::{Deserialize, Serialize};

/// Outcome of a sync entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// No errors were recorded
    pub success: bool,
    /// Records pushed plus rows pulled
    pub synced_count: usize,
    /// Human-readable error strings, one per failure
    pub errors: Vec<String>,
    pub completed_at: Timestamp,
    /// Records upserted or deleted remotely
    pub pushed: usize,
    /// Rows that changed local state during pull
    pub pulled: usize,
    /// Local rows removed by reconciliation
    pub reconciled_deletes: usize,
    /// Records whose derived fields were repaired before push
    pub repaired: usize,
}

impl SyncResult {
    /// A result for a cycle that never started.
    pub fn aborted(error: &Error, completed_at: Timestamp) -> Self {
        Self {
            success: false,
            errors: vec![error.to_string()],
            completed_at,
            ..Self::default()
        }
    }

    /// Finalize counts and the success flag.
    pub(crate) fn finish(mut self, completed_at: Timestamp) -> Self {
        self.synced_count = self.pushed + self.pulled;
        self.success = self.errors.is_empty();
        self.completed_at = completed_at;
        self
    }
}

/// Counters and errors from one push pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub remote_deletes: usize,
    pub repaired: usize,
    pub remapped_dependents: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl PushReport {
    pub(crate) fn merge_into(self, result: &mut SyncResult) {
        result.pushed += self.pushed + self.remote_deletes;
        result.repaired += self.repaired;
        result.errors.extend(self.errors);
    }
}

/// Counters and errors from one pull pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pulled: usize,
    pub unchanged: usize,
    pub reconciled_deletes: usize,
    pub skipped_reconciliations: usize,
    pub wipe_detected: bool,
    pub errors: Vec<String>,
}

impl PullReport {
    pub(crate) fn merge_into(self, result: &mut SyncResult) {
        result.pulled += self.pulled;
        result.reconciled_deletes += self.reconciled_deletes;
        result.errors.extend(self.errors);
    }
}

/// Orchestrator state as seen by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub auto_sync_enabled: bool,
    pub interval_ms: u64,
    pub last_result: Option<SyncResult>,
}
