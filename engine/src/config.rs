//! Configuration for sync cycles.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default financial tolerance, in currency units.
pub const DEFAULT_EPSILON: f64 = 0.05;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Run `sync_all` on a timer.
    pub auto_sync: bool,
    /// Interval between automatic cycles.
    pub sync_interval_ms: u64,
    /// Extra attempts for a retryable remote call within one cycle.
    pub max_retries: u32,
    /// Initial backoff between attempts, doubled each retry.
    pub retry_delay_ms: u64,
    /// Maximum rows per pull page.
    pub batch_size: usize,
    /// Tolerance between a derived total and the sum of its parts.
    pub epsilon: f64,
    /// Timeout applied to each remote call.
    pub remote_timeout_ms: u64,
    /// Cursor history entries older than this are pruned.
    pub cursor_retention_ms: u64,
    /// Prune cursor history every N completed cycles.
    pub prune_every_cycles: u32,
    /// A prior sync this recent, combined with empty key tables, means local storage was wiped.
    pub wipe_detection_window_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: false,
            sync_interval_ms: 5 * 60 * 1000,
            max_retries: 3,
            retry_delay_ms: 250,
            batch_size: 500,
            epsilon: DEFAULT_EPSILON,
            remote_timeout_ms: 30_000,
            cursor_retention_ms: 30 * DAY_MS,
            prune_every_cycles: 10,
            wipe_detection_window_ms: 7 * DAY_MS,
        }
    }
}

impl SyncConfig {
    /// Enables or disables the auto-sync loop.
    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
        self
    }

    /// Sets the auto-sync interval.
    pub fn with_sync_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sync_interval_ms = interval_ms;
        self
    }

    /// Sets the retry count for retryable remote failures.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial retry delay.
    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Sets the pull page size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the financial tolerance.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Sets the per-call remote timeout.
    pub fn with_remote_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.remote_timeout_ms = timeout_ms;
        self
    }

    /// Sets the cursor history retention window.
    pub fn with_cursor_retention_ms(mut self, retention_ms: u64) -> Self {
        self.cursor_retention_ms = retention_ms;
        self
    }

    /// Sets how often cursor history is pruned.
    pub fn with_prune_every_cycles(mut self, cycles: u32) -> Self {
        self.prune_every_cycles = cycles;
        self
    }

    /// Sets the wiped-storage detection window.
    pub fn with_wipe_detection_window_ms(mut self, window_ms: u64) -> Self {
        self.wipe_detection_window_ms = window_ms;
        self
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".into()));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "sync interval must be positive".into(),
            ));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "epsilon must be a non-negative number, got {}",
                self.epsilon
            )));
        }
        if self.remote_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "remote timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}
