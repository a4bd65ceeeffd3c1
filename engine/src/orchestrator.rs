//! Sync cycle orchestration.
//!
//! [`SyncOrchestrator`] is the entry point the application talks to. It owns
//! the single-flight guard, sequences push before pull, records cycle
//! cursors, and drives the optional auto-sync timer.

use crate::{
    clock::{Clock, SystemClock},
    config::SyncConfig,
    corrector::ConsistencyCorrector,
    descriptor::Registry,
    error::Result,
    pull::{PullPipeline, LAST_CYCLE_CURSOR},
    push::PushPipeline,
    remote::{require_session, RemoteStore},
    result::{PushReport, SyncResult, SyncStatus},
    store::LocalStore,
    tracker::DirtyTracker,
    Error,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Which phases a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Full,
    PushOnly,
    PullOnly { full_resync: bool },
}

/// Holds the syncing flag for the duration of a cycle. Dropping it (on
/// return or unwind) clears the flag.
struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct AutoSync {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    syncing: AtomicBool,
    cycles: AtomicU64,
    last_result: Mutex<Option<SyncResult>>,
    auto: Mutex<Option<AutoSync>>,
}

/// Coordinates push and pull between a local cache and a remote store.
///
/// Cloning is cheap; clones share the same stores and single-flight guard.
pub struct SyncOrchestrator<L: LocalStore + 'static, R: RemoteStore + 'static> {
    local: Arc<L>,
    remote: Arc<R>,
    registry: Arc<Registry>,
    corrector: Arc<ConsistencyCorrector>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    state: Arc<State>,
}

impl<L: LocalStore + 'static, R: RemoteStore + 'static> Clone for SyncOrchestrator<L, R> {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            remote: Arc::clone(&self.remote),
            registry: Arc::clone(&self.registry),
            corrector: Arc::clone(&self.corrector),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
        }
    }
}

/// The auto-sync task's view of an orchestrator. It does not keep the shared
/// state alive, so the loop ends once every [`SyncOrchestrator`] is dropped.
struct WeakOrchestrator<L: LocalStore + 'static, R: RemoteStore + 'static> {
    local: Arc<L>,
    remote: Arc<R>,
    registry: Arc<Registry>,
    corrector: Arc<ConsistencyCorrector>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    state: Weak<State>,
}

impl<L: LocalStore + 'static, R: RemoteStore + 'static> WeakOrchestrator<L, R> {
    fn upgrade(&self) -> Option<SyncOrchestrator<L, R>> {
        Some(SyncOrchestrator {
            local: Arc::clone(&self.local),
            remote: Arc::clone(&self.remote),
            registry: Arc::clone(&self.registry),
            corrector: Arc::clone(&self.corrector),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            state: self.state.upgrade()?,
        })
    }
}

impl<L: LocalStore + 'static, R: RemoteStore + 'static> SyncOrchestrator<L, R> {
    /// Create an orchestrator with no consistency invariants and the system clock.
    pub fn new(local: Arc<L>, remote: Arc<R>, registry: Registry, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let corrector = ConsistencyCorrector::new(config.epsilon);
        Ok(Self {
            local,
            remote,
            registry: Arc::new(registry),
            corrector: Arc::new(corrector),
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            state: Arc::new(State::default()),
        })
    }

    /// Use these invariants. The tolerance always comes from the config.
    pub fn with_corrector(mut self, corrector: ConsistencyCorrector) -> Self {
        self.corrector = Arc::new(corrector.with_epsilon(self.config.epsilon));
        self
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn downgrade(&self) -> WeakOrchestrator<L, R> {
        WeakOrchestrator {
            local: Arc::clone(&self.local),
            remote: Arc::clone(&self.remote),
            registry: Arc::clone(&self.registry),
            corrector: Arc::clone(&self.corrector),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.state.syncing.load(Ordering::Acquire)
    }

    /// Push all dirty records, then pull all tables.
    ///
    /// Returns immediately with an `AlreadySyncing` error result when another
    /// cycle holds the guard.
    pub async fn sync_all(&self) -> SyncResult {
        self.guarded(Cycle::Full).await
    }

    /// Push only.
    pub async fn force_push(&self) -> SyncResult {
        self.guarded(Cycle::PushOnly).await
    }

    /// Pull only. `full_resync` resets every table cursor to the epoch first.
    pub async fn force_pull(&self, full_resync: bool) -> SyncResult {
        self.guarded(Cycle::PullOnly { full_resync }).await
    }

    pub fn get_status(&self) -> SyncStatus {
        SyncStatus {
            is_syncing: self.is_syncing(),
            auto_sync_enabled: self.state.auto.lock().is_some(),
            interval_ms: self.config.sync_interval_ms,
            last_result: self.state.last_result.lock().clone(),
        }
    }

    /// The result of the most recent completed cycle.
    pub fn last_result(&self) -> Option<SyncResult> {
        self.state.last_result.lock().clone()
    }

    async fn guarded(&self, cycle: Cycle) -> SyncResult {
        let Some(_guard) = SyncGuard::acquire(&self.state.syncing) else {
            debug!(?cycle, "Sync requested while a cycle is running");
            return SyncResult::aborted(&Error::AlreadySyncing, self.clock.now());
        };

        let result = self.run(cycle).await;
        *self.state.last_result.lock() = Some(result.clone());
        result
    }

    async fn run(&self, cycle: Cycle) -> SyncResult {
        let local = self.local.as_ref();
        let remote = self.remote.as_ref();

        if let Err(e) = require_session(remote).await {
            error!(error = %e, "Sync aborted");
            return SyncResult::aborted(&e, self.clock.now());
        }

        if let Ok(pending) = DirtyTracker::new(local, &self.registry).scan().await {
            debug!(?cycle, pending = pending.total(), "Starting sync cycle");
        }

        let mut result = SyncResult::default();
        if let Err(e) = self.run_phases(cycle, &mut result).await {
            if e.is_fatal() {
                error!(error = %e, "Sync aborted");
            } else {
                warn!(error = %e, "Sync cycle stopped early");
            }
            result.errors.push(e.to_string());
        }

        let result = result.finish(self.clock.now());
        info!(
            ?cycle,
            success = result.success,
            synced = result.synced_count,
            errors = result.errors.len(),
            "Sync cycle finished"
        );
        result
    }

    async fn run_phases(&self, cycle: Cycle, result: &mut SyncResult) -> Result<()> {
        let local = self.local.as_ref();
        let remote = self.remote.as_ref();
        let clock = self.clock.as_ref();

        if matches!(cycle, Cycle::Full | Cycle::PushOnly) {
            let mut report = PushReport::default();
            let push =
                PushPipeline::new(local, remote, &self.registry, &self.corrector, &self.config, clock);
            let pushed = push.run_into(&mut report).await;
            // Records made clean before an early exit still count.
            report.merge_into(result);
            pushed?;
        }

        if matches!(cycle, Cycle::Full | Cycle::PullOnly { .. }) {
            let pull = PullPipeline::new(local, remote, &self.registry, &self.config, clock);
            if let Cycle::PullOnly { full_resync: true } = cycle {
                info!("Full resync requested; resetting pull cursors");
                pull.reset_cursors().await?;
            }
            pull.run().await?.merge_into(result);
        }

        if cycle == Cycle::Full {
            local.set_cursor(LAST_CYCLE_CURSOR, clock.now()).await?;
            self.maybe_prune().await?;
        }
        Ok(())
    }

    async fn maybe_prune(&self) -> Result<()> {
        let cycles = self.state.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        let every = u64::from(self.config.prune_every_cycles);
        if every == 0 || cycles % every != 0 {
            return Ok(());
        }
        let before = self.clock.now().saturating_sub(self.config.cursor_retention_ms);
        let pruned = self.local.prune_cursor_history(before).await?;
        debug!(pruned, "Pruned cursor history");
        Ok(())
    }

    /// Start running `sync_all` every configured interval. Returns false if
    /// the loop is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_auto_sync(&self) -> bool {
        let mut auto = self.state.auto.lock();
        if auto.is_some() {
            return false;
        }

        // Dropping the last orchestrator drops `stop`, which ends the loop.
        let (stop, mut stopped) = watch::channel(false);
        let handle = self.downgrade();
        let period = self.config.sync_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; wait a full period instead.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(this) = handle.upgrade() else {
                            break;
                        };
                        let result = this.sync_all().await;
                        debug!(success = result.success, "Automatic sync finished");
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Auto-sync loop stopped");
        });

        *auto = Some(AutoSync { stop, task });
        info!(interval_ms = self.config.sync_interval_ms, "Auto-sync started");
        true
    }

    /// Stop the auto-sync loop, waiting for an in-flight cycle to finish.
    /// Returns false if no loop was running.
    pub async fn stop_auto_sync(&self) -> bool {
        let auto = self.state.auto.lock().take();
        let Some(auto) = auto else {
            return false;
        };
        let _ = auto.stop.send(true);
        if let Err(e) = auto.task.await {
            warn!(error = %e, "Auto-sync task ended abnormally");
        }
        info!("Auto-sync stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        pull::cursor_domain,
        remote::{RemoteKey, RemoteResult},
        EntityDescriptor, MemoryLocalStore, MemoryRemoteStore, Record, RecordId, RemoteRow,
        Timestamp,
    };
    use serde_json::json;
    use std::time::Duration;

    type Orchestrator = SyncOrchestrator<MemoryLocalStore, MemoryRemoteStore>;

    /// Loses its session after a fixed number of successful upserts.
    struct ExpiringSession {
        inner: MemoryRemoteStore,
        upserts_left: AtomicU64,
    }

    #[async_trait::async_trait]
    impl RemoteStore for ExpiringSession {
        async fn has_session(&self) -> RemoteResult<bool> {
            self.inner.has_session().await
        }

        async fn upsert_by_key(
            &self,
            table: &str,
            key: &RemoteKey,
            payload: &serde_json::Value,
        ) -> RemoteResult<RemoteRow> {
            let row = self.inner.upsert_by_key(table, key, payload).await?;
            if self.upserts_left.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.inner.set_authenticated(false);
            }
            Ok(row)
        }

        async fn find_by_key(&self, table: &str, key: &RemoteKey) -> RemoteResult<Option<RemoteRow>> {
            self.inner.find_by_key(table, key).await
        }

        async fn list_changed_since(
            &self,
            table: &str,
            since: Timestamp,
            limit: usize,
        ) -> RemoteResult<Vec<RemoteRow>> {
            self.inner.list_changed_since(table, since, limit).await
        }

        async fn list_all_ids(&self, table: &str) -> RemoteResult<Vec<RecordId>> {
            self.inner.list_all_ids(table).await
        }

        async fn delete_by_id(&self, table: &str, id: &str) -> RemoteResult<()> {
            self.inner.delete_by_id(table, id).await
        }
    }

    fn orchestrator(config: SyncConfig) -> (Orchestrator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let registry = Registry::new(vec![EntityDescriptor::local_authoritative("contracts").key_table()]).unwrap();
        let orchestrator = SyncOrchestrator::new(
            Arc::new(MemoryLocalStore::new()),
            Arc::new(MemoryRemoteStore::new(clock.clone())),
            registry,
            config,
        )
        .unwrap()
        .with_clock(clock.clone());
        (orchestrator, clock)
    }

    #[test]
    fn guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = SyncGuard::acquire(&flag).unwrap();
        assert!(SyncGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(SyncGuard::acquire(&flag).is_some());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = SyncOrchestrator::new(
            Arc::new(MemoryLocalStore::new()),
            Arc::new(MemoryRemoteStore::new(Arc::new(ManualClock::new(0)))),
            Registry::new(vec![]).unwrap(),
            SyncConfig::default().with_batch_size(0),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn sync_all_records_last_cycle() {
        let (orchestrator, _) = orchestrator(SyncConfig::default());
        orchestrator
            .local()
            .put(Record::new_local("C-1", "contracts", json!({}), 1))
            .await
            .unwrap();

        let result = orchestrator.sync_all().await;

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.pushed, 1);
        assert_eq!(orchestrator.local().get_cursor(LAST_CYCLE_CURSOR).await.unwrap(), 10_000);
        assert_eq!(orchestrator.last_result(), Some(result));
        assert!(!orchestrator.is_syncing());
    }

    #[tokio::test]
    async fn no_session_touches_nothing() {
        let (orchestrator, _) = orchestrator(SyncConfig::default());
        orchestrator
            .local()
            .put(Record::new_local("C-1", "contracts", json!({}), 1))
            .await
            .unwrap();
        orchestrator.remote().set_authenticated(false);

        let result = orchestrator.sync_all().await;

        assert!(!result.success);
        assert_eq!(result.synced_count, 0);
        assert!(result.errors[0].contains("session"));
        assert_eq!(orchestrator.remote().upsert_calls(), 0);
        assert!(orchestrator.local().get("contracts", "C-1").await.unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn force_push_does_not_pull() {
        let (orchestrator, _) = orchestrator(SyncConfig::default());
        orchestrator.remote().insert_row("contracts", "C-9", json!({}));

        let result = orchestrator.force_push().await;

        assert!(result.success);
        assert_eq!(orchestrator.remote().list_calls(), 0);
        assert!(orchestrator.local().get("contracts", "C-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_pull_full_resets_cursor() {
        let (orchestrator, _) = orchestrator(SyncConfig::default());
        orchestrator.remote().insert_row("contracts", "C-1", json!({}));
        let latest = orchestrator.remote().insert_row("contracts", "C-2", json!({}));
        assert_eq!(orchestrator.force_pull(false).await.pulled, 2);

        // Lost locally without a tombstone; the incremental cursor is already past it.
        orchestrator.local().delete("contracts", "C-1").await.unwrap();
        let incremental = orchestrator.force_pull(false).await;
        assert_eq!(incremental.pulled, 0);
        assert!(orchestrator.local().get("contracts", "C-1").await.unwrap().is_none());

        let full = orchestrator.force_pull(true).await;
        assert!(full.success);
        assert_eq!(full.pulled, 1);
        assert!(orchestrator.local().get("contracts", "C-1").await.unwrap().is_some());
        assert_eq!(
            orchestrator
                .local()
                .get_cursor(&cursor_domain("contracts"))
                .await
                .unwrap(),
            latest.last_modified
        );
    }

    #[tokio::test]
    async fn prunes_cursor_history_periodically() {
        let (orchestrator, clock) = orchestrator(
            SyncConfig::default()
                .with_prune_every_cycles(2)
                .with_cursor_retention_ms(1_000),
        );

        orchestrator.sync_all().await;
        clock.advance(5_000);
        orchestrator.sync_all().await;

        let snapshot = orchestrator.local().export_snapshot();
        assert_eq!(snapshot.cursors[LAST_CYCLE_CURSOR], vec![15_000]);
    }

    #[tokio::test]
    async fn status_reflects_auto_sync() {
        let (orchestrator, _) = orchestrator(SyncConfig::default().with_sync_interval_ms(60_000));
        let status = orchestrator.get_status();
        assert!(!status.auto_sync_enabled);
        assert_eq!(status.interval_ms, 60_000);
        assert!(status.last_result.is_none());

        assert!(orchestrator.start_auto_sync());
        assert!(!orchestrator.start_auto_sync());
        assert!(orchestrator.get_status().auto_sync_enabled);

        assert!(orchestrator.stop_auto_sync().await);
        assert!(!orchestrator.stop_auto_sync().await);
        assert!(!orchestrator.get_status().auto_sync_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_sync_runs_on_interval() {
        let (orchestrator, _) = orchestrator(SyncConfig::default().with_sync_interval_ms(1_000));
        orchestrator.start_auto_sync();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        orchestrator.stop_auto_sync().await;

        // Two ticks in 2.5s; each cycle lists contracts twice (page and reconciliation).
        assert_eq!(orchestrator.remote().list_calls(), 4);
        assert!(orchestrator.last_result().is_some_and(|r| r.success));
    }

    #[tokio::test]
    async fn session_lost_mid_push_keeps_pushed_count() {
        let clock = Arc::new(ManualClock::new(10_000));
        let remote = Arc::new(ExpiringSession {
            inner: MemoryRemoteStore::new(clock.clone()),
            upserts_left: AtomicU64::new(1),
        });
        let registry = Registry::new(vec![EntityDescriptor::local_authoritative("contracts").key_table()]).unwrap();
        let orchestrator = SyncOrchestrator::new(
            Arc::new(MemoryLocalStore::new()),
            remote.clone(),
            registry,
            SyncConfig::default(),
        )
        .unwrap()
        .with_clock(clock);
        for id in ["C-1", "C-2"] {
            orchestrator
                .local()
                .put(Record::new_local(id, "contracts", json!({}), 1))
                .await
                .unwrap();
        }

        let result = orchestrator.sync_all().await;

        assert!(!result.success);
        assert_eq!(result.pushed, 1);
        assert_eq!(result.synced_count, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(remote.inner.rows("contracts").len(), 1);
        assert_eq!(orchestrator.local().dirty_count("contracts").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_orchestrator_ends_auto_sync() {
        let (orchestrator, _) = orchestrator(SyncConfig::default().with_sync_interval_ms(1_000));
        let remote = orchestrator.remote().clone();
        orchestrator.start_auto_sync();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(remote.list_calls(), 2);

        drop(orchestrator);
        tokio::time::sleep(Duration::from_millis(5_000)).await;

        assert_eq!(remote.list_calls(), 2);
        // The loop has exited and released its store handles.
        assert_eq!(Arc::strong_count(&remote), 1);
    }
}
