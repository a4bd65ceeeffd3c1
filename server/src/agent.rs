//! The sync agent: the engine over a snapshot-backed local cache.

use crate::error::{AppError, Result};
use crate::persist::SnapshotFile;
use paysync_engine::{
    domain, MemoryLocalStore, RemoteStore, SyncConfig, SyncOrchestrator, SyncResult, Timestamp,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Upper bound on how long a finished automatic cycle waits to be saved.
const MAX_PERSIST_LAG: Duration = Duration::from_secs(1);

/// Engine, local cache and snapshot file.
///
/// Every cycle started through the agent is followed by a snapshot write,
/// so a restart resumes with the same dirty set, cursors and mappings.
pub struct Agent<R: RemoteStore + 'static> {
    orchestrator: SyncOrchestrator<MemoryLocalStore, R>,
    snapshots: SnapshotFile,
    persister: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RemoteStore + 'static> Agent<R> {
    /// Restore the local cache from `snapshots` (if present) and wire the
    /// contract document registry over `remote`.
    pub async fn open(remote: Arc<R>, snapshots: SnapshotFile, sync: SyncConfig) -> Result<Self> {
        let local = match snapshots.load().await? {
            Some(snapshot) => {
                info!(
                    path = %snapshots.path().display(),
                    records = snapshot.record_count(),
                    dirty = snapshot.dirty_count(),
                    "Restored local cache"
                );
                MemoryLocalStore::from_snapshot(snapshot)?
            }
            None => {
                info!(path = %snapshots.path().display(), "Starting with an empty local cache");
                MemoryLocalStore::new()
            }
        };

        let corrector = domain::contract_corrector(sync.epsilon);
        let orchestrator =
            SyncOrchestrator::new(Arc::new(local), remote, domain::contract_registry()?, sync)?
                .with_corrector(corrector);

        Ok(Self {
            orchestrator,
            snapshots,
            persister: Mutex::new(None),
        })
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator<MemoryLocalStore, R> {
        &self.orchestrator
    }

    /// Full cycle, then save.
    pub async fn sync_all(&self) -> Result<SyncResult> {
        let result = self.orchestrator.sync_all().await;
        self.persist().await?;
        Ok(result)
    }

    /// Push phase only, then save.
    pub async fn force_push(&self) -> Result<SyncResult> {
        let result = self.orchestrator.force_push().await;
        self.persist().await?;
        Ok(result)
    }

    /// Pull phase only, then save.
    pub async fn force_pull(&self, full_resync: bool) -> Result<SyncResult> {
        let result = self.orchestrator.force_pull(full_resync).await;
        self.persist().await?;
        Ok(result)
    }

    /// Write the current local cache to the snapshot file.
    pub async fn persist(&self) -> Result<()> {
        save(&self.orchestrator, &self.snapshots).await
    }

    /// Start the engine's auto-sync loop plus a follower that saves the
    /// cache after each automatic cycle. Returns false if already running.
    pub async fn start_auto_sync(&self) -> bool {
        if !self.orchestrator.start_auto_sync() {
            return false;
        }

        let orchestrator = self.orchestrator.clone();
        let snapshots = self.snapshots.clone();
        let poll = self.orchestrator.config().sync_interval().min(MAX_PERSIST_LAG);
        let task = tokio::spawn(async move {
            let mut saved: Option<Timestamp> = orchestrator.last_result().map(|r| r.completed_at);
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                let latest = orchestrator.last_result().map(|r| r.completed_at);
                if latest == saved {
                    continue;
                }
                match save(&orchestrator, &snapshots).await {
                    Ok(()) => saved = latest,
                    Err(e) => warn!(error = %e, "Saving after automatic sync failed"),
                }
            }
        });

        *self.persister.lock().await = Some(task);
        true
    }

    /// Stop background syncing and save one final time.
    pub async fn shutdown(&self) -> Result<()> {
        self.orchestrator.stop_auto_sync().await;

        if let Some(task) = self.persister.lock().await.take() {
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    return Err(AppError::Internal(format!("snapshot follower panicked: {}", e)));
                }
            }
        }

        self.persist().await
    }
}

impl<R: RemoteStore + 'static> Drop for Agent<R> {
    fn drop(&mut self) {
        // The follower holds an orchestrator handle; without it the engine's
        // auto-sync loop winds down on its own.
        if let Some(task) = self.persister.get_mut().take() {
            task.abort();
        }
    }
}

async fn save<R: RemoteStore + 'static>(
    orchestrator: &SyncOrchestrator<MemoryLocalStore, R>,
    snapshots: &SnapshotFile,
) -> Result<()> {
    snapshots
        .save_with(|| orchestrator.local().export_snapshot())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use paysync_engine::{
        domain::PAYMENT_REQUESTS, LocalStore, MemoryRemoteStore, Record, SystemClock,
    };
    use serde_json::json;

    fn scratch_file() -> SnapshotFile {
        let dir = std::env::temp_dir().join(format!("paysync-agent-{}", uuid::Uuid::new_v4()));
        SnapshotFile::new(dir.join("cache.json"))
    }

    fn cleanup(file: &SnapshotFile) {
        if let Some(dir) = file.path().parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    fn remote() -> Arc<MemoryRemoteStore> {
        Arc::new(MemoryRemoteStore::new(Arc::new(SystemClock)))
    }

    async fn seed(agent: &Agent<MemoryRemoteStore>) {
        let local = agent.orchestrator().local();
        local
            .put(Record::new_local(
                "C-1",
                "contracts",
                json!({"code": "C-1", "name": "North bridge"}),
                1,
            ))
            .await
            .unwrap();
        local
            .put(Record::new_local(
                "tmp-1",
                PAYMENT_REQUESTS,
                json!({"contractId": "C-1", "number": 1, "subtotal": 100.0, "tax": 16.0, "total": 116.0}),
                1,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dirty_state_survives_restart() {
        let file = scratch_file();
        let remote = remote();
        remote.set_authenticated(false);

        let agent = Agent::open(remote.clone(), file.clone(), SyncConfig::default())
            .await
            .unwrap();
        seed(&agent).await;

        let result = agent.sync_all().await.unwrap();
        assert!(!result.success);

        let reopened = Agent::open(remote.clone(), file.clone(), SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(
            reopened
                .orchestrator()
                .local()
                .dirty_count(PAYMENT_REQUESTS)
                .await
                .unwrap(),
            1
        );

        remote.set_authenticated(true);
        let result = reopened.sync_all().await.unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.pushed, 2);

        let snapshot = file.load().await.unwrap().unwrap();
        assert_eq!(snapshot.dirty_count(), 0);
        assert!(snapshot.get_record(PAYMENT_REQUESTS, "R-1").is_some());

        cleanup(&file);
    }

    #[tokio::test]
    async fn overlapping_saves_do_not_fail() {
        let file = scratch_file();
        let agent = Agent::open(remote(), file.clone(), SyncConfig::default())
            .await
            .unwrap();
        seed(&agent).await;

        for _ in 0..10 {
            let (a, b, c) = tokio::join!(agent.persist(), agent.force_push(), agent.persist());
            a.unwrap();
            b.unwrap();
            c.unwrap();
        }

        let snapshot = file.load().await.unwrap().unwrap();
        assert_eq!(snapshot.record_count(), 2);
        assert_eq!(snapshot.dirty_count(), 0);

        cleanup(&file);
    }

    #[tokio::test]
    async fn auto_sync_results_are_saved() {
        let file = scratch_file();
        let config = SyncConfig::default().with_sync_interval_ms(20);
        let agent = Agent::open(remote(), file.clone(), config).await.unwrap();
        seed(&agent).await;

        assert!(agent.start_auto_sync().await);
        assert!(!agent.start_auto_sync().await);

        let mut saved_clean = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(Some(snapshot)) = file.load().await {
                if snapshot.record_count() == 2 && snapshot.dirty_count() == 0 {
                    saved_clean = true;
                    break;
                }
            }
        }
        assert!(saved_clean);

        agent.shutdown().await.unwrap();
        assert!(!agent.orchestrator().get_status().auto_sync_enabled);

        cleanup(&file);
    }
}
