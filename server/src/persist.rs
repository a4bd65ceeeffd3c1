//! Local cache persistence as a JSON snapshot file.

use crate::error::Result;
use paysync_engine::LocalSnapshot;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// A snapshot file written atomically through a sibling temp file.
///
/// Clones share one write lock, so saves never interleave on the temp file.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Read the snapshot, or `None` when no file exists yet.
    pub async fn load(&self) -> Result<Option<LocalSnapshot>> {
        let json = match fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(LocalSnapshot::from_json(&json)?))
    }

    /// Write the snapshot, replacing the previous file in one rename.
    pub async fn save(&self, snapshot: &LocalSnapshot) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.write(snapshot).await
    }

    /// Take the write lock, then build the snapshot and save it. A save
    /// queued behind another one exports state at least as new as it.
    pub async fn save_with<F>(&self, export: F) -> Result<()>
    where
        F: FnOnce() -> LocalSnapshot,
    {
        let _write = self.write_lock.lock().await;
        self.write(&export()).await
    }

    async fn write(&self, snapshot: &LocalSnapshot) -> Result<()> {
        let json = snapshot.to_json_pretty()?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let temp = self.temp_path();
        fs::write(&temp, json.as_bytes()).await?;
        fs::rename(&temp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            records = snapshot.record_count(),
            dirty = snapshot.dirty_count(),
            "Saved local snapshot"
        );
        Ok(())
    }
}
