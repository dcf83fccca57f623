//! Keeps clusters in line with the kubeconfig files on disk.

pub mod diff;
pub mod watch;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::manager::ClusterManager;
use crate::models::catalog::CatalogEntity;

pub use diff::{DiffPlan, DiffSummary, SourceMap, TrackedContext};
pub use watch::{scan_kube_dir, SyncEvent, WatchHandle};

const SYNC_EVENT_CAPACITY: usize = 64;

/// One file watch per sync path; paths can be added and removed at runtime.
pub struct KubeconfigSyncManager {
    manager: Arc<ClusterManager>,
    watches: Mutex<BTreeMap<PathBuf, WatchHandle>>,
    events: broadcast::Sender<SyncEvent>,
}

impl KubeconfigSyncManager {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        let (events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        Self {
            manager,
            watches: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Starts a watch for every path. A path that cannot be watched is logged
    /// and skipped.
    pub fn start_sync(&self, paths: &[PathBuf]) {
        log::info!("sync: starting {} sync path(s)", paths.len());
        for path in paths {
            if let Err(e) = self.start_new_sync(path) {
                log::warn!("sync: cannot watch {}: {e}", path.display());
            }
        }
    }

    /// Watches one more path. Already watched paths are left alone.
    pub fn start_new_sync(&self, path: &Path) -> Result<()> {
        let mut watches = self.watches.lock();
        if watches.contains_key(path) {
            log::debug!("sync: {} already watched", path.display());
            return Ok(());
        }
        let handle = watch::watch(
            path.to_path_buf(),
            Arc::clone(&self.manager),
            self.events.clone(),
        )?;
        watches.insert(path.to_path_buf(), handle);
        Ok(())
    }

    /// Stops watching `path` and drops the clusters it contributed. Returns
    /// whether it was watched.
    pub async fn stop_old_sync(&self, path: &Path) -> bool {
        let handle = self.watches.lock().remove(path);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_sync(&self) {
        let handles: Vec<WatchHandle> = std::mem::take(&mut *self.watches.lock())
            .into_values()
            .collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watches.lock().keys().cloned().collect()
    }

    /// Entities of every synced context, across all paths.
    pub fn entities(&self) -> Vec<CatalogEntity> {
        self.watches
            .lock()
            .values()
            .flat_map(|w| w.entities())
            .collect()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}
