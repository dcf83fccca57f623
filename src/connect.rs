use std::sync::Arc;

use crate::catalog::CatalogRegistry;
use crate::cluster::{ClusterProbe, HttpProbe};
use crate::config::ConnectConfig;
use crate::error::Result;
use crate::manager::ClusterManager;
use crate::sync::KubeconfigSyncManager;

/// Everything the connectivity core owns, built once at startup and passed
/// around by reference.
pub struct ClusterConnect {
    config: ConnectConfig,
    catalog: Arc<CatalogRegistry>,
    manager: Arc<ClusterManager>,
    sync: KubeconfigSyncManager,
}

impl ClusterConnect {
    /// Builds the services with the HTTP probe and starts syncing the
    /// configured paths. Must run inside a tokio runtime.
    pub fn start(config: ConnectConfig) -> Result<Self> {
        let probe = HttpProbe::new()?;
        Ok(Self::start_with_probe(config, Arc::new(probe)))
    }

    pub fn start_with_probe(config: ConnectConfig, probe: Arc<dyn ClusterProbe>) -> Self {
        let catalog = Arc::new(CatalogRegistry::new());
        let manager = ClusterManager::start(&config, Arc::clone(&catalog), probe);
        let sync = KubeconfigSyncManager::new(Arc::clone(&manager));
        sync.start_sync(&config.sync_paths);

        log::info!(
            "connect: started with {} sync path(s), proxy {}",
            config.sync_paths.len(),
            config.proxy.program.display()
        );
        Self {
            config,
            catalog,
            manager,
            sync,
        }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<CatalogRegistry> {
        &self.catalog
    }

    pub fn manager(&self) -> &Arc<ClusterManager> {
        &self.manager
    }

    pub fn sync(&self) -> &KubeconfigSyncManager {
        &self.sync
    }

    /// Stops every watch, then disconnects every remaining cluster.
    pub async fn shutdown(&self) {
        self.sync.stop_sync().await;
        self.manager.stop();
        log::info!("connect: shut down");
    }
}
