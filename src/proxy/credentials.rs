use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::kubeconfig;

const KUBECONFIG_FILE: &str = "kubeconfig";

/// Per-cluster kubeconfig handed to the proxy process. Holds only the one
/// context it serves and lives only while that proxy runs.
#[derive(Debug)]
pub struct ProxyCredentials {
    dir: PathBuf,
    kubeconfig: PathBuf,
    server_url: String,
}

impl ProxyCredentials {
    /// Extracts `context_name` from the kubeconfig at `source` and writes it to
    /// `<base_dir>/<cluster_id>/kubeconfig`, readable by the owner only.
    pub async fn prepare(
        base_dir: &Path,
        cluster_id: &str,
        source: &Path,
        context_name: &str,
    ) -> Result<Self> {
        let raw = tokio::fs::read_to_string(source).await?;
        let config = kubeconfig::load_config_from_str(&raw)?;
        let minimal = kubeconfig::extract_context(&config, context_name, source.parent())?;

        let server_url = minimal
            .clusters
            .first()
            .and_then(|c| c.cluster.as_ref())
            .and_then(|c| c.server.clone())
            .ok_or_else(|| Error::InvalidContext {
                context: context_name.to_string(),
                reason: "cluster has no server url".to_string(),
            })?;

        let yaml = serde_yaml::to_string(&minimal)?;

        let dir = base_dir.join(cluster_id);
        tokio::fs::create_dir_all(&dir).await?;
        let kubeconfig = dir.join(KUBECONFIG_FILE);

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&kubeconfig).await?;
        file.write_all(yaml.as_bytes()).await?;
        file.flush().await?;

        log::debug!(
            "proxy: wrote credentials for context \"{context_name}\" at {}",
            kubeconfig.display()
        );

        Ok(Self {
            dir,
            kubeconfig,
            server_url,
        })
    }

    pub fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("proxy: failed to remove credentials {}: {e}", self.dir.display());
            }
        }
    }
}
