use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Log line kubectl prints once `kubectl proxy` accepts connections.
pub const DEFAULT_READY_PATTERN: &str = "Starting to serve on";

/// How to launch the per-cluster authenticating proxy.
///
/// The supervisor appends `--port`, `--address`, `--kubeconfig`, `--context`
/// and `--server` after `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Case-insensitive substring of a stdout/stderr line signalling readiness
    pub ready_pattern: String,
    pub startup_timeout_secs: u64,
}

impl Default for ProxyCommand {
    fn default() -> Self {
        Self {
            program: resolve_kubectl(),
            args: vec!["proxy".to_string()],
            ready_pattern: DEFAULT_READY_PATTERN.to_string(),
            startup_timeout_secs: 10,
        }
    }
}

impl ProxyCommand {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Time bounds per call class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Ordinary API requests through the proxy
    pub request_secs: u64,
    /// Long-lived `?watch=true` requests
    pub watch_secs: u64,
    /// Connection status probes
    pub probe_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_secs: 30,
            watch_secs: 4 * 60 * 60,
            probe_secs: 5,
        }
    }
}

impl Timeouts {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn watch(&self) -> Duration {
        Duration::from_secs(self.watch_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectConfig {
    /// Files or directories whose kubeconfigs are synced into clusters
    pub sync_paths: Vec<PathBuf>,
    pub proxy: ProxyCommand,
    /// Where per-cluster proxy credentials are written while a proxy runs
    pub credentials_dir: PathBuf,
    pub timeouts: Timeouts,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            sync_paths: default_sync_paths(),
            proxy: ProxyCommand::default(),
            credentials_dir: default_credentials_dir(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ConnectConfig {
    /// Reads a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        log::info!("config: loaded {}", path.display());
        Ok(config)
    }

    /// Defaults with `CLUSTER_CONNECT_PROXY_BIN` applied on top.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(bin) = std::env::var_os("CLUSTER_CONNECT_PROXY_BIN") {
            config.proxy.program = PathBuf::from(bin);
        }
        config
    }
}

/// Resolves the kubeconfig locations to sync.
/// Respects KUBECONFIG (`:` on Unix, `;` on Windows), then falls back to the
/// whole ~/.kube directory so dropping a file there is enough to pick it up.
pub fn default_sync_paths() -> Vec<PathBuf> {
    let sep = if cfg!(windows) { ';' } else { ':' };

    let from_env: Vec<PathBuf> = std::env::var("KUBECONFIG")
        .ok()
        .map(|v| {
            v.split(sep)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default();

    if !from_env.is_empty() {
        log::info!("config: KUBECONFIG lists {} path(s)", from_env.len());
        return from_env;
    }

    match dirs::home_dir() {
        Some(home) => vec![home.join(".kube")],
        None => {
            log::warn!("config: cannot determine home directory");
            Vec::new()
        }
    }
}

fn default_credentials_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cluster-connect")
        .join("proxy-credentials")
}

fn resolve_kubectl() -> PathBuf {
    which::which("kubectl").unwrap_or_else(|_| PathBuf::from("kubectl"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("connect.json");
        std::fs::write(
            &path,
            r#"{ "syncPaths": ["/tmp/kube"], "timeouts": { "probeSecs": 2 } }"#,
        )
        .expect("write");

        let config = ConnectConfig::load(&path).expect("load");
        assert_eq!(config.sync_paths, vec![PathBuf::from("/tmp/kube")]);
        assert_eq!(config.timeouts.probe(), Duration::from_secs(2));
        assert_eq!(config.timeouts.request(), Duration::from_secs(30));
        assert_eq!(config.timeouts.watch(), Duration::from_secs(4 * 60 * 60));
        assert_eq!(config.proxy.ready_pattern, DEFAULT_READY_PATTERN);
        assert_eq!(config.proxy.args, vec!["proxy".to_string()]);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = ConnectConfig::load(Path::new("/definitely/not/here.json")).expect_err("missing");
        assert!(matches!(err, crate::error::Error::Io(_)));
    }
}
