use thiserror::Error;

use crate::models::cluster::ClusterId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid context \"{context}\": {reason}")]
    InvalidContext { context: String, reason: String },

    #[error("context \"{context}\" of {path} is already tracked by cluster {existing}")]
    DuplicateContext {
        path: String,
        context: String,
        existing: ClusterId,
    },

    #[error("cluster {0} not found")]
    ClusterNotFound(ClusterId),

    #[error("proxy failed to start: {0}")]
    ProxyStartup(String),

    #[error("proxy is not running")]
    ProxyNotRunning,

    #[error("proxy was stopped while starting")]
    ProxyStopped,
}
