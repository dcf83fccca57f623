use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ClusterId = String;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusPreferences {
    pub namespace: String,
    pub service: String,
    pub port: u16,
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusProvider {
    #[serde(rename = "type")]
    pub kind: String,
}

/// User or source supplied settings attached to a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPreferences {
    /// Display name; falls back to the context name
    pub cluster_name: Option<String>,
    /// Upstream proxy handed to the auth proxy process as HTTPS_PROXY
    pub https_proxy: Option<String>,
    pub default_namespace: Option<String>,
    pub prometheus: Option<PrometheusPreferences>,
    pub prometheus_provider: Option<PrometheusProvider>,
}

/// Immutable description of one cluster connection.
///
/// `(kube_config_path, context_name)` identifies at most one live cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterModel {
    pub id: ClusterId,
    pub kube_config_path: PathBuf,
    pub context_name: String,
    #[serde(default)]
    pub accessible_namespaces: BTreeSet<String>,
    #[serde(default)]
    pub preferences: Option<ClusterPreferences>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ClusterModel {
    pub fn from_update(id: ClusterId, update: UpdateClusterModel) -> Self {
        Self {
            id,
            kube_config_path: update.kube_config_path,
            context_name: update.context_name,
            accessible_namespaces: BTreeSet::new(),
            preferences: update.preferences,
            labels: update.labels,
        }
    }

    pub fn display_name(&self) -> &str {
        self.preferences
            .as_ref()
            .and_then(|p| p.cluster_name.as_deref())
            .unwrap_or(&self.context_name)
    }
}

/// A model as produced by parsing a kubeconfig, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClusterModel {
    pub kube_config_path: PathBuf,
    pub context_name: String,
    #[serde(default)]
    pub preferences: Option<ClusterPreferences>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time copy of a cluster handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub model: ClusterModel,
    pub status: ClusterStatus,
    pub online: bool,
    pub accessible: bool,
    pub last_error: Option<String>,
    pub proxy_port: Option<u16>,
    pub kube_version: Option<String>,
    pub distro: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ClusterSnapshot {
    pub fn id(&self) -> &str {
        &self.model.id
    }

    pub fn disconnected(&self) -> bool {
        self.status == ClusterStatus::Disconnected
    }
}
