use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cluster::{ClusterSnapshot, PrometheusPreferences};

pub const KUBERNETES_CLUSTER_KIND: &str = "KubernetesCluster";
pub const ENTITY_API_VERSION: &str = "entity.k8slens.dev/v1alpha1";

/// Source tag of entities produced by this crate.
pub const LOCAL_SOURCE: &str = "local";

/// Label naming the kubeconfig file an entity was synced from.
pub const KUBECONFIG_SYNC_LABEL: &str = "KUBECONFIG_SYNC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    pub uid: String,
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub distro: Option<String>,
    pub kube_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub address: Option<PrometheusPreferences>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSpec {
    /// `"local"` means the cluster's own settings win over the entity's
    pub source: String,
    pub prometheus: Option<PrometheusSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesClusterSpec {
    pub kubeconfig_path: PathBuf,
    pub kubeconfig_context: String,
    pub accessible_namespaces: Option<Vec<String>>,
    pub metrics: Option<MetricsSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatus {
    pub phase: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

fn enabled_default() -> bool {
    true
}

/// UI-facing record for one Kubernetes cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntity {
    pub api_version: String,
    pub kind: String,
    pub metadata: EntityMetadata,
    pub spec: KubernetesClusterSpec,
    pub status: EntityStatus,
}

impl CatalogEntity {
    pub fn id(&self) -> &str {
        &self.metadata.uid
    }

    pub fn is_kubernetes_cluster(&self) -> bool {
        self.kind == KUBERNETES_CLUSTER_KIND
    }

    pub fn is_local(&self) -> bool {
        self.metadata.source == LOCAL_SOURCE
    }

    /// Fresh entity for a cluster that is not in the catalog yet.
    pub fn from_cluster(cluster: &ClusterSnapshot) -> Self {
        let model = &cluster.model;
        let initial_phase = if cluster.disconnected() {
            phase::DISCONNECTED
        } else {
            phase::CONNECTED
        };

        Self {
            api_version: ENTITY_API_VERSION.to_string(),
            kind: KUBERNETES_CLUSTER_KIND.to_string(),
            metadata: EntityMetadata {
                uid: model.id.clone(),
                name: model.display_name().to_string(),
                source: LOCAL_SOURCE.to_string(),
                labels: model.labels.clone(),
                distro: cluster.distro.clone(),
                kube_version: cluster.kube_version.clone(),
            },
            spec: KubernetesClusterSpec {
                kubeconfig_path: model.kube_config_path.clone(),
                kubeconfig_context: model.context_name.clone(),
                accessible_namespaces: None,
                metrics: None,
            },
            status: EntityStatus {
                phase: initial_phase.to_string(),
                reason: String::new(),
                message: String::new(),
                active: false,
                enabled: true,
                last_seen: cluster.last_seen,
            },
        }
    }
}

/// Phase names reserved for clusters managed here. Other sources may set any
/// other string and it is preserved while the cluster is disconnected.
pub mod phase {
    pub const CONNECTED: &str = "connected";
    pub const CONNECTING: &str = "connecting";
    pub const DISCONNECTED: &str = "disconnected";
    pub const DELETING: &str = "deleting";

    pub const RESERVED: [&str; 4] = [CONNECTED, CONNECTING, DISCONNECTED, DELETING];

    pub fn is_reserved(phase: &str) -> bool {
        RESERVED.contains(&phase)
    }
}
