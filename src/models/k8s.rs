// Plain views over kubeconfig entries, detached from kube-rs types
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeContext {
    pub name: String,
    pub cluster: String,
    pub user: String,
    pub namespace: Option<String>,
    pub is_active: bool,
    /// API server URL of the referenced cluster entry
    pub server_url: Option<String>,
    /// `proxy-url` of the referenced cluster entry, forwarded as HTTPS_PROXY
    pub proxy_url: Option<String>,
}
