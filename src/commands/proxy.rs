use tauri::State;

use crate::connect::ClusterConnect;
use crate::models::cluster::ClusterSnapshot;
use crate::proxy::ProxyTarget;

/// Starts the cluster's auth proxy and probes the API server through it.
/// Calling it on a connected cluster does nothing.
///
/// The returned snapshot carries the failure reason when the cluster ended
/// up disconnected.
#[tauri::command]
pub async fn activate_cluster(
    cluster_id: String,
    state: State<'_, ClusterConnect>,
) -> Result<ClusterSnapshot, String> {
    let cluster = state
        .manager()
        .get(&cluster_id)
        .ok_or_else(|| format!("cluster {cluster_id} not found"))?;

    if let Err(e) = cluster.activate().await {
        log::warn!("proxy: activate {cluster_id} failed: {e}");
    }
    Ok(cluster.snapshot())
}

/// Kills the cluster's auth proxy and marks it disconnected.
#[tauri::command]
pub async fn disconnect_cluster(
    cluster_id: String,
    state: State<'_, ClusterConnect>,
) -> Result<(), String> {
    let cluster = state
        .manager()
        .get(&cluster_id)
        .ok_or_else(|| format!("cluster {cluster_id} not found"))?;
    cluster.disconnect();
    Ok(())
}

/// Where the webview should send API requests for this cluster.
#[tauri::command]
pub async fn get_proxy_target(
    cluster_id: String,
    is_watch: bool,
    state: State<'_, ClusterConnect>,
) -> Result<ProxyTarget, String> {
    let cluster = state
        .manager()
        .get(&cluster_id)
        .ok_or_else(|| format!("cluster {cluster_id} not found"))?;
    cluster.proxy().get_target(is_watch).map_err(|e| e.to_string())
}
