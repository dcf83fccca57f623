use tauri::State;

use crate::connect::ClusterConnect;
use crate::models::catalog::CatalogEntity;
use crate::models::cluster::ClusterSnapshot;

#[tauri::command]
pub async fn list_clusters(state: State<'_, ClusterConnect>) -> Result<Vec<ClusterSnapshot>, String> {
    Ok(state.manager().snapshots())
}

#[tauri::command]
pub async fn list_catalog_entities(
    state: State<'_, ClusterConnect>,
) -> Result<Vec<CatalogEntity>, String> {
    Ok(state.catalog().kubernetes_clusters())
}

/// Marks the cluster the UI is showing; `None` clears it.
#[tauri::command]
pub async fn set_visible_cluster(
    cluster_id: Option<String>,
    state: State<'_, ClusterConnect>,
) -> Result<(), String> {
    state.manager().set_visible_cluster(cluster_id.as_deref());
    Ok(())
}

/// Shows the cluster as deleting, then disconnects and removes it.
#[tauri::command]
pub async fn delete_cluster(
    cluster_id: String,
    state: State<'_, ClusterConnect>,
) -> Result<(), String> {
    let manager = state.manager();
    manager.mark_deleting(&cluster_id);
    manager.delete_cluster(&cluster_id).map_err(|e| {
        manager.clear_deleting(&cluster_id);
        e.to_string()
    })
}

/// Forwarded from the webview's `online` / `offline` window events.
#[tauri::command]
pub async fn network_status_changed(
    online: bool,
    state: State<'_, ClusterConnect>,
) -> Result<(), String> {
    let refreshes = if online {
        state.manager().on_network_online()
    } else {
        state.manager().on_network_offline()
    };
    log::info!("manager: refreshing {} cluster(s)", refreshes.len());
    Ok(())
}
