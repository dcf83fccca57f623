use std::path::PathBuf;

use tauri::State;

use crate::connect::ClusterConnect;
use crate::kubeconfig::{load_config_from_str, split_config};
use crate::models::k8s::KubeContext;

/// Lists the contexts of one kubeconfig file, valid or not.
///
/// Returns an empty vec, not an error, when the file does not exist.
#[tauri::command]
pub async fn get_kubeconfig_contexts(path: String) -> Result<Vec<KubeContext>, String> {
    let path = PathBuf::from(path);
    if !path.exists() {
        log::info!("kubeconfig: skip (not found)     — {}", path.display());
        return Ok(vec![]);
    }

    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| format!("Failed to read kubeconfig: {e}"))?;
    let config = load_config_from_str(&raw).map_err(|e| e.to_string())?;

    let contexts = split_config(&config);
    log::info!(
        "kubeconfig: ok   ({} context(s))   — {}",
        contexts.len(),
        path.display()
    );
    Ok(contexts)
}

/// Files and directories currently synced into clusters.
#[tauri::command]
pub async fn list_sync_paths(state: State<'_, ClusterConnect>) -> Result<Vec<String>, String> {
    Ok(state
        .sync()
        .watched_paths()
        .iter()
        .map(|p| p.display().to_string())
        .collect())
}

#[tauri::command]
pub async fn add_sync_path(path: String, state: State<'_, ClusterConnect>) -> Result<(), String> {
    state
        .sync()
        .start_new_sync(&PathBuf::from(path))
        .map_err(|e| e.to_string())
}

/// Stops syncing `path`; its clusters are disconnected and removed.
#[tauri::command]
pub async fn remove_sync_path(
    path: String,
    state: State<'_, ClusterConnect>,
) -> Result<bool, String> {
    Ok(state.sync().stop_old_sync(&PathBuf::from(path)).await)
}
