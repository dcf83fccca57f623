#[cfg(feature = "desktop")]
const COMMANDS: &[&str] = &[
    "get_kubeconfig_contexts",
    "list_sync_paths",
    "add_sync_path",
    "remove_sync_path",
    "activate_cluster",
    "disconnect_cluster",
    "get_proxy_target",
    "list_clusters",
    "list_catalog_entities",
    "set_visible_cluster",
    "delete_cluster",
    "network_status_changed",
];

fn main() {
    // generates permissions/autogenerated for the commands above
    #[cfg(feature = "desktop")]
    tauri_plugin::Builder::new(COMMANDS).build();
}
