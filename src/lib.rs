pub mod catalog;
pub mod cluster;
#[cfg(feature = "desktop")]
pub mod commands;
pub mod config;
pub mod connect;
pub mod error;
pub mod kubeconfig;
pub mod manager;
pub mod models;
pub mod proxy;
pub mod sync;

pub use catalog::{CatalogChange, CatalogRegistry};
pub use cluster::{Cluster, ClusterEvent, ClusterProbe, HttpProbe, ProbeOutcome};
pub use config::ConnectConfig;
pub use connect::ClusterConnect;
pub use error::{Error, Result};
pub use manager::ClusterManager;
pub use sync::{KubeconfigSyncManager, SyncEvent};

#[cfg(feature = "desktop")]
use tauri::{
    plugin::{Builder, TauriPlugin},
    Emitter, Manager, RunEvent, Runtime,
};

/// Tauri plugin hosting the connectivity core.
///
/// Catalog changes are emitted to the webview as `catalog-changed`, sync
/// outcomes as `kubeconfig-sync`.
#[cfg(feature = "desktop")]
pub fn plugin<R: Runtime>(config: ConnectConfig) -> TauriPlugin<R> {
    Builder::new("cluster-connect")
        .invoke_handler(tauri::generate_handler![
            commands::kubeconfig::get_kubeconfig_contexts,
            commands::kubeconfig::list_sync_paths,
            commands::kubeconfig::add_sync_path,
            commands::kubeconfig::remove_sync_path,
            commands::proxy::activate_cluster,
            commands::proxy::disconnect_cluster,
            commands::proxy::get_proxy_target,
            commands::clusters::list_clusters,
            commands::clusters::list_catalog_entities,
            commands::clusters::set_visible_cluster,
            commands::clusters::delete_cluster,
            commands::clusters::network_status_changed,
        ])
        .setup(move |app, _api| {
            if cfg!(debug_assertions) {
                app.plugin(
                    tauri_plugin_log::Builder::default()
                        .level(log::LevelFilter::Info)
                        .build(),
                )?;
            }

            // services spawn tasks, so they are built inside the runtime
            let connect = tauri::async_runtime::block_on(async move { ClusterConnect::start(config) })?;

            let mut changes = connect.catalog().subscribe();
            let mut sync_events = connect.sync().subscribe();
            let handle = app.clone();
            tauri::async_runtime::spawn(async move {
                loop {
                    tokio::select! {
                        change = changes.recv() => match change {
                            Ok(change) => {
                                let _ = handle.emit("catalog-changed", &change);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        },
                        event = sync_events.recv() => match event {
                            Ok(event) => {
                                let _ = handle.emit("kubeconfig-sync", &event);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        },
                    }
                }
            });

            app.manage(connect);
            Ok(())
        })
        .on_event(|app, event| {
            if let RunEvent::Exit = event {
                if let Some(connect) = app.try_state::<ClusterConnect>() {
                    tauri::async_runtime::block_on(connect.shutdown());
                }
            }
        })
        .build()
}
