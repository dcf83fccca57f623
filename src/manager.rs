//! Owner of every live [`Cluster`] and of their catalog projection.
//!
//! Clusters report changes over an mpsc channel; the manager's event loop
//! re-derives the matching entity and replaces it in the catalog. The same loop
//! watches the catalog for Kubernetes clusters contributed by other sources and
//! mirrors them into clusters.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Weak};

use http::Uri;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::catalog::{CatalogChange, CatalogRegistry};
use crate::cluster::projection::project_entity;
use crate::cluster::{Cluster, ClusterDeps, ClusterEvent, ClusterProbe};
use crate::config::ConnectConfig;
use crate::error::{Error, Result};
use crate::models::catalog::{phase, CatalogEntity, LOCAL_SOURCE};
use crate::models::cluster::{
    ClusterId, ClusterModel, ClusterSnapshot, PrometheusProvider, UpdateClusterModel,
};
use crate::proxy::{is_watch_request, ProxyTarget};

/// A `/<clusterId>/<api path>` request resolved to its cluster.
pub struct RoutedRequest {
    pub cluster: Arc<Cluster>,
    /// API path and query with the cluster prefix stripped
    pub path: String,
    pub is_watch: bool,
}

impl RoutedRequest {
    pub fn target(&self) -> Result<ProxyTarget> {
        self.cluster.proxy().get_target(self.is_watch)
    }
}

pub struct ClusterManager {
    catalog: Arc<CatalogRegistry>,
    deps: ClusterDeps,
    clusters: RwLock<BTreeMap<ClusterId, Arc<Cluster>>>,
    being_deleted: RwLock<BTreeSet<ClusterId>>,
    visible: RwLock<Option<ClusterId>>,
    /// Held from reading a cluster to writing its entity, and from dropping a
    /// cluster to removing its entity, so a removed cluster's entity never
    /// comes back.
    projection: Mutex<()>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Creates the manager and spawns its event loop. Must run inside a tokio
    /// runtime.
    pub fn start(
        config: &ConnectConfig,
        catalog: Arc<CatalogRegistry>,
        probe: Arc<dyn ClusterProbe>,
    ) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let changes = catalog.subscribe();

        let manager = Arc::new(Self {
            catalog,
            deps: ClusterDeps {
                command: config.proxy.clone(),
                credentials_dir: config.credentials_dir.clone(),
                timeouts: config.timeouts,
                probe,
                events,
            },
            clusters: RwLock::new(BTreeMap::new()),
            being_deleted: RwLock::new(BTreeSet::new()),
            visible: RwLock::new(None),
            projection: Mutex::new(()),
            event_loop: Mutex::new(None),
        });

        let handle = tokio::spawn(run_event_loop(Arc::downgrade(&manager), events_rx, changes));
        *manager.event_loop.lock() = Some(handle);

        // entities other sources registered before we subscribed
        manager.sync_clusters_from_catalog();
        manager
    }

    pub fn catalog(&self) -> &Arc<CatalogRegistry> {
        &self.catalog
    }

    pub fn get(&self, id: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(id).cloned()
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.clusters.read().values().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<ClusterSnapshot> {
        self.clusters().iter().map(|c| c.snapshot()).collect()
    }

    pub fn find_by_context(&self, kube_config_path: &Path, context_name: &str) -> Option<Arc<Cluster>> {
        self.clusters
            .read()
            .values()
            .find(|c| {
                let model = c.model();
                model.kube_config_path == kube_config_path && model.context_name == context_name
            })
            .cloned()
    }

    /// Creates a cluster with a fresh id and publishes its entity.
    pub fn add_cluster(&self, update: UpdateClusterModel) -> Result<Arc<Cluster>> {
        let id = uuid::Uuid::new_v4().to_string();
        self.insert_cluster(ClusterModel::from_update(id, update))
    }

    /// Registers a cluster under the model's own id and publishes its entity.
    pub fn insert_cluster(&self, model: ClusterModel) -> Result<Arc<Cluster>> {
        let id = model.id.clone();
        let cluster = {
            let mut clusters = self.clusters.write();
            if let Some(existing) = clusters.values().find(|c| {
                let m = c.model();
                m.id == model.id
                    || (m.kube_config_path == model.kube_config_path
                        && m.context_name == model.context_name)
            }) {
                return Err(Error::DuplicateContext {
                    path: model.kube_config_path.display().to_string(),
                    context: model.context_name,
                    existing: existing.id().to_string(),
                });
            }
            let cluster = Arc::new(Cluster::new(model, self.deps.clone()));
            clusters.insert(id.clone(), Arc::clone(&cluster));
            cluster
        };

        log::info!(
            "manager: added cluster {id} ({})",
            cluster.model().context_name
        );
        self.update_entity_from_cluster(&id);
        Ok(cluster)
    }

    /// Applies fresh source data to an existing cluster in place.
    pub fn update_cluster(&self, id: &str, update: UpdateClusterModel) -> Result<bool> {
        let cluster = self
            .get(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        let changed = cluster.update_model(update);
        if changed {
            self.update_entity_from_cluster(id);
        }
        Ok(changed)
    }

    /// Disconnects the cluster, forgets it and removes its entity.
    pub fn remove_cluster(&self, id: &str) -> Option<Arc<Cluster>> {
        let cluster = {
            let _projection = self.projection.lock();
            let cluster = self.clusters.write().remove(id)?;
            self.being_deleted.write().remove(id);
            self.catalog.remove_entity(id);
            cluster
        };
        cluster.disconnect();
        log::info!("manager: removed cluster {id}");
        Some(cluster)
    }

    /// Re-derives the entity of `id` and replaces it in the catalog.
    pub fn update_entity_from_cluster(&self, id: &str) {
        self.project(id, false);
    }

    /// Writes the entity of `id` unless the cluster is gone. With
    /// `source_missing` the phase reads disconnected whatever the entity's
    /// source last set.
    fn project(&self, id: &str, source_missing: bool) {
        let _projection = self.projection.lock();
        let Some(cluster) = self.get(id) else {
            return;
        };
        let snapshot = cluster.snapshot();
        let previous = self.catalog.get(id);
        let being_deleted = self.being_deleted.read().contains(id);

        let mut entity = project_entity(previous.as_ref(), &snapshot, being_deleted);
        if previous.is_none() {
            entity.status.active = self.visible.read().as_deref() == Some(id);
        }
        if source_missing && !being_deleted {
            entity.status.phase = phase::DISCONNECTED.to_string();
        }
        self.catalog.upsert_entity(entity);
    }

    /// Mirrors every Kubernetes cluster entity of another source into a cluster.
    pub fn sync_clusters_from_catalog(&self) {
        for entity in self.catalog.kubernetes_clusters() {
            if !entity.is_local() {
                self.sync_entity(&entity);
            }
        }
    }

    fn sync_entity(&self, entity: &CatalogEntity) {
        let id = entity.id();
        let namespaces: BTreeSet<String> = entity
            .spec
            .accessible_namespaces
            .iter()
            .flatten()
            .cloned()
            .collect();

        let Some(cluster) = self.get(id) else {
            let path = &entity.spec.kubeconfig_path;
            if !path.exists() {
                log::warn!(
                    "manager: skipping entity {id}: kubeconfig {} does not exist",
                    path.display()
                );
                return;
            }
            // preferences belong to whichever source configured the entity
            let model = ClusterModel {
                id: id.to_string(),
                kube_config_path: path.clone(),
                context_name: entity.spec.kubeconfig_context.clone(),
                accessible_namespaces: namespaces,
                preferences: None,
                labels: BTreeMap::new(),
            };
            if let Err(e) = self.insert_cluster(model) {
                log::warn!("manager: cannot sync entity {id}: {e}");
            }
            return;
        };

        let path = &entity.spec.kubeconfig_path;
        if !path.exists() {
            log::warn!(
                "manager: kubeconfig {} of cluster {id} is gone, disconnecting",
                path.display()
            );
            cluster.disconnect();
            self.project(id, true);
            return;
        }

        cluster.edit_model(|model| {
            model.kube_config_path = entity.spec.kubeconfig_path.clone();
            model.context_name = entity.spec.kubeconfig_context.clone();
            model.accessible_namespaces = namespaces;

            if let Some(metrics) = entity.spec.metrics.as_ref().filter(|m| m.source != LOCAL_SOURCE) {
                let prefs = model.preferences.get_or_insert_with(Default::default);
                let prometheus = metrics.prometheus.as_ref();
                prefs.prometheus = prometheus.and_then(|p| p.address.clone());
                prefs.prometheus_provider = prometheus
                    .and_then(|p| p.kind.clone())
                    .map(|kind| PrometheusProvider { kind });
            }
        });
        self.update_entity_from_cluster(id);
    }

    /// Marks `id` as the cluster shown in the UI; every other cluster entity
    /// becomes inactive.
    pub fn set_visible_cluster(&self, id: Option<&str>) {
        let _projection = self.projection.lock();
        *self.visible.write() = id.map(str::to_string);
        for entity in self.catalog.kubernetes_clusters() {
            self.catalog.set_active(entity.id(), Some(entity.id()) == id);
        }
    }

    pub fn visible_cluster(&self) -> Option<ClusterId> {
        self.visible.read().clone()
    }

    pub fn mark_deleting(&self, id: &str) {
        self.being_deleted.write().insert(id.to_string());
        self.update_entity_from_cluster(id);
    }

    pub fn clear_deleting(&self, id: &str) {
        if self.being_deleted.write().remove(id) {
            self.update_entity_from_cluster(id);
        }
    }

    pub fn is_being_deleted(&self, id: &str) -> bool {
        self.being_deleted.read().contains(id)
    }

    pub fn delete_cluster(&self, id: &str) -> Result<()> {
        self.remove_cluster(id)
            .map(|_| ())
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))
    }

    /// Every connected or connecting cluster loses connectivity until a refresh
    /// says otherwise. Returns the refresh tasks.
    pub fn on_network_offline(&self) -> Vec<JoinHandle<()>> {
        log::info!("manager: network offline");
        self.refresh_active(true)
    }

    /// Re-probes every connected or connecting cluster. Returns the refresh tasks.
    pub fn on_network_online(&self) -> Vec<JoinHandle<()>> {
        log::info!("manager: network online");
        self.refresh_active(false)
    }

    fn refresh_active(&self, mark_offline: bool) -> Vec<JoinHandle<()>> {
        self.clusters()
            .into_iter()
            .filter(|c| !c.is_disconnected())
            .map(|cluster| {
                if mark_offline {
                    cluster.mark_offline();
                }
                tokio::spawn(async move { cluster.refresh_connection_status().await })
            })
            .collect()
    }

    /// Resolves `/<clusterId>/<api path>` to the cluster it addresses.
    pub fn route_request(&self, uri: &Uri) -> Option<RoutedRequest> {
        let path = uri.path().strip_prefix('/')?;
        let (id, rest) = path.split_once('/').unwrap_or((path, ""));
        let cluster = self.get(id)?;

        let mut api_path = format!("/{rest}");
        if let Some(query) = uri.query() {
            api_path.push('?');
            api_path.push_str(query);
        }
        Some(RoutedRequest {
            cluster,
            path: api_path,
            is_watch: is_watch_request(uri),
        })
    }

    /// Disconnects every cluster and stops the event loop.
    pub fn stop(&self) {
        for cluster in self.clusters() {
            cluster.disconnect();
        }
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        log::info!("manager: stopped");
    }

    fn handle_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::Changed(id) => self.update_entity_from_cluster(&id),
            ClusterEvent::ProxyExited { id, spawn, reason } => {
                if let Some(cluster) = self.get(&id) {
                    cluster.handle_proxy_exit(spawn, reason);
                }
            }
        }
    }

    fn handle_catalog_change(&self, change: CatalogChange) {
        match change {
            CatalogChange::Upserted { entity } => {
                if entity.is_kubernetes_cluster() && !entity.is_local() {
                    self.sync_entity(&entity);
                }
            }
            CatalogChange::Removed { entity } => {
                if entity.is_kubernetes_cluster() && !entity.is_local() {
                    self.remove_cluster(entity.id());
                }
            }
            CatalogChange::ActiveChanged { .. } => {}
        }
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_event_loop(
    manager: Weak<ClusterManager>,
    mut events: mpsc::UnboundedReceiver<ClusterEvent>,
    mut changes: broadcast::Receiver<CatalogChange>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(manager) = manager.upgrade() else { break };
                manager.handle_event(event);
            }
            change = changes.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                match change {
                    Ok(change) => manager.handle_catalog_change(change),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("manager: missed {missed} catalog change(s), resyncing");
                        manager.sync_clusters_from_catalog();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    log::debug!("manager: event loop finished");
}
