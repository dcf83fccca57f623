//! Derives the catalog entity of a cluster from its current snapshot.

use crate::models::catalog::{phase, CatalogEntity, MetricsSpec, PrometheusSpec, LOCAL_SOURCE};
use crate::models::cluster::ClusterSnapshot;

/// Phase shown for a cluster. The checks run in this order, always:
/// deleting, accessible, not yet disconnected, a custom phase set by another
/// source, disconnected.
pub fn derive_phase(
    being_deleted: bool,
    cluster: &ClusterSnapshot,
    current_phase: Option<&str>,
) -> String {
    if being_deleted {
        return phase::DELETING.to_string();
    }
    if cluster.accessible {
        return phase::CONNECTED.to_string();
    }
    if !cluster.disconnected() {
        return phase::CONNECTING.to_string();
    }
    match current_phase {
        Some(custom) if !phase::is_reserved(custom) => custom.to_string(),
        _ => phase::DISCONNECTED.to_string(),
    }
}

/// Builds the replacement entity for `cluster`.
///
/// Everything derived from the model is rebuilt. From `previous` only what the
/// entity's source owns survives: the source itself, the `active` flag, a
/// custom phase, and for entities of other sources their labels and metrics.
pub fn project_entity(
    previous: Option<&CatalogEntity>,
    cluster: &ClusterSnapshot,
    being_deleted: bool,
) -> CatalogEntity {
    let mut entity = previous
        .cloned()
        .unwrap_or_else(|| CatalogEntity::from_cluster(cluster));
    let model = &cluster.model;

    if entity.is_local() {
        entity.metadata.name = model.display_name().to_string();
        entity.metadata.labels = model.labels.clone();
    } else {
        entity
            .metadata
            .labels
            .extend(model.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if cluster.distro.is_some() {
        entity.metadata.distro = cluster.distro.clone();
    }
    if cluster.kube_version.is_some() {
        entity.metadata.kube_version = cluster.kube_version.clone();
    }

    entity.spec.kubeconfig_path = model.kube_config_path.clone();
    entity.spec.kubeconfig_context = model.context_name.clone();
    entity.spec.accessible_namespaces = (!model.accessible_namespaces.is_empty())
        .then(|| model.accessible_namespaces.iter().cloned().collect());

    let metrics_are_ours = entity
        .spec
        .metrics
        .as_ref()
        .map_or(true, |m| m.source == LOCAL_SOURCE);
    if metrics_are_ours {
        entity.spec.metrics = model
            .preferences
            .as_ref()
            .filter(|p| p.prometheus.is_some() || p.prometheus_provider.is_some())
            .map(|prefs| MetricsSpec {
                source: LOCAL_SOURCE.to_string(),
                prometheus: Some(PrometheusSpec {
                    kind: prefs.prometheus_provider.as_ref().map(|p| p.kind.clone()),
                    address: prefs.prometheus.clone(),
                }),
            });
    }

    let current_phase = previous.map(|e| e.status.phase.as_str());
    entity.status.phase = derive_phase(being_deleted, cluster, current_phase);
    entity.status.enabled = !being_deleted;
    entity.status.message = cluster.last_error.clone().unwrap_or_default();
    entity.status.reason = if cluster.last_error.is_some() && !cluster.accessible {
        "error".to_string()
    } else {
        String::new()
    };
    if cluster.last_seen.is_some() {
        entity.status.last_seen = cluster.last_seen;
    }

    entity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::{
        ClusterModel, ClusterPreferences, ClusterStatus, PrometheusPreferences,
    };

    fn snapshot(status: ClusterStatus, online: bool, accessible: bool) -> ClusterSnapshot {
        ClusterSnapshot {
            model: ClusterModel {
                id: "c1".to_string(),
                kube_config_path: "/kube/config".into(),
                context_name: "dev".to_string(),
                accessible_namespaces: Default::default(),
                preferences: None,
                labels: Default::default(),
            },
            status,
            online,
            accessible,
            last_error: None,
            proxy_port: None,
            kube_version: None,
            distro: None,
            last_seen: None,
        }
    }

    #[test]
    fn test_deleting_wins_over_everything() {
        for (status, online, accessible) in [
            (ClusterStatus::Connected, true, true),
            (ClusterStatus::Connecting, true, false),
            (ClusterStatus::Disconnected, false, false),
        ] {
            let cluster = snapshot(status, online, accessible);
            assert_eq!(derive_phase(true, &cluster, Some("custom")), phase::DELETING);
        }
    }

    #[test]
    fn test_phase_precedence() {
        let connected = snapshot(ClusterStatus::Connected, true, true);
        assert_eq!(derive_phase(false, &connected, None), phase::CONNECTED);

        // offline while connected reads as connecting until the next probe
        let offline = snapshot(ClusterStatus::Connected, false, false);
        assert_eq!(derive_phase(false, &offline, Some("custom")), phase::CONNECTING);

        let disconnected = snapshot(ClusterStatus::Disconnected, false, false);
        assert_eq!(derive_phase(false, &disconnected, Some("maintenance")), "maintenance");
        assert_eq!(
            derive_phase(false, &disconnected, Some(phase::CONNECTED)),
            phase::DISCONNECTED
        );
        assert_eq!(derive_phase(false, &disconnected, None), phase::DISCONNECTED);
    }

    #[test]
    fn test_projection_keeps_active_and_source() {
        let cluster = snapshot(ClusterStatus::Disconnected, false, false);
        let mut previous = CatalogEntity::from_cluster(&cluster);
        previous.status.active = true;
        previous.metadata.source = "extension".to_string();
        previous.status.phase = "provisioning".to_string();

        let mut connected = snapshot(ClusterStatus::Connected, true, true);
        connected.kube_version = Some("v1.30.0".to_string());
        let entity = project_entity(Some(&previous), &connected, false);

        assert!(entity.status.active);
        assert!(entity.status.enabled);
        assert_eq!(entity.metadata.source, "extension");
        assert_eq!(entity.status.phase, phase::CONNECTED);
        assert_eq!(entity.metadata.kube_version.as_deref(), Some("v1.30.0"));

        let deleting = project_entity(Some(&entity), &connected, true);
        assert_eq!(deleting.status.phase, phase::DELETING);
        assert!(!deleting.status.enabled);
    }

    #[test]
    fn test_projection_maps_preferences_to_metrics() {
        let mut cluster = snapshot(ClusterStatus::Disconnected, false, false);
        cluster.model.preferences = Some(ClusterPreferences {
            cluster_name: Some("Dev cluster".to_string()),
            prometheus: Some(PrometheusPreferences {
                namespace: "monitoring".to_string(),
                service: "prometheus".to_string(),
                port: 9090,
                prefix: String::new(),
            }),
            ..ClusterPreferences::default()
        });
        cluster.last_error = Some("invalid credentials".to_string());

        let entity = project_entity(None, &cluster, false);
        assert_eq!(entity.metadata.name, "Dev cluster");
        assert_eq!(entity.metadata.source, LOCAL_SOURCE);
        assert_eq!(entity.status.message, "invalid credentials");
        let metrics = entity.spec.metrics.expect("metrics");
        assert_eq!(metrics.source, LOCAL_SOURCE);
        assert_eq!(
            metrics.prometheus.and_then(|p| p.address).map(|a| a.port),
            Some(9090)
        );
    }

    #[test]
    fn test_projection_drops_fields_the_model_no_longer_has() {
        let mut cluster = snapshot(ClusterStatus::Disconnected, false, false);
        cluster.model.labels.insert("team".to_string(), "core".to_string());
        cluster.model.labels.insert("env".to_string(), "dev".to_string());
        cluster.model.accessible_namespaces.insert("default".to_string());
        cluster.model.preferences = Some(ClusterPreferences {
            prometheus: Some(PrometheusPreferences::default()),
            ..ClusterPreferences::default()
        });
        let previous = project_entity(None, &cluster, false);
        assert_eq!(previous.metadata.labels.len(), 2);
        assert!(previous.spec.accessible_namespaces.is_some());
        assert!(previous.spec.metrics.is_some());

        cluster.model.labels.remove("env");
        cluster.model.accessible_namespaces.clear();
        cluster.model.preferences = None;
        let entity = project_entity(Some(&previous), &cluster, false);

        assert_eq!(entity.metadata.labels.len(), 1);
        assert_eq!(entity.metadata.labels.get("team").map(String::as_str), Some("core"));
        assert_eq!(entity.spec.accessible_namespaces, None);
        assert_eq!(entity.spec.metrics, None);
    }

    #[test]
    fn test_projection_leaves_foreign_labels_and_metrics_alone() {
        let cluster = snapshot(ClusterStatus::Disconnected, false, false);
        let mut previous = CatalogEntity::from_cluster(&cluster);
        previous.metadata.source = "extension".to_string();
        previous
            .metadata
            .labels
            .insert("provider".to_string(), "cloud".to_string());
        previous.spec.metrics = Some(MetricsSpec {
            source: "extension".to_string(),
            prometheus: None,
        });

        let entity = project_entity(Some(&previous), &cluster, false);
        assert_eq!(
            entity.metadata.labels.get("provider").map(String::as_str),
            Some("cloud")
        );
        assert_eq!(entity.spec.metrics, previous.spec.metrics);
    }
}
