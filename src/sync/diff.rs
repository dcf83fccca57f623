//! Reconciles one kubeconfig file's contents against the clusters it produced
//! last time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::kubeconfig::{config_to_models, load_config_from_str};
use crate::manager::ClusterManager;
use crate::models::catalog::CatalogEntity;
use crate::models::cluster::{ClusterId, UpdateClusterModel};

/// A context of the file and the cluster it became.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedContext {
    pub cluster_id: ClusterId,
    /// Entity as published when the context was last applied
    pub entity: CatalogEntity,
}

/// What one source file currently contributes.
#[derive(Debug, Default)]
pub struct SourceMap {
    /// Keyed by context name
    pub contexts: BTreeMap<String, TrackedContext>,
    pub last_error: Option<String>,
    /// The file could not be read last time
    pub missing: bool,
}

impl SourceMap {
    pub fn cluster_ids(&self) -> impl Iterator<Item = &ClusterId> {
        self.contexts.values().map(|t| &t.cluster_id)
    }
}

/// The mutation a new file revision requires, decided before anything is
/// touched.
#[derive(Debug, Default, PartialEq)]
pub struct DiffPlan {
    /// Tracked context names missing from the new revision
    pub removed: Vec<String>,
    /// Tracked contexts still present, with their fresh data
    pub updated: Vec<(String, UpdateClusterModel)>,
    pub added: Vec<UpdateClusterModel>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

pub fn plan_diff(source: &SourceMap, models: Vec<UpdateClusterModel>) -> DiffPlan {
    let incoming: BTreeSet<&str> = models.iter().map(|m| m.context_name.as_str()).collect();

    let removed = source
        .contexts
        .keys()
        .filter(|name| !incoming.contains(name.as_str()))
        .cloned()
        .collect();

    let mut plan = DiffPlan {
        removed,
        ..DiffPlan::default()
    };
    for model in models {
        if source.contexts.contains_key(&model.context_name) {
            plan.updated.push((model.context_name.clone(), model));
        } else {
            plan.added.push(model);
        }
    }
    plan
}

/// Applies `plan`: removals, then updates, then additions. Never awaits.
pub fn apply_plan(manager: &ClusterManager, source: &mut SourceMap, plan: DiffPlan) -> DiffSummary {
    let mut summary = DiffSummary::default();

    for name in plan.removed {
        if let Some(tracked) = source.contexts.remove(&name) {
            manager.remove_cluster(&tracked.cluster_id);
            summary.removed += 1;
        }
    }

    let mut added = plan.added;
    for (name, update) in plan.updated {
        let Some(tracked) = source.contexts.get_mut(&name) else {
            added.push(update);
            continue;
        };
        match manager.update_cluster(&tracked.cluster_id, update.clone()) {
            Ok(changed) => {
                if changed {
                    summary.updated += 1;
                }
                if let Some(entity) = manager.catalog().get(&tracked.cluster_id) {
                    tracked.entity = entity;
                }
            }
            Err(e) => {
                // deleted behind our back; it comes back as a new cluster
                log::debug!("sync: context \"{name}\" lost its cluster ({e}), re-adding");
                source.contexts.remove(&name);
                added.push(update);
            }
        }
    }

    for update in added {
        let name = update.context_name.clone();
        match manager.add_cluster(update) {
            Ok(cluster) => {
                let entity = manager
                    .catalog()
                    .get(cluster.id())
                    .unwrap_or_else(|| CatalogEntity::from_cluster(&cluster.snapshot()));
                source.contexts.insert(
                    name,
                    TrackedContext {
                        cluster_id: cluster.id().to_string(),
                        entity,
                    },
                );
                summary.added += 1;
            }
            Err(e) => log::warn!("sync: skipping context \"{name}\": {e}"),
        }
    }

    summary
}

/// Parses `text` as the new contents of `path` and applies the difference.
///
/// Text that fails to parse clears everything the file contributed and
/// records the error on the source.
pub fn compute_diff(
    manager: &ClusterManager,
    source: &mut SourceMap,
    path: &Path,
    text: &str,
) -> Result<DiffSummary> {
    let models = if text.trim().is_empty() {
        Vec::new()
    } else {
        match load_config_from_str(text) {
            Ok(config) => config_to_models(&config, path),
            Err(e) => {
                let removed = clear_source(manager, source);
                source.last_error = Some(e.to_string());
                log::warn!(
                    "sync: cannot parse {}: {e} (removed {removed} cluster(s))",
                    path.display()
                );
                return Err(e);
            }
        }
    };

    let plan = plan_diff(source, models);
    let summary = apply_plan(manager, source, plan);
    source.last_error = None;
    source.missing = false;
    Ok(summary)
}

/// Removes every cluster the source contributed. Returns how many.
pub fn clear_source(manager: &ClusterManager, source: &mut SourceMap) -> usize {
    let contexts = std::mem::take(&mut source.contexts);
    for tracked in contexts.values() {
        manager.remove_cluster(&tracked.cluster_id);
    }
    contexts.len()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::CatalogRegistry;
    use crate::cluster::{ClusterProbe, ProbeOutcome};
    use crate::config::ConnectConfig;
    use crate::models::cluster::{ClusterModel, ClusterSnapshot, ClusterStatus};
    use crate::proxy::ProxyTarget;

    struct NoProbe;

    #[async_trait]
    impl ClusterProbe for NoProbe {
        async fn probe(&self, _target: &ProxyTarget, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::offline("unused")
        }
    }

    fn manager(dir: &Path) -> Arc<ClusterManager> {
        let config = ConnectConfig {
            sync_paths: Vec::new(),
            credentials_dir: dir.join("creds"),
            ..ConnectConfig::default()
        };
        ClusterManager::start(&config, Arc::new(CatalogRegistry::new()), Arc::new(NoProbe))
    }

    fn config_with(contexts: &[(&str, Option<&str>)]) -> String {
        let mut text = String::from(
            "clusters:\n  - name: c\n    cluster:\n      server: https://api.example.com\n\
             users:\n  - name: u\n    user:\n      token: t\ncontexts:\n",
        );
        for (name, namespace) in contexts {
            text.push_str(&format!("  - name: {name}\n    context:\n      cluster: c\n      user: u\n"));
            if let Some(ns) = namespace {
                text.push_str(&format!("      namespace: {ns}\n"));
            }
        }
        text
    }

    #[tokio::test]
    async fn test_update_keeps_cluster_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let path = Path::new("/kube/config");
        let mut source = SourceMap::default();

        let summary = compute_diff(&manager, &mut source, path, &config_with(&[("a", None), ("b", None)]))
            .expect("first revision");
        assert_eq!(summary, DiffSummary { added: 2, updated: 0, removed: 0 });
        let a_id = source.contexts["a"].cluster_id.clone();
        let a = manager.get(&a_id).expect("cluster a");

        let summary = compute_diff(
            &manager,
            &mut source,
            path,
            &config_with(&[("a", Some("team-a")), ("b", None)]),
        )
        .expect("second revision");
        assert_eq!(summary, DiffSummary { added: 0, updated: 1, removed: 0 });
        assert_eq!(source.contexts["a"].cluster_id, a_id);
        let same = manager.get(&a_id).expect("still there");
        assert!(Arc::ptr_eq(&a, &same), "updated in place");
        assert_eq!(
            same.model()
                .preferences
                .and_then(|p| p.default_namespace)
                .as_deref(),
            Some("team-a")
        );
    }

    #[tokio::test]
    async fn test_removed_then_readded_context_gets_new_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let path = Path::new("/kube/config");
        let mut source = SourceMap::default();

        compute_diff(&manager, &mut source, path, &config_with(&[("a", None), ("b", None)]))
            .expect("c0");
        let original = source.contexts["a"].cluster_id.clone();

        let summary =
            compute_diff(&manager, &mut source, path, &config_with(&[("b", None)])).expect("c1");
        assert_eq!(summary.removed, 1);
        assert!(manager.get(&original).is_none());
        assert!(manager.catalog().get(&original).is_none());

        compute_diff(&manager, &mut source, path, &config_with(&[("a", None), ("b", None)]))
            .expect("c2");
        let readded = source.contexts["a"].cluster_id.clone();
        assert_ne!(readded, original);
        assert_eq!(manager.clusters().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_text_clears_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let path = Path::new("/kube/config");
        let mut source = SourceMap::default();

        compute_diff(&manager, &mut source, path, &config_with(&[("a", None), ("b", None)]))
            .expect("valid");
        assert_eq!(manager.catalog().len(), 2);

        compute_diff(&manager, &mut source, path, "clusters: [unterminated").expect_err("invalid");
        assert!(source.contexts.is_empty());
        assert!(source.last_error.is_some());
        assert!(manager.clusters().is_empty());
        assert!(manager.catalog().is_empty());

        // recovers on the next good revision
        compute_diff(&manager, &mut source, path, &config_with(&[("a", None)])).expect("recovered");
        assert!(source.last_error.is_none());
        assert_eq!(manager.clusters().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_context_is_skipped_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let path = Path::new("/kube/config");
        manager
            .add_cluster(UpdateClusterModel {
                kube_config_path: path.to_path_buf(),
                context_name: "a".to_string(),
                preferences: None,
                labels: BTreeMap::new(),
            })
            .expect("pre-existing");

        let mut source = SourceMap::default();
        let summary = compute_diff(&manager, &mut source, path, &config_with(&[("a", None), ("b", None)]))
            .expect("diff");
        assert_eq!(summary.added, 1);
        assert!(source.contexts.contains_key("b"));
        assert!(!source.contexts.contains_key("a"));
    }

    #[test]
    fn test_plan_orders_by_kind() {
        let tracked = |id: &str| TrackedContext {
            cluster_id: id.to_string(),
            entity: CatalogEntity::from_cluster(&ClusterSnapshot {
                model: ClusterModel::from_update(id.to_string(), model("x")),
                status: ClusterStatus::Disconnected,
                online: false,
                accessible: false,
                last_error: None,
                proxy_port: None,
                kube_version: None,
                distro: None,
                last_seen: None,
            }),
        };
        fn model(name: &str) -> UpdateClusterModel {
            UpdateClusterModel {
                kube_config_path: "/kube/config".into(),
                context_name: name.to_string(),
                preferences: None,
                labels: BTreeMap::new(),
            }
        }

        let mut source = SourceMap::default();
        source.contexts.insert("old".to_string(), tracked("1"));
        source.contexts.insert("kept".to_string(), tracked("2"));

        let plan = plan_diff(&source, vec![model("kept"), model("new")]);
        assert_eq!(plan.removed, vec!["old".to_string()]);
        assert_eq!(plan.updated.len(), 1);
        assert_eq!(plan.updated[0].0, "kept");
        assert_eq!(plan.added, vec![model("new")]);
    }
}
