use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use kube::config::Kubeconfig;

use crate::error::{Error, Result};
use crate::models::catalog::KUBECONFIG_SYNC_LABEL;
use crate::models::cluster::{ClusterPreferences, UpdateClusterModel};
use crate::models::k8s::KubeContext;

// ── parsing ───────────────────────────────────────────────────────────────────

/// Parses kubeconfig text. Multiple YAML documents are merged the way kubectl
/// merges several files; unknown fields are ignored.
pub fn load_config_from_str(text: &str) -> Result<Kubeconfig> {
    Ok(Kubeconfig::from_yaml(text)?)
}

/// Returns one entry per context, with the referenced cluster's server and
/// proxy URL resolved. Contexts without a body are skipped.
pub fn split_config(config: &Kubeconfig) -> Vec<KubeContext> {
    let current = config.current_context.clone().unwrap_or_default();

    // Build a cluster-name → (server, proxy-url) lookup from the clusters stanza
    let cluster_urls: HashMap<&str, (Option<String>, Option<String>)> = config
        .clusters
        .iter()
        .filter_map(|nc| {
            let cluster = nc.cluster.as_ref()?;
            Some((
                nc.name.as_str(),
                (cluster.server.clone(), cluster.proxy_url.clone()),
            ))
        })
        .collect();

    config
        .contexts
        .iter()
        .filter_map(|named| {
            let ctx = named.context.as_ref()?;
            let (server_url, proxy_url) = cluster_urls
                .get(ctx.cluster.as_str())
                .cloned()
                .unwrap_or_default();
            Some(KubeContext {
                name: named.name.clone(),
                cluster: ctx.cluster.clone(),
                user: ctx.user.clone().unwrap_or_default(),
                namespace: ctx.namespace.clone(),
                is_active: named.name == current,
                server_url,
                proxy_url,
            })
        })
        .collect()
}

/// Checks that `context_name` can be connected to: the context exists, its
/// cluster exists with a non-empty server URL, and it names an existing user.
/// Returns the reason when it cannot.
pub fn validate_context(config: &Kubeconfig, context_name: &str) -> std::result::Result<(), String> {
    let context = config
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .and_then(|c| c.context.as_ref())
        .ok_or_else(|| format!("no context named \"{context_name}\""))?;

    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == context.cluster)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| format!("no cluster named \"{}\"", context.cluster))?;

    match cluster.server.as_deref().map(str::trim) {
        Some(server) if !server.is_empty() => {}
        _ => return Err(format!("cluster \"{}\" has no server url", context.cluster)),
    }

    let user = context.user.as_deref().unwrap_or_default();
    if user.is_empty() {
        return Err("context has no user".to_string());
    }

    if !config.auth_infos.iter().any(|u| u.name == user) {
        return Err(format!("no user named \"{user}\""));
    }

    Ok(())
}

/// Turns every valid context of `config` into a model sourced from `file_path`.
/// Invalid contexts are logged and dropped.
pub fn config_to_models(config: &Kubeconfig, file_path: &Path) -> Vec<UpdateClusterModel> {
    split_config(config)
        .into_iter()
        .filter_map(|ctx| {
            if let Err(reason) = validate_context(config, &ctx.name) {
                log::debug!(
                    "kubeconfig: context \"{}\" failed validation: {reason} — {}",
                    ctx.name,
                    file_path.display()
                );
                return None;
            }

            let preferences = (ctx.proxy_url.is_some() || ctx.namespace.is_some()).then(|| {
                ClusterPreferences {
                    https_proxy: ctx.proxy_url.clone(),
                    default_namespace: ctx.namespace.clone(),
                    ..ClusterPreferences::default()
                }
            });

            let mut labels = BTreeMap::new();
            labels.insert(
                KUBECONFIG_SYNC_LABEL.to_string(),
                file_path.display().to_string(),
            );

            Some(UpdateClusterModel {
                kube_config_path: file_path.to_path_buf(),
                context_name: ctx.name,
                preferences,
                labels,
            })
        })
        .collect()
}

// ── per-context extraction ────────────────────────────────────────────────────

/// Returns a copy of `config` holding only `context_name` with its cluster and
/// user, selected as current context. Relative file references are resolved
/// against `base_dir` so the result can be written anywhere.
pub fn extract_context(
    config: &Kubeconfig,
    context_name: &str,
    base_dir: Option<&Path>,
) -> Result<Kubeconfig> {
    validate_context(config, context_name).map_err(|reason| Error::InvalidContext {
        context: context_name.to_string(),
        reason,
    })?;

    let mut minimal = config.clone();
    minimal.contexts.retain(|c| c.name == context_name);

    let (cluster_name, user_name) = match minimal.contexts.first().and_then(|c| c.context.as_ref()) {
        Some(ctx) => (ctx.cluster.clone(), ctx.user.clone().unwrap_or_default()),
        None => {
            return Err(Error::InvalidContext {
                context: context_name.to_string(),
                reason: "context disappeared during extraction".to_string(),
            })
        }
    };

    minimal.clusters.retain(|c| c.name == cluster_name);
    minimal.clusters.truncate(1);
    minimal.auth_infos.retain(|u| u.name == user_name);
    minimal.auth_infos.truncate(1);
    minimal.current_context = Some(context_name.to_string());

    if let Some(dir) = base_dir {
        for named in &mut minimal.clusters {
            if let Some(cluster) = named.cluster.as_mut() {
                absolutize(&mut cluster.certificate_authority, dir);
            }
        }
        for named in &mut minimal.auth_infos {
            if let Some(auth) = named.auth_info.as_mut() {
                absolutize(&mut auth.client_certificate, dir);
                absolutize(&mut auth.client_key, dir);
                absolutize(&mut auth.token_file, dir);
            }
        }
    }

    Ok(minimal)
}

fn absolutize(field: &mut Option<String>, base_dir: &Path) {
    if let Some(value) = field.as_mut() {
        let path = PathBuf::from(value.as_str());
        if path.is_relative() {
            *value = base_dir.join(path).display().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_CONTEXTS: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
  - name: dev-cluster
    cluster:
      server: https://dev.example.com:6443
      proxy-url: http://corp-proxy:3128
      certificate-authority: certs/ca.crt
  - name: prod-cluster
    cluster:
      server: https://prod.example.com
users:
  - name: dev-user
    user:
      client-certificate: certs/dev.crt
      client-key: /abs/dev.key
  - name: prod-user
    user:
      token: abc
contexts:
  - name: dev
    context:
      cluster: dev-cluster
      user: dev-user
      namespace: team-a
  - name: prod
    context:
      cluster: prod-cluster
      user: prod-user
some-unknown-field: true
"#;

    #[test]
    fn test_split_config_resolves_server_and_current() {
        let config = load_config_from_str(TWO_CONTEXTS).expect("parse");
        let contexts = split_config(&config);

        assert_eq!(contexts.len(), 2);
        let dev = &contexts[0];
        assert_eq!(dev.name, "dev");
        assert!(dev.is_active);
        assert_eq!(dev.server_url.as_deref(), Some("https://dev.example.com:6443"));
        assert_eq!(dev.proxy_url.as_deref(), Some("http://corp-proxy:3128"));
        assert_eq!(dev.namespace.as_deref(), Some("team-a"));
        assert!(!contexts[1].is_active);
    }

    #[test]
    fn test_config_to_models_drops_invalid_contexts() {
        let text = r#"
clusters:
  - name: no-server
    cluster: {}
  - name: ok
    cluster:
      server: https://ok.example.com
users:
  - name: u
    user: {}
contexts:
  - name: missing-server
    context: { cluster: no-server, user: u }
  - name: missing-user
    context: { cluster: ok }
  - name: unknown-user
    context: { cluster: ok, user: ghost }
  - name: unknown-cluster
    context: { cluster: nowhere, user: u }
  - name: good
    context: { cluster: ok, user: u }
"#;
        let config = load_config_from_str(text).expect("parse");
        let models = config_to_models(&config, Path::new("/kube/config"));

        assert_eq!(models.len(), 1);
        assert_eq!(models[0].context_name, "good");
        assert_eq!(models[0].kube_config_path, PathBuf::from("/kube/config"));
        assert_eq!(
            models[0].labels.get(KUBECONFIG_SYNC_LABEL).map(String::as_str),
            Some("/kube/config")
        );
        assert!(models[0].preferences.is_none());
    }

    #[test]
    fn test_config_to_models_derives_preferences() {
        let config = load_config_from_str(TWO_CONTEXTS).expect("parse");
        let models = config_to_models(&config, Path::new("/kube/config"));

        let prefs = models[0].preferences.as_ref().expect("dev has preferences");
        assert_eq!(prefs.https_proxy.as_deref(), Some("http://corp-proxy:3128"));
        assert_eq!(prefs.default_namespace.as_deref(), Some("team-a"));
        assert!(models[1].preferences.is_none());
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        assert!(load_config_from_str("clusters: [unterminated").is_err());
    }

    #[test]
    fn test_extract_context_keeps_single_entry_with_absolute_paths() {
        let config = load_config_from_str(TWO_CONTEXTS).expect("parse");
        let minimal =
            extract_context(&config, "dev", Some(Path::new("/home/me/.kube"))).expect("extract");

        assert_eq!(minimal.contexts.len(), 1);
        assert_eq!(minimal.clusters.len(), 1);
        assert_eq!(minimal.auth_infos.len(), 1);
        assert_eq!(minimal.current_context.as_deref(), Some("dev"));

        let cluster = minimal.clusters[0].cluster.as_ref().expect("cluster body");
        assert_eq!(
            cluster.certificate_authority.as_deref(),
            Some("/home/me/.kube/certs/ca.crt")
        );
        let auth = minimal.auth_infos[0].auth_info.as_ref().expect("user body");
        assert_eq!(
            auth.client_certificate.as_deref(),
            Some("/home/me/.kube/certs/dev.crt")
        );
        assert_eq!(auth.client_key.as_deref(), Some("/abs/dev.key"));
    }

    #[test]
    fn test_extract_context_rejects_invalid() {
        let config = load_config_from_str(TWO_CONTEXTS).expect("parse");
        let err = extract_context(&config, "staging", None).expect_err("missing context");
        assert!(matches!(err, Error::InvalidContext { .. }));
    }
}
