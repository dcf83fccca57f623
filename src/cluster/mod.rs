//! Live connection object for one kubeconfig context.

pub mod probe;
pub mod projection;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::version::Info;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::config::{ProxyCommand, Timeouts};
use crate::error::Result;
use crate::models::cluster::{
    ClusterId, ClusterModel, ClusterSnapshot, ClusterStatus, UpdateClusterModel,
};
use crate::proxy::{AuthProxy, ProxyLaunch};

pub use probe::{ClusterProbe, HttpProbe, ProbeOutcome};

/// Change records flowing from clusters and their proxies to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// Something displayed about the cluster changed
    Changed(ClusterId),
    /// The proxy process of spawn number `spawn` died after becoming ready
    ProxyExited {
        id: ClusterId,
        spawn: u32,
        reason: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<ClusterEvent>;

/// Everything a cluster needs besides its model.
#[derive(Clone)]
pub struct ClusterDeps {
    pub command: ProxyCommand,
    pub credentials_dir: PathBuf,
    pub timeouts: Timeouts,
    pub probe: Arc<dyn ClusterProbe>,
    pub events: EventSender,
}

struct ClusterState {
    model: ClusterModel,
    status: ClusterStatus,
    online: bool,
    accessible: bool,
    last_error: Option<String>,
    version: Option<Info>,
    last_seen: Option<chrono::DateTime<Utc>>,
    /// Bumped on disconnect; results of probes started under an older epoch are dropped
    epoch: u64,
}

pub struct Cluster {
    id: ClusterId,
    state: RwLock<ClusterState>,
    proxy: AuthProxy,
    probe: Arc<dyn ClusterProbe>,
    timeouts: Timeouts,
    events: EventSender,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn new(model: ClusterModel, deps: ClusterDeps) -> Self {
        let id = model.id.clone();
        let proxy = AuthProxy::new(
            id.clone(),
            deps.command,
            deps.credentials_dir,
            deps.timeouts,
            deps.events.clone(),
        );
        Self {
            id,
            state: RwLock::new(ClusterState {
                model,
                status: ClusterStatus::Disconnected,
                online: false,
                accessible: false,
                last_error: None,
                version: None,
                last_seen: None,
                epoch: 0,
            }),
            proxy,
            probe: deps.probe,
            timeouts: deps.timeouts,
            events: deps.events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> ClusterModel {
        self.state.read().model.clone()
    }

    pub fn status(&self) -> ClusterStatus {
        self.state.read().status
    }

    pub fn is_disconnected(&self) -> bool {
        self.status() == ClusterStatus::Disconnected
    }

    pub fn proxy(&self) -> &AuthProxy {
        &self.proxy
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let state = self.state.read();
        ClusterSnapshot {
            model: state.model.clone(),
            status: state.status,
            online: state.online,
            accessible: state.accessible,
            last_error: state.last_error.clone(),
            proxy_port: self.proxy.port(),
            kube_version: state.version.as_ref().map(|v| v.git_version.clone()),
            distro: state.version.as_ref().and_then(probe::detect_distro),
            last_seen: state.last_seen,
        }
    }

    /// Applies fresh source data in place. Returns whether anything changed.
    pub fn update_model(&self, update: UpdateClusterModel) -> bool {
        self.edit_model(|model| {
            model.kube_config_path = update.kube_config_path;
            model.context_name = update.context_name;
            model.preferences = update.preferences;
            model.labels = update.labels;
        })
    }

    /// Runs `edit` on the model and notifies if the result differs.
    pub fn edit_model(&self, edit: impl FnOnce(&mut ClusterModel)) -> bool {
        let changed = {
            let mut state = self.state.write();
            let mut model = state.model.clone();
            edit(&mut model);
            model.id = self.id.clone();
            if model == state.model {
                false
            } else {
                state.model = model;
                true
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Connects: starts the proxy and probes the API server through it.
    /// A no-op while connecting or connected.
    pub async fn activate(&self) -> Result<()> {
        let (epoch, launch) = {
            let mut state = self.state.write();
            if state.status != ClusterStatus::Disconnected {
                return Ok(());
            }
            state.status = ClusterStatus::Connecting;
            state.last_error = None;
            (state.epoch, launch_for(&state.model))
        };
        log::info!("cluster: activating {} ({})", self.id, launch.context_name);
        self.notify();

        let target = match self.proxy.ensure(&launch).await {
            Ok(()) => self.proxy.get_target(false),
            Err(e) => Err(e),
        };
        let target = match target {
            Ok(target) => target,
            Err(e) => {
                let reason = e.to_string();
                if self.apply_if_current(epoch, |state| {
                    state.status = ClusterStatus::Disconnected;
                    state.online = false;
                    state.accessible = false;
                    state.last_error = Some(reason);
                }) {
                    log::warn!("cluster: {} failed to connect: {e}", self.id);
                }
                return Err(e);
            }
        };

        let outcome = self.probe.probe(&target, self.timeouts.probe()).await;
        let applied = self.apply_if_current(epoch, |state| {
            state.online = outcome.online;
            state.accessible = outcome.accessible;
            if outcome.accessible {
                state.status = ClusterStatus::Connected;
                record_success(state, outcome.version.clone());
            } else {
                state.status = ClusterStatus::Disconnected;
                state.last_error = outcome.reason.clone();
            }
        });

        match (applied, outcome.accessible) {
            (false, _) => log::debug!("cluster: {} disconnected during activation", self.id),
            (true, true) => log::info!("cluster: {} connected", self.id),
            (true, false) => log::warn!(
                "cluster: {} not accessible: {}",
                self.id,
                outcome.reason.as_deref().unwrap_or("unknown reason")
            ),
        }
        Ok(())
    }

    /// Re-probes the API server without touching the proxy.
    pub async fn refresh_connection_status(&self) {
        let epoch = {
            let state = self.state.read();
            if state.status == ClusterStatus::Disconnected {
                return;
            }
            state.epoch
        };

        let outcome = match self.proxy.get_target(false) {
            Ok(target) => self.probe.probe(&target, self.timeouts.probe()).await,
            Err(e) => ProbeOutcome::offline(e.to_string()),
        };

        self.apply_if_current(epoch, |state| {
            if state.status == ClusterStatus::Disconnected {
                return;
            }
            state.online = outcome.online;
            state.accessible = outcome.accessible;
            if outcome.accessible {
                state.status = ClusterStatus::Connected;
                record_success(state, outcome.version.clone());
            } else if outcome.online {
                // reachable but refused: lost accessibility, proxy stays up
                state.status = ClusterStatus::Disconnected;
                state.last_error = outcome.reason.clone();
            } else {
                state.last_error = outcome.reason.clone();
            }
        });
        log::debug!(
            "cluster: {} refreshed (online={}, accessible={})",
            self.id,
            outcome.online,
            outcome.accessible
        );
    }

    /// Stops the proxy and marks the cluster disconnected.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.write();
            if state.status == ClusterStatus::Disconnected
                && !self.proxy.is_active()
                && !state.online
                && !state.accessible
            {
                return;
            }
            state.epoch += 1;
            state.status = ClusterStatus::Disconnected;
            state.online = false;
            state.accessible = false;
        }
        self.proxy.stop();
        log::info!("cluster: {} disconnected", self.id);
        self.notify();
    }

    /// Network went away. Keeps the status so the next refresh can recover.
    pub fn mark_offline(&self) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.online || state.accessible;
            state.online = false;
            state.accessible = false;
            changed
        };
        if changed {
            self.notify();
        }
    }

    /// Records a proxy crash. Exits of older spawns are ignored.
    pub fn handle_proxy_exit(&self, spawn: u32, reason: String) {
        if spawn != self.proxy.spawn_count() {
            log::debug!("cluster: {} ignoring exit of stale proxy spawn {spawn}", self.id);
            return;
        }
        {
            let mut state = self.state.write();
            state.epoch += 1;
            state.status = ClusterStatus::Disconnected;
            state.online = false;
            state.accessible = false;
            state.last_error = Some(reason);
        }
        self.notify();
    }

    pub fn notify(&self) {
        let _ = self.events.send(ClusterEvent::Changed(self.id.clone()));
    }

    /// Runs `apply` unless a disconnect happened since `epoch` was read, and
    /// notifies. Returns whether it ran.
    fn apply_if_current(&self, epoch: u64, apply: impl FnOnce(&mut ClusterState)) -> bool {
        {
            let mut state = self.state.write();
            if state.epoch != epoch {
                return false;
            }
            apply(&mut state);
        }
        self.notify();
        true
    }
}

fn launch_for(model: &ClusterModel) -> ProxyLaunch {
    ProxyLaunch {
        kubeconfig_path: model.kube_config_path.clone(),
        context_name: model.context_name.clone(),
        https_proxy: model.preferences.as_ref().and_then(|p| p.https_proxy.clone()),
    }
}

fn record_success(state: &mut ClusterState, version: Option<Info>) {
    state.last_error = None;
    state.last_seen = Some(Utc::now());
    if version.is_some() {
        state.version = version;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::proxy::ProxyTarget;

    const CONFIG: &str = r#"
clusters:
  - name: c
    cluster: { server: "https://api.example.com" }
users:
  - name: u
    user: { token: t }
contexts:
  - name: ctx
    context: { cluster: c, user: u }
"#;

    const READY: &str = "echo 'Starting to serve on 127.0.0.1'; exec sleep 30";

    /// Returns queued outcomes in order, then repeats the last one.
    struct ScriptedProbe {
        outcomes: Mutex<Vec<ProbeOutcome>>,
        calls: AtomicUsize,
        /// Answer latency
        delay_ms: AtomicU64,
    }

    impl ScriptedProbe {
        fn new(outcomes: Vec<ProbeOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
                delay_ms: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl ClusterProbe for ScriptedProbe {
        async fn probe(&self, _target: &ProxyTarget, _timeout: Duration) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let mut outcomes = self.outcomes.lock().expect("lock");
                if outcomes.len() > 1 {
                    outcomes.remove(0)
                } else {
                    outcomes.first().cloned().unwrap_or_default()
                }
            };
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            outcome
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cluster: Cluster,
        probe: Arc<ScriptedProbe>,
        events: mpsc::UnboundedReceiver<ClusterEvent>,
    }

    fn fixture(script: &str, outcomes: Vec<ProbeOutcome>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        std::fs::write(&path, CONFIG).expect("write");

        let probe = ScriptedProbe::new(outcomes);
        let (tx, rx) = mpsc::unbounded_channel();
        let deps = ClusterDeps {
            command: ProxyCommand {
                program: PathBuf::from("sh"),
                args: vec!["-c".to_string(), script.to_string()],
                ready_pattern: crate::config::DEFAULT_READY_PATTERN.to_string(),
                startup_timeout_secs: 5,
            },
            credentials_dir: dir.path().join("creds"),
            timeouts: Timeouts::default(),
            probe: probe.clone(),
            events: tx,
        };
        let model = ClusterModel::from_update(
            "c1".to_string(),
            UpdateClusterModel {
                kube_config_path: path,
                context_name: "ctx".to_string(),
                preferences: None,
                labels: Default::default(),
            },
        );

        Fixture {
            _dir: dir,
            cluster: Cluster::new(model, deps),
            probe,
            events: rx,
        }
    }

    #[tokio::test]
    async fn test_activate_connects_and_is_idempotent() {
        let f = fixture(READY, vec![ProbeOutcome::accessible(None)]);

        f.cluster.activate().await.expect("activate");
        f.cluster.activate().await.expect("second activate");

        let snapshot = f.cluster.snapshot();
        assert_eq!(snapshot.status, ClusterStatus::Connected);
        assert!(snapshot.online && snapshot.accessible);
        assert!(snapshot.last_seen.is_some());
        assert_eq!(f.cluster.proxy().spawn_count(), 1);
        assert_eq!(f.probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_activation_discards_late_result() {
        let f = fixture(READY, vec![ProbeOutcome::accessible(None)]);
        f.probe.delay_ms.store(300, Ordering::SeqCst);

        let (activated, ()) = tokio::join!(f.cluster.activate(), async {
            for _ in 0..200 {
                if f.probe.calls.load(Ordering::SeqCst) > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(f.cluster.status(), ClusterStatus::Connecting);
            f.cluster.disconnect();
        });
        activated.expect("activate");

        let snapshot = f.cluster.snapshot();
        assert_eq!(snapshot.status, ClusterStatus::Disconnected);
        assert!(!snapshot.online);
        assert!(!snapshot.accessible);
        assert!(snapshot.last_seen.is_none());
        assert!(!f.cluster.proxy().is_active());
        assert_eq!(f.probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_probe_disconnects_with_reason() {
        let f = fixture(READY, vec![ProbeOutcome::denied("access forbidden")]);

        f.cluster.activate().await.expect("activate");
        let snapshot = f.cluster.snapshot();
        assert_eq!(snapshot.status, ClusterStatus::Disconnected);
        assert!(snapshot.online);
        assert!(!snapshot.accessible);
        assert_eq!(snapshot.last_error.as_deref(), Some("access forbidden"));

        // explicit disconnect still tears the proxy down
        f.cluster.disconnect();
        assert!(!f.cluster.proxy().is_active());
    }

    #[tokio::test]
    async fn test_proxy_failure_is_recorded() {
        let f = fixture("echo 'boom' >&2; exit 1", vec![ProbeOutcome::accessible(None)]);

        let err = f.cluster.activate().await.expect_err("spawn fails");
        let snapshot = f.cluster.snapshot();
        assert_eq!(snapshot.status, ClusterStatus::Disconnected);
        assert_eq!(snapshot.last_error, Some(err.to_string()));
        assert_eq!(f.probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_outcomes() {
        let f = fixture(
            READY,
            vec![
                ProbeOutcome::accessible(None),
                ProbeOutcome::offline("timed out"),
                ProbeOutcome::accessible(None),
                ProbeOutcome::denied("invalid credentials"),
            ],
        );
        f.cluster.refresh_connection_status().await;
        assert_eq!(f.probe.calls.load(Ordering::SeqCst), 0, "no-op while disconnected");

        f.cluster.activate().await.expect("activate");

        f.cluster.refresh_connection_status().await;
        let offline = f.cluster.snapshot();
        assert_eq!(offline.status, ClusterStatus::Connected);
        assert!(!offline.online && !offline.accessible);

        f.cluster.refresh_connection_status().await;
        assert!(f.cluster.snapshot().accessible);

        f.cluster.refresh_connection_status().await;
        let denied = f.cluster.snapshot();
        assert_eq!(denied.status, ClusterStatus::Disconnected);
        assert!(f.cluster.proxy().is_running(), "proxy survives lost access");
        assert_eq!(f.cluster.proxy().spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_noop_when_idle() {
        let mut f = fixture(READY, vec![ProbeOutcome::accessible(None)]);
        f.cluster.disconnect();
        assert!(f.events.try_recv().is_err());

        f.cluster.activate().await.expect("activate");
        f.cluster.disconnect();
        let snapshot = f.cluster.snapshot();
        assert_eq!(snapshot.status, ClusterStatus::Disconnected);
        assert!(!snapshot.online && !snapshot.accessible);
        assert!(snapshot.proxy_port.is_none());
    }

    #[tokio::test]
    async fn test_update_model_notifies_only_on_change() {
        let mut f = fixture(READY, vec![]);
        let mut update = UpdateClusterModel {
            kube_config_path: f.cluster.model().kube_config_path,
            context_name: "ctx".to_string(),
            preferences: None,
            labels: Default::default(),
        };
        assert!(!f.cluster.update_model(update.clone()));
        assert!(f.events.try_recv().is_err());

        update.labels.insert("team".to_string(), "a".to_string());
        assert!(f.cluster.update_model(update));
        assert_eq!(
            f.events.try_recv().expect("change event"),
            ClusterEvent::Changed("c1".to_string())
        );
        assert_eq!(f.cluster.model().id, "c1");
    }
}
