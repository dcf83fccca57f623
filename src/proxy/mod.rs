//! Supervisor for the per-cluster authenticating proxy process.
//!
//! Each cluster gets its own `kubectl proxy` (or compatible binary) bound to a
//! free port on 127.0.0.1, fed a kubeconfig holding only that cluster's
//! credentials. The supervisor never restarts a dead proxy by itself; a new
//! `ensure` call is required.

pub mod credentials;
pub mod target;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::cluster::{ClusterEvent, EventSender};
use crate::config::{ProxyCommand, Timeouts};
use crate::error::{Error, Result};
use crate::models::cluster::ClusterId;

pub use credentials::ProxyCredentials;
pub use target::{is_watch_request, ProxyTarget};

/// Stderr bytes kept for the exit reason. Keeps the reason readable and avoids
/// echoing large credential dumps into the UI.
const MAX_STDERR_BYTES: usize = 256;
const STDERR_TAIL_LINES: usize = 8;
/// How long to keep reading stderr after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What the proxy needs to know about the cluster it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLaunch {
    pub kubeconfig_path: PathBuf,
    pub context_name: String,
    pub https_proxy: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting,
    Running,
}

struct ProxyState {
    /// Bumped by every `stop`; supervisors of older spawns leave state alone
    generation: u64,
    phase: Phase,
    port: Option<u16>,
    kill: Option<oneshot::Sender<()>>,
    credentials: Option<ProxyCredentials>,
    server_url: Option<String>,
    api_target: Option<ProxyTarget>,
    last_log_line: Option<String>,
    last_error: Option<String>,
}

impl ProxyState {
    fn new() -> Self {
        Self {
            generation: 0,
            phase: Phase::Stopped,
            port: None,
            kill: None,
            credentials: None,
            server_url: None,
            api_target: None,
            last_log_line: None,
            last_error: None,
        }
    }

    /// Resets to stopped and hands back the credentials to delete.
    fn clear(&mut self) -> Option<ProxyCredentials> {
        self.phase = Phase::Stopped;
        self.port = None;
        self.kill = None;
        self.server_url = None;
        self.api_target = None;
        self.credentials.take()
    }
}

pub struct AuthProxy {
    cluster_id: ClusterId,
    command: ProxyCommand,
    credentials_dir: PathBuf,
    timeouts: Timeouts,
    events: EventSender,
    state: Arc<Mutex<ProxyState>>,
    spawn_lock: tokio::sync::Mutex<()>,
    spawn_count: AtomicU32,
}

impl AuthProxy {
    pub fn new(
        cluster_id: ClusterId,
        command: ProxyCommand,
        credentials_dir: PathBuf,
        timeouts: Timeouts,
        events: EventSender,
    ) -> Self {
        Self {
            cluster_id,
            command,
            credentials_dir,
            timeouts,
            events,
            state: Arc::new(Mutex::new(ProxyState::new())),
            spawn_lock: tokio::sync::Mutex::new(()),
            spawn_count: AtomicU32::new(0),
        }
    }

    /// Starts the proxy unless it is already running, and resolves once it
    /// reported readiness. Concurrent callers wait for the same spawn.
    pub async fn ensure(&self, launch: &ProxyLaunch) -> Result<()> {
        let _spawning = self.spawn_lock.lock().await;

        let generation = {
            let state = self.state.lock();
            if state.phase == Phase::Running {
                return Ok(());
            }
            state.generation
        };

        let credentials = ProxyCredentials::prepare(
            &self.credentials_dir,
            &self.cluster_id,
            &launch.kubeconfig_path,
            &launch.context_name,
        )
        .await
        .map_err(|e| self.startup_failed(format!("cannot prepare credentials: {e}")))?;

        let port = match allocate_port() {
            Ok(port) => port,
            Err(e) => {
                credentials.remove();
                return Err(self.startup_failed(format!("no free local port: {e}")));
            }
        };

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg(format!("--port={port}"))
            .arg("--address=127.0.0.1")
            .arg(format!("--kubeconfig={}", credentials.kubeconfig_path().display()))
            .arg(format!("--context={}", launch.context_name))
            .arg(format!("--server={}", credentials.server_url()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(proxy) = &launch.https_proxy {
            cmd.env("HTTPS_PROXY", proxy);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                credentials.remove();
                return Err(self.startup_failed(format!(
                    "failed to spawn {}: {e}",
                    self.command.program.display()
                )));
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            credentials.remove();
            return Err(self.startup_failed("proxy process has no output pipes".to_string()));
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let server_url = credentials.server_url().to_string();

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                drop(state);
                let _ = child.start_kill();
                credentials.remove();
                return Err(Error::ProxyStopped);
            }
            state.phase = Phase::Starting;
            state.port = Some(port);
            state.kill = Some(kill_tx);
            state.credentials = Some(credentials);
            state.server_url = Some(server_url);
            state.api_target = None;
            state.last_error = None;
        }

        let spawn = self.spawn_count.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!(
            "proxy: started {} for cluster {} on port {port} (pid {:?})",
            self.command.program.display(),
            self.cluster_id,
            child.id()
        );

        let supervisor = Supervisor {
            cluster_id: self.cluster_id.clone(),
            generation,
            spawn,
            ready_pattern: self.command.ready_pattern.to_lowercase(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        tokio::spawn(supervisor.run(child, stdout, stderr, kill_rx, ready_tx));

        match tokio::time::timeout(self.command.startup_timeout(), ready_rx).await {
            Ok(Ok(())) => {
                log::info!("proxy: cluster {} ready on port {port}", self.cluster_id);
                Ok(())
            }
            Ok(Err(_)) => {
                let state = self.state.lock();
                if state.generation != generation {
                    return Err(Error::ProxyStopped);
                }
                Err(Error::ProxyStartup(state.last_error.clone().unwrap_or_else(|| {
                    "proxy exited before becoming ready".to_string()
                })))
            }
            Err(_) => {
                self.stop();
                Err(self.startup_failed(format!(
                    "proxy did not become ready within {}s",
                    self.command.startup_timeout().as_secs()
                )))
            }
        }
    }

    /// Kills the process, releases the port, deletes the credentials and
    /// forgets the cached target. Safe to call in any state.
    pub fn stop(&self) {
        let credentials = {
            let mut state = self.state.lock();
            state.generation += 1;
            if let Some(kill) = state.kill.take() {
                let _ = kill.send(());
                log::info!("proxy: stopping proxy for cluster {}", self.cluster_id);
            }
            state.clear()
        };
        if let Some(credentials) = credentials {
            credentials.remove();
        }
    }

    /// Routing target for a request. Ordinary requests share a cached target;
    /// watch requests always get a fresh one with the long timeout.
    pub fn get_target(&self, is_watch_request: bool) -> Result<ProxyTarget> {
        let mut state = self.state.lock();
        if state.phase != Phase::Running {
            return Err(Error::ProxyNotRunning);
        }
        let (Some(port), Some(server_url)) = (state.port, state.server_url.as_deref()) else {
            return Err(Error::ProxyNotRunning);
        };

        if is_watch_request {
            return Ok(ProxyTarget::resolve(port, server_url, self.timeouts.watch()));
        }

        if let Some(target) = &state.api_target {
            return Ok(target.clone());
        }
        let target = ProxyTarget::resolve(port, server_url, self.timeouts.request());
        state.api_target = Some(target.clone());
        Ok(target)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().phase == Phase::Running
    }

    /// Running or still starting.
    pub fn is_active(&self) -> bool {
        self.state.lock().phase != Phase::Stopped
    }

    pub fn port(&self) -> Option<u16> {
        self.state.lock().port
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn last_log_line(&self) -> Option<String> {
        self.state.lock().last_log_line.clone()
    }

    /// Number of processes spawned over this proxy's lifetime.
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    fn startup_failed(&self, reason: String) -> Error {
        log::warn!("proxy: cluster {}: {reason}", self.cluster_id);
        self.state.lock().last_error = Some(reason.clone());
        Error::ProxyStartup(reason)
    }
}

impl Drop for AuthProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Binds an ephemeral port on 127.0.0.1 and releases it for the proxy to take.
fn allocate_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Watches one spawned process until it exits or is killed.
struct Supervisor {
    cluster_id: ClusterId,
    generation: u64,
    spawn: u32,
    ready_pattern: String,
    state: Arc<Mutex<ProxyState>>,
    events: EventSender,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Child,
        stdout: ChildStdout,
        stderr: ChildStderr,
        mut kill_rx: oneshot::Receiver<()>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let mut ready_tx = Some(ready_tx);
        let mut out = BufReader::new(stdout).lines();
        let mut err = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;
        let mut stderr_tail: VecDeque<String> = VecDeque::new();

        let status = loop {
            tokio::select! {
                line = out.next_line(), if out_open => match line {
                    Ok(Some(line)) => self.on_line(&line, &mut ready_tx),
                    _ => out_open = false,
                },
                line = err.next_line(), if err_open => match line {
                    Ok(Some(line)) => {
                        self.on_line(&line, &mut ready_tx);
                        push_tail(&mut stderr_tail, line);
                    }
                    _ => err_open = false,
                },
                // Fires on stop() and when the owning AuthProxy is dropped
                _ = &mut kill_rx => {
                    let _ = child.kill().await;
                    log::debug!("proxy: cluster {} process killed", self.cluster_id);
                    return;
                }
                status = child.wait() => break status,
            }
        };

        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while err_open {
                match err.next_line().await {
                    Ok(Some(line)) => push_tail(&mut stderr_tail, line),
                    _ => err_open = false,
                }
            }
        })
        .await;

        let reason = exit_reason(status, &stderr_tail);
        let was_ready = ready_tx.is_none();

        let credentials = {
            let mut state = self.state.lock();
            if state.generation != self.generation {
                return;
            }
            state.last_error = Some(reason.clone());
            state.clear()
        };
        if let Some(credentials) = credentials {
            credentials.remove();
        }

        if was_ready {
            log::warn!("proxy: cluster {} {reason}", self.cluster_id);
            let _ = self.events.send(ClusterEvent::ProxyExited {
                id: self.cluster_id.clone(),
                spawn: self.spawn,
                reason,
            });
        } else {
            log::warn!("proxy: cluster {} failed to start: {reason}", self.cluster_id);
        }
        // Dropping the sender now wakes a pending ensure() with the recorded error
        drop(ready_tx);
    }

    fn on_line(&self, line: &str, ready_tx: &mut Option<oneshot::Sender<()>>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        log::debug!("proxy: [{}] {line}", self.cluster_id);

        let mut state = self.state.lock();
        if state.generation != self.generation {
            return;
        }
        state.last_log_line = Some(line.to_string());

        if ready_tx.is_some() && line.to_lowercase().contains(&self.ready_pattern) {
            state.phase = Phase::Running;
            drop(state);
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if line.trim().is_empty() {
        return;
    }
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn exit_reason(status: std::io::Result<ExitStatus>, stderr_tail: &VecDeque<String>) -> String {
    let mut reason = match status {
        Ok(status) => format!("proxy exited with {status}"),
        Err(e) => format!("proxy wait failed: {e}"),
    };

    if !stderr_tail.is_empty() {
        let joined = stderr_tail.iter().map(|l| l.trim()).collect::<Vec<_>>().join(" | ");
        reason.push_str(": ");
        reason.push_str(truncate_utf8(&joined, MAX_STDERR_BYTES));
    }
    reason
}

/// Longest prefix of `s` that fits `max` bytes without splitting a character.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
