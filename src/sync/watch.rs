//! Watches one kubeconfig file or directory and feeds every file revision
//! through the diff engine.
//!
//! Each watch runs a single event loop task. File reads run as separate tasks
//! and report back to the loop; a read is identified by a per-path generation
//! so that a result arriving after a newer change (or an unlink) is dropped.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::manager::ClusterManager;
use crate::models::catalog::CatalogEntity;
use crate::models::cluster::ClusterId;

use super::diff::{clear_source, compute_diff, SourceMap};

/// Outcome of processing one file revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    DiffApplied {
        path: PathBuf,
        added: usize,
        updated: usize,
        removed: usize,
    },
    DiffFailed {
        path: PathBuf,
        error: String,
    },
    /// The file is gone or unreadable; it contributes nothing until it returns
    FileMissing { path: PathBuf },
}

type Sources = Arc<Mutex<BTreeMap<PathBuf, SourceMap>>>;

/// A running watch. Dropping it stops the watch and removes everything it
/// contributed.
pub struct WatchHandle {
    root: PathBuf,
    manager: Arc<ClusterManager>,
    sources: Sources,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current entities of every context this watch tracks, read back from the
    /// catalog.
    pub fn entities(&self) -> Vec<CatalogEntity> {
        let catalog = self.manager.catalog();
        self.tracked_cluster_ids()
            .iter()
            .filter_map(|id| catalog.get(id))
            .collect()
    }

    pub fn tracked_cluster_ids(&self) -> Vec<ClusterId> {
        self.sources
            .lock()
            .values()
            .flat_map(|s| s.cluster_ids().cloned())
            .collect()
    }

    /// Parse error recorded for `path`, if its last revision failed.
    pub fn last_error(&self, path: &Path) -> Option<String> {
        self.sources.lock().get(path).and_then(|s| s.last_error.clone())
    }

    pub fn is_missing(&self, path: &Path) -> bool {
        self.sources.lock().get(path).is_some_and(|s| s.missing)
    }

    /// Stops watching, waits for the loop to finish and removes every cluster
    /// the watched files contributed.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        clear_sources(&self.manager, &self.sources);
        log::info!("sync: stopped watching {}", self.root.display());
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            clear_sources(&self.manager, &self.sources);
        }
    }
}

fn clear_sources(manager: &ClusterManager, sources: &Sources) {
    let mut sources = sources.lock();
    for source in sources.values_mut() {
        clear_source(manager, source);
    }
    sources.clear();
}

/// Starts watching `root`, a kubeconfig file or a directory of them.
///
/// The root does not have to exist. A missing file is picked up once it
/// appears; a root whose parent is missing too is waited for through its
/// nearest existing ancestor.
pub fn watch(
    root: PathBuf,
    manager: Arc<ClusterManager>,
    events: broadcast::Sender<SyncEvent>,
) -> Result<WatchHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    let sources: Sources = Arc::default();
    let mut watch_loop = WatchLoop::new(
        root.clone(),
        Arc::clone(&manager),
        Arc::clone(&sources),
        tx,
        events,
    );
    watch_loop.arm()?;
    let task = tokio::spawn(watch_loop.run(rx));

    Ok(WatchHandle {
        root,
        manager,
        sources,
        task: Some(task),
    })
}

/// How the root maps onto the directory the notify watcher is on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Layout {
    /// The root is a directory of kubeconfig files
    Dir,
    /// The root is one file, watched through its parent so editors that save
    /// by rename are seen
    File(OsString),
    /// The root's parent does not exist; an ancestor is watched until it does
    Pending,
}

/// Picks the directory to watch for `root` in its current on-disk shape.
fn resolve(root: &Path) -> Option<(PathBuf, Layout)> {
    if root.is_dir() {
        return Some((root.to_path_buf(), Layout::Dir));
    }
    let parent = match root.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = root.file_name()?.to_os_string();
    if parent.is_dir() {
        return Some((parent.to_path_buf(), Layout::File(name)));
    }
    parent
        .ancestors()
        .skip(1)
        .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
        .find(|p| p.is_dir())
        .map(|ancestor| (ancestor.to_path_buf(), Layout::Pending))
}

/// Re-arming gives up after this many layout changes in a row.
const MAX_ARM_ATTEMPTS: usize = 8;

enum WatchMsg {
    Fs(notify::Result<Event>),
    ReadDone {
        path: PathBuf,
        generation: u64,
        result: std::io::Result<String>,
    },
}

struct InFlightRead {
    generation: u64,
    task: JoinHandle<()>,
}

struct WatchLoop {
    root: PathBuf,
    /// Directory the watcher is on
    dir: PathBuf,
    layout: Layout,
    watcher: Option<RecommendedWatcher>,
    manager: Arc<ClusterManager>,
    sources: Sources,
    reads: HashMap<PathBuf, InFlightRead>,
    generations: HashMap<PathBuf, u64>,
    tx: mpsc::UnboundedSender<WatchMsg>,
    events: broadcast::Sender<SyncEvent>,
}

impl WatchLoop {
    fn new(
        root: PathBuf,
        manager: Arc<ClusterManager>,
        sources: Sources,
        tx: mpsc::UnboundedSender<WatchMsg>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let (dir, layout) = resolve(&root).unwrap_or_else(|| (root.clone(), Layout::Pending));
        Self {
            root,
            dir,
            layout,
            watcher: None,
            manager,
            sources,
            reads: HashMap::new(),
            generations: HashMap::new(),
            tx,
            events,
        }
    }

    /// Points the notify watcher at the directory the root currently resolves
    /// to. Repeats while the layout keeps changing underneath it.
    fn arm(&mut self) -> Result<()> {
        for _ in 0..MAX_ARM_ATTEMPTS {
            let (dir, layout) = resolve(&self.root).ok_or_else(|| {
                notify::Error::generic(&format!(
                    "no existing directory above {}",
                    self.root.display()
                ))
            })?;
            if self.watcher.is_some() && dir == self.dir && layout == self.layout {
                return Ok(());
            }

            self.watcher = None;
            let fs_tx = self.tx.clone();
            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                let _ = fs_tx.send(WatchMsg::Fs(res));
            })?;
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            self.watcher = Some(watcher);

            match &layout {
                Layout::Dir => log::info!("sync: watching directory {}", dir.display()),
                Layout::File(_) => log::info!("sync: watching {}", self.root.display()),
                Layout::Pending => log::info!(
                    "sync: {} does not exist yet, waiting in {}",
                    self.root.display(),
                    dir.display()
                ),
            }
            self.dir = dir;
            self.layout = layout;
        }
        Ok(())
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WatchMsg>) {
        self.initial_scan();

        while let Some(msg) = rx.recv().await {
            match msg {
                WatchMsg::Fs(Ok(event)) => self.on_fs_event(event),
                WatchMsg::Fs(Err(e)) => {
                    log::warn!("sync: watch error in {}: {e}", self.dir.display())
                }
                WatchMsg::ReadDone {
                    path,
                    generation,
                    result,
                } => {
                    self.on_read_done(path, generation, result);
                }
            }
        }
    }

    /// Reports every existing file as added.
    fn initial_scan(&mut self) {
        match &self.layout {
            Layout::File(name) => {
                let path = self.dir.join(name);
                if path.is_file() {
                    self.start_read(path);
                } else {
                    self.mark_missing(&path, "does not exist");
                }
            }
            Layout::Pending => {
                let root = self.root.clone();
                self.mark_missing(&root, "does not exist");
            }
            Layout::Dir => {
                let files = scan_kube_dir(&self.dir);
                log::info!(
                    "sync: {} candidate file(s) in {}",
                    files.len(),
                    self.dir.display()
                );
                for path in files {
                    self.start_read(path);
                }
            }
        }
    }

    fn on_fs_event(&mut self, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
        ) {
            return;
        }
        if self.layout_changed() {
            self.rearm();
            return;
        }
        for path in &event.paths {
            let Some(key) = self.source_key(path) else {
                continue;
            };
            if key.is_file() {
                self.start_read(key);
            } else if !key.exists() {
                self.unlink(&key);
            }
        }
    }

    /// Whether the root changed shape since the watcher was armed: the root
    /// directory appeared or went away, or a missing parent was created.
    fn layout_changed(&self) -> bool {
        match &self.layout {
            Layout::Dir => !self.root.is_dir(),
            Layout::File(_) => self.root.is_dir() || !self.dir.is_dir(),
            Layout::Pending => resolve(&self.root).map_or(true, |(dir, layout)| {
                dir != self.dir || layout != Layout::Pending
            }),
        }
    }

    /// Drops everything the old layout contributed, re-arms on the new one and
    /// scans it.
    fn rearm(&mut self) {
        for (path, read) in std::mem::take(&mut self.reads) {
            read.task.abort();
            self.next_generation(&path);
        }
        clear_sources(&self.manager, &self.sources);

        if let Err(e) = self.arm() {
            self.watcher = None;
            log::warn!("sync: cannot re-watch {}: {e}", self.root.display());
            return;
        }
        self.initial_scan();
    }

    /// Maps a path reported by the watcher to the source it belongs to, or
    /// `None` if it is not a file this watch cares about.
    fn source_key(&self, path: &Path) -> Option<PathBuf> {
        if path == self.dir {
            return None;
        }
        let name = path.file_name()?;
        match &self.layout {
            Layout::File(watched) => (name == watched.as_os_str()).then(|| self.dir.join(name)),
            Layout::Dir => {
                // Skip hidden files (.DS_Store, editor swap files, etc.)
                if name.to_string_lossy().starts_with('.') {
                    return None;
                }
                let key = self.dir.join(name);
                (!key.is_dir()).then_some(key)
            }
            Layout::Pending => None,
        }
    }

    /// Cancels any read of `path` in flight and starts a new one.
    fn start_read(&mut self, path: PathBuf) {
        let generation = self.next_generation(&path);
        if let Some(previous) = self.reads.remove(&path) {
            previous.task.abort();
            log::debug!("sync: superseded read of {}", path.display());
        }

        let tx = self.tx.clone();
        let read_path = path.clone();
        let task = tokio::spawn(async move {
            let result = tokio::fs::read_to_string(&read_path).await;
            let _ = tx.send(WatchMsg::ReadDone {
                path: read_path,
                generation,
                result,
            });
        });
        self.reads.insert(path, InFlightRead { generation, task });
    }

    /// Applies a finished read unless a newer change superseded it. Returns
    /// whether the result was used.
    fn on_read_done(
        &mut self,
        path: PathBuf,
        generation: u64,
        result: std::io::Result<String>,
    ) -> bool {
        match self.reads.get(&path) {
            Some(read) if read.generation == generation => {
                self.reads.remove(&path);
            }
            _ => {
                log::debug!(
                    "sync: discarding stale read of {} (generation {generation})",
                    path.display()
                );
                return false;
            }
        }

        let text = match result {
            Ok(text) => text,
            Err(e) => {
                self.mark_missing(&path, &e.to_string());
                return true;
            }
        };

        let event = {
            let mut sources = self.sources.lock();
            let source = sources.entry(path.clone()).or_default();
            match compute_diff(&self.manager, source, &path, &text) {
                Ok(summary) => {
                    log::info!(
                        "sync: {} applied (+{} ~{} -{})",
                        path.display(),
                        summary.added,
                        summary.updated,
                        summary.removed
                    );
                    SyncEvent::DiffApplied {
                        path,
                        added: summary.added,
                        updated: summary.updated,
                        removed: summary.removed,
                    }
                }
                Err(e) => SyncEvent::DiffFailed {
                    path,
                    error: e.to_string(),
                },
            }
        };
        let _ = self.events.send(event);
        true
    }

    /// The file went away: stop its read now and drop what it contributed.
    fn unlink(&mut self, path: &Path) {
        let had_read = self.reads.remove(path).map(|read| read.task.abort()).is_some();
        let tracked = self.sources.lock().contains_key(path);
        if !had_read && !tracked {
            return;
        }
        // results of reads started before the unlink are stale now
        self.next_generation(path);
        self.mark_missing(path, "removed");
    }

    fn mark_missing(&mut self, path: &Path, reason: &str) {
        let newly_missing = {
            let mut sources = self.sources.lock();
            let source = sources.entry(path.to_path_buf()).or_default();
            let removed = clear_source(&self.manager, source);
            if removed > 0 {
                log::info!(
                    "sync: {} {reason}, removed {removed} cluster(s)",
                    path.display()
                );
            } else {
                log::debug!("sync: {} {reason}", path.display());
            }
            !std::mem::replace(&mut source.missing, true)
        };
        if newly_missing {
            let _ = self.events.send(SyncEvent::FileMissing {
                path: path.to_path_buf(),
            });
        }
    }

    fn next_generation(&mut self, path: &Path) -> u64 {
        let counter = self.generations.entry(path.to_path_buf()).or_insert(0);
        *counter += 1;
        *counter
    }
}

impl Drop for WatchLoop {
    fn drop(&mut self) {
        for (_, read) in self.reads.drain() {
            read.task.abort();
        }
    }
}

/// Returns all regular, non-hidden files in `dir`, sorted alphabetically.
/// Skips subdirectories and any file whose name begins with '.'.
pub fn scan_kube_dir(dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("sync: cannot read directory {}: {e}", dir.display());
            return paths;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();

        // Skip subdirectories (cache/, http-cache/, etc.)
        if path.is_dir() {
            continue;
        }

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with('.') {
            continue;
        }

        paths.push(path);
    }

    // Deterministic ordering so logs are easy to follow
    paths.sort();
    paths
}
