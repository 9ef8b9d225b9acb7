//! Watch installation and raw event handling.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::event::{Action, EventKind, MonitorEvent, classify};
use crate::mask::{EventMask, WATCH_MASK};
use crate::provider::{RawEvent, WatchDescriptor, WatchProvider};
use crate::walker::{FileSet, WalkPolicy, walk_with_policy};

/// File set shared between the event loop and monitor handles.
pub type SharedFileSet = Arc<RwLock<FileSet>>;

/// `errno` reported when the per-user watch limit is exhausted.
const ENOSPC: i32 = 28;

/// A move-source waiting for its destination.
#[derive(Debug, Clone)]
struct PendingMove {
    source: PathBuf,
    event: RawEvent,
    since: Instant,
}

/// State kept for one active watch.
#[derive(Debug)]
struct WatchRecord {
    path: PathBuf,
    pending_moves: HashMap<u32, PendingMove>,
}

impl WatchRecord {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            pending_moves: HashMap::new(),
        }
    }
}

/// Keeps one watch per member path of a tree and classifies its raw events.
pub struct TreeWatcher<P> {
    /// Watch provider.
    provider: P,

    /// Root of the tree.
    root: PathBuf,

    /// Exclusion policy for walks and runtime events.
    policy: WalkPolicy,

    /// How long a move-source waits for its destination.
    move_timeout: Duration,

    /// Member paths.
    files: SharedFileSet,

    /// Per-watch records by descriptor.
    records: HashMap<WatchDescriptor, WatchRecord>,

    /// Descriptor by watched path.
    table: HashMap<PathBuf, WatchDescriptor>,
}

impl<P: WatchProvider> TreeWatcher<P> {
    /// Create a tree watcher. Nothing is watched until [`start`](Self::start).
    pub fn new(provider: P, config: &MonitorConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            provider,
            root: config.root.clone(),
            policy: WalkPolicy::new(&config.walk)?,
            move_timeout: config.move_timeout(),
            files: Arc::new(RwLock::new(FileSet::new())),
            records: HashMap::new(),
            table: HashMap::new(),
        })
    }

    /// Root of the tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared handle to the member paths.
    pub fn files(&self) -> SharedFileSet {
        self.files.clone()
    }

    /// How long a move-source waits for its destination.
    pub fn move_timeout(&self) -> Duration {
        self.move_timeout
    }

    /// Number of active watches.
    pub fn watch_count(&self) -> usize {
        self.records.len()
    }

    /// Whether `path` has an active watch.
    pub fn is_watched(&self, path: &Path) -> bool {
        self.table.contains_key(path)
    }

    /// Number of move-sources still waiting for a destination.
    pub fn pending_moves(&self) -> usize {
        self.records.values().map(|r| r.pending_moves.len()).sum()
    }

    /// Walk the tree and watch every path found.
    pub async fn start(&mut self) -> Result<()> {
        let files = walk_with_policy(&self.root, &self.policy).await?;
        self.install_all(files).await
    }

    /// Watch every path in `files`, root first, and make them the member set.
    ///
    /// A path that vanished or is unreadable is skipped and left out of the
    /// member set. Running out of watches is fatal.
    pub async fn install_all(&mut self, files: FileSet) -> Result<()> {
        let root = self.root.clone();
        let ordered = std::iter::once(root.clone())
            .chain(files.into_iter().filter(|path| *path != root))
            .collect::<Vec<_>>();

        let mut installed = FileSet::new();
        for path in ordered {
            match self.add(&path) {
                Ok(_) => {
                    installed.insert(path);
                }
                Err(e) if e.raw_os_error() == Some(ENOSPC) => {
                    return Err(MonitorError::WatchLimitExceeded);
                }
                Err(e)
                    if path != root
                        && matches!(
                            e.kind(),
                            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                        ) =>
                {
                    warn!("Skipping {}: {e}", path.display());
                }
                Err(e) => return Err(MonitorError::Io(e)),
            }
        }

        info!(
            "Watching {} paths under {} ({})",
            installed.len(),
            root.display(),
            self.provider.name()
        );
        *self.files.write().await = installed;
        Ok(())
    }

    /// Wait for the next raw event from the provider.
    pub async fn next_raw_event(&mut self) -> Option<io::Result<RawEvent>> {
        self.provider.next_event().await
    }

    /// Classify one raw event, updating watches and members.
    pub async fn handle(&mut self, event: RawEvent) -> Vec<MonitorEvent> {
        let mut out = Vec::new();

        let Some(wd) = event.wd else {
            if classify(event.mask) == Action::Other {
                warn!("Provider event without a watch: {:?}", event.mask);
                out.push(MonitorEvent::new(EventKind::Changed, self.root.clone(), event));
            }
            return out;
        };

        let Some(record) = self.records.get(&wd) else {
            trace!("Event for inactive watch {}: {:?}", wd.id(), event.mask);
            return out;
        };

        let watch_path = record.path.clone();
        let target = match &event.name {
            Some(name) => watch_path.join(name),
            None => watch_path.clone(),
        };

        if event.name.is_some() && self.excluded(&target) {
            trace!("Excluded event: {}", target.display());
            return out;
        }

        match classify(event.mask) {
            Action::Suppress => {}
            Action::Create { is_dir: false } => {
                if !is_member(&self.files, &target).await {
                    self.install(&target).await;
                    out.push(MonitorEvent::new(EventKind::Created, target, event));
                }
            }
            Action::Create { is_dir: true } => {
                self.discover(&watch_path, target, event, &mut out).await;
            }
            Action::Change => {
                if event.name.is_some() && self.table.contains_key(&target) {
                    trace!("Change reported by own watch: {}", target.display());
                } else {
                    out.push(MonitorEvent::new(EventKind::Changed, target, event));
                }
            }
            Action::Remove => {
                if self.prune(&target).await {
                    out.push(MonitorEvent::new(EventKind::Removed, target, event));
                }
            }
            Action::MoveSource => {
                if let Some(record) = self.records.get_mut(&wd) {
                    record.pending_moves.insert(
                        event.cookie,
                        PendingMove {
                            source: target,
                            event,
                            since: Instant::now(),
                        },
                    );
                }
            }
            Action::MoveDestination => {
                let Some(pending) = self.take_pending(wd, event.cookie) else {
                    trace!("Unmatched move destination: {}", target.display());
                    return out;
                };
                let mut merged = pending.event;
                merged.new_name = event.name;
                self.rekey(&pending.source, &target).await;
                out.push(
                    MonitorEvent::new(EventKind::Changed, pending.source, merged)
                        .with_new_path(target),
                );
            }
            Action::WatchRemoved => {
                if let Some(record) = self.records.remove(&wd) {
                    self.table.remove(&record.path);
                    trace!("Watch dropped by provider: {}", record.path.display());
                }
            }
            Action::Other => {
                out.push(MonitorEvent::new(EventKind::Changed, target, event));
            }
        }

        out
    }

    /// Report move-sources whose destination never arrived as removed.
    pub async fn evict_stale_moves(&mut self, now: Instant) -> Vec<MonitorEvent> {
        let timeout = self.move_timeout;
        let mut expired = Vec::new();

        for record in self.records.values_mut() {
            let stale = record
                .pending_moves
                .iter()
                .filter(|(_, pending)| now.saturating_duration_since(pending.since) >= timeout)
                .map(|(cookie, _)| *cookie)
                .collect::<Vec<_>>();
            for cookie in stale {
                if let Some(pending) = record.pending_moves.remove(&cookie) {
                    expired.push(pending);
                }
            }
        }

        let mut out = Vec::new();
        for pending in expired {
            debug!("Move left the tree: {}", pending.source.display());
            if self.prune(&pending.source).await {
                out.push(MonitorEvent::new(
                    EventKind::Removed,
                    pending.source,
                    pending.event,
                ));
            }
        }
        out
    }

    /// Remove every watch and release the provider.
    pub fn close(mut self) -> usize {
        let descriptors = self.records.keys().copied().collect::<Vec<_>>();
        for wd in &descriptors {
            if let Err(e) = self.provider.remove_watch(*wd) {
                debug!("Failed to remove watch {}: {e}", wd.id());
            }
        }
        self.records.clear();
        self.table.clear();

        info!(
            "Released {} watches on {} ({})",
            descriptors.len(),
            self.root.display(),
            self.provider.name()
        );
        descriptors.len()
    }

    /// Record the new directory and everything already inside it.
    async fn discover(
        &mut self,
        watch_dir: &Path,
        dir: PathBuf,
        event: RawEvent,
        out: &mut Vec<MonitorEvent>,
    ) {
        if is_member(&self.files, &dir).await {
            return;
        }

        self.install(&dir).await;
        out.push(MonitorEvent::new(EventKind::Created, dir.clone(), event.clone()));

        let policy = self.policy.rebased(self.depth(&dir));
        let found = match walk_with_policy(&dir, &policy).await {
            Ok(found) => found,
            Err(e) => {
                debug!("Could not enumerate new directory {}: {e}", dir.display());
                return;
            }
        };

        for path in found {
            if path == dir || is_member(&self.files, &path).await {
                continue;
            }
            self.install(&path).await;

            let mut raw = event.clone();
            raw.mask = if is_dir(&path).await {
                EventMask::CREATE | EventMask::ISDIR
            } else {
                EventMask::CREATE
            };
            raw.name = path
                .strip_prefix(watch_dir)
                .ok()
                .map(|rel| rel.as_os_str().to_os_string());
            out.push(MonitorEvent::new(EventKind::Created, path, raw));
        }
    }

    /// Watch a path discovered at runtime and make it a member.
    ///
    /// Membership is recorded even when the watch fails, so a later removal
    /// still pairs with the creation.
    async fn install(&mut self, path: &Path) -> bool {
        self.files.write().await.insert(path.to_path_buf());
        match self.add(path) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to watch {}, keeping it as a member: {e}", path.display());
                false
            }
        }
    }

    fn add(&mut self, path: &Path) -> io::Result<WatchDescriptor> {
        let wd = self.provider.add_watch(path, WATCH_MASK)?;
        if let Some(previous) = self.records.insert(wd, WatchRecord::new(path)) {
            if previous.path != path {
                self.table.remove(&previous.path);
            }
        }
        self.table.insert(path.to_path_buf(), wd);
        trace!("Watching {}", path.display());
        Ok(wd)
    }

    /// Best-effort watch removal. Failures are logged only.
    fn unwatch(&mut self, path: &Path) {
        let Some(wd) = self.table.remove(path) else {
            return;
        };
        self.records.remove(&wd);
        if let Err(e) = self.provider.remove_watch(wd) {
            debug!("Failed to remove watch for {}: {e}", path.display());
        }
    }

    /// Drop `path` and everything below it. Returns whether `path` was a member.
    async fn prune(&mut self, path: &Path) -> bool {
        let was_member = {
            let mut files = self.files.write().await;
            let was_member = files.remove(path);
            files.retain(|p| !p.starts_with(path));
            was_member
        };

        let watched = self
            .table
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect::<Vec<_>>();
        for p in watched {
            self.unwatch(&p);
        }

        was_member
    }

    /// Move members and watches from `from` (and below) to `to`.
    async fn rekey(&mut self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        // The destination may have been overwritten by the rename.
        self.prune(to).await;

        {
            let mut files = self.files.write().await;
            let moved = files
                .iter()
                .filter(|p| p.starts_with(from))
                .cloned()
                .collect::<Vec<_>>();
            for old in moved {
                files.remove(&old);
                files.insert(rebase(&old, from, to));
            }
        }

        let moved = self
            .table
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, wd)| (p.clone(), *wd))
            .collect::<Vec<_>>();
        for (old, wd) in moved {
            self.table.remove(&old);
            let new = rebase(&old, from, to);
            if let Some(record) = self.records.get_mut(&wd) {
                record.path = new.clone();
            }
            self.table.insert(new, wd);
        }
    }

    fn take_pending(&mut self, wd: WatchDescriptor, cookie: u32) -> Option<PendingMove> {
        if let Some(pending) = self
            .records
            .get_mut(&wd)
            .and_then(|r| r.pending_moves.remove(&cookie))
        {
            return Some(pending);
        }
        // Renames across directories report the source on another watch.
        self.records
            .values_mut()
            .find_map(|r| r.pending_moves.remove(&cookie))
    }

    /// Whether a runtime path falls outside the walk policy.
    fn excluded(&self, path: &Path) -> bool {
        self.policy.excludes_path(path) || !self.policy.within_depth(self.depth(path))
    }

    fn depth(&self, path: &Path) -> usize {
        path.strip_prefix(&self.root)
            .map(|rel| rel.components().count())
            .unwrap_or(0)
    }
}

fn rebase(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
        Ok(rest) => to.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

async fn is_member(files: &SharedFileSet, path: &Path) -> bool {
    files.read().await.contains(path)
}

async fn is_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
}
