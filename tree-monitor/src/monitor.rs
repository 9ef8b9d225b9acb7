//! Monitor handle composing the walker, watcher and event channels.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::event::{EventKind, MonitorEvent};
use crate::provider::WatchProvider;
use crate::walker::FileSet;
use crate::watcher::{SharedFileSet, TreeWatcher};

/// Broadcast channels for classified events.
#[derive(Clone)]
struct EventChannels {
    created: broadcast::Sender<MonitorEvent>,
    changed: broadcast::Sender<MonitorEvent>,
    removed: broadcast::Sender<MonitorEvent>,
    all: broadcast::Sender<MonitorEvent>,
}

impl EventChannels {
    fn new(capacity: usize) -> Self {
        Self {
            created: broadcast::channel(capacity).0,
            changed: broadcast::channel(capacity).0,
            removed: broadcast::channel(capacity).0,
            all: broadcast::channel(capacity).0,
        }
    }

    fn sender(&self, kind: EventKind) -> &broadcast::Sender<MonitorEvent> {
        match kind {
            EventKind::Created => &self.created,
            EventKind::Changed => &self.changed,
            EventKind::Removed => &self.removed,
        }
    }

    fn emit(&self, event: MonitorEvent) {
        debug!("{} {}", event.kind, event.path.display());
        // Sending only fails when nobody is subscribed.
        let _ = self.sender(event.kind).send(event.clone());
        let _ = self.all.send(event);
    }
}

/// Handle to a running tree monitor.
///
/// Dropping the handle stops the event loop; [`stop`](Self::stop) also
/// reports how it ended.
pub struct Monitor {
    /// Root of the tree.
    root: PathBuf,

    /// Live member paths.
    files: SharedFileSet,

    /// Event channels.
    channels: EventChannels,

    /// Stops the event loop.
    shutdown: CancellationToken,

    /// Event loop task.
    task: Option<JoinHandle<Result<()>>>,
}

impl Monitor {
    /// Watch the tree described by `config` with the platform's provider.
    ///
    /// Resolves once every path found by the initial walk is watched.
    #[cfg(target_os = "linux")]
    pub async fn create(config: MonitorConfig) -> Result<Self> {
        let provider = crate::provider::linux::InotifyProvider::new()?;
        Self::with_provider(provider, config).await
    }

    /// Watch the tree described by `config` with the platform's provider.
    #[cfg(not(target_os = "linux"))]
    pub async fn create(_config: MonitorConfig) -> Result<Self> {
        Err(crate::error::MonitorError::Unsupported(
            "no kernel watch provider for this platform",
        ))
    }

    /// Watch `root` with default options.
    pub async fn watch(root: impl Into<PathBuf>) -> Result<Self> {
        Self::create(MonitorConfig::new(root)).await
    }

    /// Watch the tree described by `config` with a given provider.
    pub async fn with_provider<P>(provider: P, config: MonitorConfig) -> Result<Self>
    where
        P: WatchProvider + 'static,
    {
        let mut watcher = TreeWatcher::new(provider, &config)?;
        watcher.start().await?;

        let files = watcher.files();
        let channels = EventChannels::new(config.channel_capacity);
        let shutdown = CancellationToken::new();

        info!(
            "Monitor ready: {} ({} paths)",
            config.root.display(),
            files.read().await.len()
        );

        let task = tokio::spawn(run(watcher, channels.clone(), shutdown.clone()));

        Ok(Self {
            root: config.root,
            files,
            channels,
            shutdown,
            task: Some(task),
        })
    }

    /// Root of the tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the member paths.
    pub async fn files(&self) -> FileSet {
        self.files.read().await.clone()
    }

    /// Whether `path` is a member of the tree.
    pub async fn contains(&self, path: &Path) -> bool {
        self.files.read().await.contains(path)
    }

    /// Subscribe to events of one kind.
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<MonitorEvent> {
        self.channels.sender(kind).subscribe()
    }

    /// Subscribe to every event.
    pub fn events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.channels.all.subscribe()
    }

    /// Whether the event loop is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Remove every watch, release the provider and end the event loop.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown.cancel();
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run<P: WatchProvider>(
    mut watcher: TreeWatcher<P>,
    channels: EventChannels,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut sweep = tokio::time::interval(watcher.move_timeout());
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            _ = sweep.tick() => {
                for event in watcher.evict_stale_moves(Instant::now()).await {
                    channels.emit(event);
                }
            }
            next = watcher.next_raw_event() => match next {
                Some(Ok(raw)) => {
                    for event in watcher.handle(raw).await {
                        channels.emit(event);
                    }
                }
                Some(Err(e)) => {
                    error!("Watch provider failed: {e}");
                    break Err(e.into());
                }
                None => {
                    info!("Watch provider closed: {}", watcher.root().display());
                    break Ok(());
                }
            },
        }
    };

    watcher.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::EventMask;
    use crate::provider::memory::MemoryProvider;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn recv(rx: &mut broadcast::Receiver<MonitorEvent>) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_monitor_snapshot_ready_on_create() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("a.txt")).unwrap();
        let (provider, _handle) = MemoryProvider::new();

        let monitor = Monitor::with_provider(provider, MonitorConfig::new(temp_dir.path()))
            .await
            .unwrap();

        assert!(monitor.contains(&temp_dir.path().join("a.txt")).await);
        assert_eq!(monitor.files().await.len(), 2);
        assert!(monitor.is_running());
    }

    #[tokio::test]
    async fn test_monitor_routes_events_by_kind() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        File::create(root.join("a.txt")).unwrap();
        let (provider, handle) = MemoryProvider::new();
        let monitor = Monitor::with_provider(provider, MonitorConfig::new(root))
            .await
            .unwrap();

        let mut changed = monitor.subscribe(EventKind::Changed);
        let mut removed = monitor.subscribe(EventKind::Removed);
        let mut all = monitor.events();

        assert!(handle.emit(&root.join("a.txt"), EventMask::MODIFY, None, 0));
        assert!(handle.emit(root, EventMask::DELETE, Some("a.txt"), 0));

        assert_eq!(recv(&mut changed).await.path, root.join("a.txt"));
        assert_eq!(recv(&mut removed).await.path, root.join("a.txt"));
        assert_eq!(recv(&mut all).await.kind, EventKind::Changed);
        assert_eq!(recv(&mut all).await.kind, EventKind::Removed);
        assert!(!monitor.contains(&root.join("a.txt")).await);
    }

    #[tokio::test]
    async fn test_stop_removes_every_watch() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("a.txt")).unwrap();
        let (provider, handle) = MemoryProvider::new();
        let monitor = Monitor::with_provider(provider, MonitorConfig::new(temp_dir.path()))
            .await
            .unwrap();
        assert_eq!(handle.watched_paths().len(), 2);

        monitor.stop().await.unwrap();

        assert!(handle.watched_paths().is_empty());
        assert!(!handle.send(crate::provider::RawEvent::new(
            crate::provider::WatchDescriptor(1),
            EventMask::MODIFY,
        )));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_error_prevents_installation() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(root.join("x"), root.join("x")).unwrap();
        let (provider, handle) = MemoryProvider::new();
        let config = MonitorConfig::new(root)
            .with_walk(crate::config::WalkOptions::new().follow_symlinks());

        let result = Monitor::with_provider(provider, config).await;

        assert!(matches!(
            result,
            Err(crate::error::MonitorError::Walk { .. })
        ));
        assert!(handle.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_fails_creation() {
        let (provider, _handle) = MemoryProvider::new();
        let result =
            Monitor::with_provider(provider, MonitorConfig::new("/nonexistent/path/12345")).await;
        assert!(result.is_err());
    }
}
