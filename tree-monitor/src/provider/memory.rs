//! In-memory provider.
//!
//! Events are injected through a [`MemoryHandle`] instead of coming from the
//! kernel, which makes classification deterministic in tests and lets
//! embedders drive a monitor from their own event source.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{RawEvent, WatchDescriptor, WatchProvider};
use crate::mask::EventMask;

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    watches: BTreeMap<WatchDescriptor, PathBuf>,
    removed: Vec<PathBuf>,
    fail_removals: bool,
    fail_additions: bool,
}

/// Provider whose events are injected by a [`MemoryHandle`].
pub struct MemoryProvider {
    state: Arc<Mutex<MemoryState>>,
    rx: mpsc::UnboundedReceiver<RawEvent>,
}

/// Control side of a [`MemoryProvider`].
#[derive(Clone)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
    tx: mpsc::UnboundedSender<RawEvent>,
}

impl MemoryProvider {
    /// Create a provider and its control handle.
    pub fn new() -> (Self, MemoryHandle) {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                state: state.clone(),
                rx,
            },
            MemoryHandle { state, tx },
        )
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl WatchProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn add_watch(&mut self, path: &Path, _mask: EventMask) -> io::Result<WatchDescriptor> {
        let mut state = lock(&self.state);
        if state.fail_additions {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("watch refused for {}", path.display()),
            ));
        }
        if let Some((wd, _)) = state.watches.iter().find(|(_, p)| p.as_path() == path) {
            return Ok(*wd);
        }
        state.next_id += 1;
        let wd = WatchDescriptor(state.next_id);
        state.watches.insert(wd, path.to_path_buf());
        Ok(wd)
    }

    fn remove_watch(&mut self, wd: WatchDescriptor) -> io::Result<()> {
        let mut state = lock(&self.state);
        let path = state.watches.remove(&wd).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown watch descriptor {}", wd.id()),
            )
        })?;
        state.removed.push(path);
        if state.fail_removals {
            return Err(io::Error::other("simulated removal failure"));
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<io::Result<RawEvent>> {
        self.rx.recv().await.map(Ok)
    }
}

impl MemoryHandle {
    /// Descriptor of the watch on `path`, if any.
    pub fn descriptor(&self, path: &Path) -> Option<WatchDescriptor> {
        lock(&self.state)
            .watches
            .iter()
            .find(|(_, p)| p.as_path() == path)
            .map(|(wd, _)| *wd)
    }

    /// Paths with an active watch, in descriptor order.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        lock(&self.state).watches.values().cloned().collect()
    }

    /// Paths whose watches were removed, in removal order.
    pub fn removed_paths(&self) -> Vec<PathBuf> {
        lock(&self.state).removed.clone()
    }

    /// Make every later `remove_watch` report an error after dropping the watch.
    pub fn fail_removals(&self, fail: bool) {
        lock(&self.state).fail_removals = fail;
    }

    /// Make every later `add_watch` fail with a permission error.
    pub fn fail_additions(&self, fail: bool) {
        lock(&self.state).fail_additions = fail;
    }

    /// Inject a raw event. Returns false once the provider is gone.
    pub fn send(&self, event: RawEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Inject an event on the watch for `dir`, naming `name` inside it.
    ///
    /// Returns false when `dir` is not watched or the provider is gone.
    pub fn emit(
        &self,
        dir: &Path,
        mask: EventMask,
        name: Option<&str>,
        cookie: u32,
    ) -> bool {
        let Some(wd) = self.descriptor(dir) else {
            return false;
        };
        let mut event = RawEvent::new(wd, mask).with_cookie(cookie);
        event.name = name.map(OsString::from);
        self.send(event)
    }
}
