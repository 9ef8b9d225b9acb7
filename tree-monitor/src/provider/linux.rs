//! Linux inotify provider.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use inotify::{EventStream, Inotify, WatchMask, Watches};
use tracing::{debug, trace};

use super::{RawEvent, WatchDescriptor, WatchProvider};
use crate::mask::EventMask;

/// Size of the kernel read buffer.
const EVENT_BUFFER_SIZE: usize = 64 * 1024;

/// Watch provider backed by a single inotify instance.
pub struct InotifyProvider {
    /// Handle used to add and remove watches.
    watches: Watches,

    /// Stream of kernel events.
    stream: EventStream<Vec<u8>>,

    /// Kernel descriptor to public descriptor.
    by_kernel: HashMap<inotify::WatchDescriptor, WatchDescriptor>,

    /// Public descriptor to kernel descriptor.
    by_id: HashMap<WatchDescriptor, inotify::WatchDescriptor>,

    /// Next public descriptor id.
    next_id: u64,
}

impl InotifyProvider {
    /// Create a new inotify instance.
    pub fn new() -> io::Result<Self> {
        let inotify = Inotify::init()?;
        let watches = inotify.watches();
        let stream = inotify.into_event_stream(vec![0; EVENT_BUFFER_SIZE])?;

        debug!("Initialized inotify provider");

        Ok(Self {
            watches,
            stream,
            by_kernel: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
        })
    }

    fn forget(&mut self, kernel: &inotify::WatchDescriptor) {
        if let Some(id) = self.by_kernel.remove(kernel) {
            self.by_id.remove(&id);
        }
    }
}

#[async_trait]
impl WatchProvider for InotifyProvider {
    fn name(&self) -> &str {
        "inotify"
    }

    fn add_watch(&mut self, path: &Path, mask: EventMask) -> io::Result<WatchDescriptor> {
        let kernel = self
            .watches
            .add(path, WatchMask::from_bits_truncate(mask.bits()))?;

        // The kernel hands back the existing descriptor for an inode it already watches.
        if let Some(id) = self.by_kernel.get(&kernel) {
            return Ok(*id);
        }

        let id = WatchDescriptor(self.next_id);
        self.next_id += 1;
        self.by_kernel.insert(kernel.clone(), id);
        self.by_id.insert(id, kernel);
        trace!("Added inotify watch {} for {}", id.id(), path.display());
        Ok(id)
    }

    fn remove_watch(&mut self, wd: WatchDescriptor) -> io::Result<()> {
        let kernel = self.by_id.remove(&wd).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown watch descriptor {}", wd.id()),
            )
        })?;
        self.by_kernel.remove(&kernel);
        self.watches.remove(kernel)
    }

    async fn next_event(&mut self) -> Option<io::Result<RawEvent>> {
        let event = match self.stream.next().await? {
            Ok(event) => event,
            Err(e) => return Some(Err(e)),
        };

        let mask = EventMask::from_bits_truncate(event.mask.bits());
        let wd = self.by_kernel.get(&event.wd).copied();

        // The kernel drops the watch itself after IGNORED.
        if mask.contains(EventMask::IGNORED) {
            self.forget(&event.wd);
        }

        Some(Ok(RawEvent {
            wd,
            mask,
            cookie: event.cookie,
            name: event.name,
            new_name: None,
        }))
    }
}
