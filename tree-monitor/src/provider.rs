//! Watch providers.
//!
//! A provider owns the kernel (or simulated) subscriptions. The tree watcher
//! only ever adds and removes single-path watches and pulls raw events.

use std::ffi::OsString;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde::{Serialize, Serializer};

use crate::mask::EventMask;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;

/// Opaque handle identifying one active watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WatchDescriptor(pub(crate) u64);

impl WatchDescriptor {
    /// Numeric id of the descriptor, unique within one provider.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Low-level notification delivered by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawEvent {
    /// Watch the event was reported on. `None` for provider-wide events
    /// such as a queue overflow.
    pub wd: Option<WatchDescriptor>,

    /// Event bits.
    pub mask: EventMask,

    /// Rename cookie; zero when the event is not part of a rename.
    pub cookie: u32,

    /// Name of the affected entry relative to the watched directory.
    #[serde(serialize_with = "serialize_name")]
    pub name: Option<OsString>,

    /// Destination name, set when a move-source is merged with its destination.
    #[serde(serialize_with = "serialize_name")]
    pub new_name: Option<OsString>,
}

impl RawEvent {
    /// Create an event on a watch.
    pub fn new(wd: WatchDescriptor, mask: EventMask) -> Self {
        Self {
            wd: Some(wd),
            mask,
            cookie: 0,
            name: None,
            new_name: None,
        }
    }

    /// Set the entry name.
    pub fn with_name(mut self, name: impl Into<OsString>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the rename cookie.
    pub fn with_cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }
}

fn serialize_name<S: Serializer>(
    name: &Option<OsString>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match name {
        Some(name) => serializer.serialize_some(&name.to_string_lossy()),
        None => serializer.serialize_none(),
    }
}

/// Source of per-path watches and raw events.
#[async_trait]
pub trait WatchProvider: Send {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Subscribe to events on a single path.
    fn add_watch(&mut self, path: &Path, mask: EventMask) -> io::Result<WatchDescriptor>;

    /// Cancel a subscription.
    fn remove_watch(&mut self, wd: WatchDescriptor) -> io::Result<()>;

    /// Wait for the next raw event. `None` means the provider is closed.
    async fn next_event(&mut self) -> Option<io::Result<RawEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_serializes_names_lossily() {
        let event = RawEvent::new(WatchDescriptor(3), EventMask::MOVED_FROM)
            .with_name("old.txt")
            .with_cookie(42);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "old.txt");
        assert_eq!(json["cookie"], 42);
        assert_eq!(json["wd"], 3);
        assert!(json["new_name"].is_null());
    }
}
