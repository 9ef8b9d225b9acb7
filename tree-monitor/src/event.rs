//! Classified tree events.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mask::EventMask;
use crate::provider::RawEvent;

/// Kind of classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Path was created.
    Created,

    /// Path content, metadata or name changed.
    Changed,

    /// Path was removed.
    Removed,
}

impl EventKind {
    /// Channel name for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Changed => "changed",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified event on a monitored tree.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    /// The kind of event.
    pub kind: EventKind,

    /// Path to the affected file or directory.
    pub path: PathBuf,

    /// Destination path for a merged rename.
    pub new_path: Option<PathBuf>,

    /// Whether the provider reported a directory.
    pub is_dir: bool,

    /// The raw event, merged with its destination for renames.
    pub raw: RawEvent,

    /// When the event was classified.
    pub timestamp: DateTime<Utc>,
}

impl MonitorEvent {
    /// Create a new event.
    pub fn new(kind: EventKind, path: impl Into<PathBuf>, raw: RawEvent) -> Self {
        Self {
            kind,
            path: path.into(),
            new_path: None,
            is_dir: raw.mask.is_dir(),
            raw,
            timestamp: Utc::now(),
        }
    }

    /// Set the rename destination.
    pub fn with_new_path(mut self, new_path: impl Into<PathBuf>) -> Self {
        self.new_path = Some(new_path.into());
        self
    }
}

/// What a raw mask asks the tree watcher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Access, open and close-without-write activity.
    Suppress,
    /// An entry appeared.
    Create { is_dir: bool },
    /// Content or metadata changed.
    Change,
    /// An entry or the watched path itself disappeared.
    Remove,
    /// First half of a rename.
    MoveSource,
    /// Second half of a rename.
    MoveDestination,
    /// The provider dropped the watch.
    WatchRemoved,
    /// Anything else.
    Other,
}

/// Map raw mask bits to an action. Earlier rules win.
pub fn classify(mask: EventMask) -> Action {
    if mask.intersects(EventMask::ACCESS | EventMask::OPEN | EventMask::CLOSE_NOWRITE) {
        Action::Suppress
    } else if mask.contains(EventMask::CREATE) {
        Action::Create {
            is_dir: mask.is_dir(),
        }
    } else if mask.intersects(EventMask::MODIFY | EventMask::CLOSE_WRITE | EventMask::ATTRIB) {
        Action::Change
    } else if mask.intersects(EventMask::DELETE | EventMask::DELETE_SELF) {
        Action::Remove
    } else if mask.contains(EventMask::MOVED_FROM) {
        Action::MoveSource
    } else if mask.contains(EventMask::MOVED_TO) {
        Action::MoveDestination
    } else if mask.contains(EventMask::IGNORED) {
        Action::WatchRemoved
    } else {
        Action::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::WatchDescriptor;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classify_suppresses_access_noise() {
        assert_eq!(classify(EventMask::ACCESS), Action::Suppress);
        assert_eq!(classify(EventMask::OPEN | EventMask::ISDIR), Action::Suppress);
        assert_eq!(classify(EventMask::CLOSE_NOWRITE), Action::Suppress);
    }

    #[test]
    fn test_classify_create() {
        assert_eq!(
            classify(EventMask::CREATE),
            Action::Create { is_dir: false }
        );
        assert_eq!(
            classify(EventMask::CREATE | EventMask::ISDIR),
            Action::Create { is_dir: true }
        );
    }

    #[test]
    fn test_classify_changes_and_removals() {
        assert_eq!(classify(EventMask::MODIFY), Action::Change);
        assert_eq!(classify(EventMask::CLOSE_WRITE), Action::Change);
        assert_eq!(classify(EventMask::ATTRIB), Action::Change);
        assert_eq!(classify(EventMask::DELETE), Action::Remove);
        assert_eq!(classify(EventMask::DELETE_SELF), Action::Remove);
    }

    #[test]
    fn test_classify_moves_and_defaults() {
        assert_eq!(classify(EventMask::MOVED_FROM), Action::MoveSource);
        assert_eq!(classify(EventMask::MOVED_TO), Action::MoveDestination);
        assert_eq!(classify(EventMask::IGNORED), Action::WatchRemoved);
        assert_eq!(classify(EventMask::MOVE_SELF), Action::Other);
        assert_eq!(classify(EventMask::Q_OVERFLOW), Action::Other);
    }

    #[test]
    fn test_event_serializes_kind_as_channel_name() {
        let raw = RawEvent::new(WatchDescriptor(1), EventMask::CREATE | EventMask::ISDIR);
        let event = MonitorEvent::new(EventKind::Created, "/t/new", raw);

        assert!(event.is_dir);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "created");
        assert_eq!(json["path"], "/t/new");
        assert_eq!(EventKind::Removed.to_string(), "removed");
    }
}
