//! # Tree Monitor
//!
//! This crate provides recursive change notification for a directory tree.
//! It walks the tree, watches every path it finds, and turns the provider's
//! raw events into a small vocabulary of classified events.
//!
//! ## Features
//!
//! - **Concurrent Walking**: All stats and listings of a walk run concurrently
//! - **Per-path Watches**: One watch per member path, extended into new directories
//! - **Rename Merging**: Move-source and move-destination pairs become one `changed`
//! - **Exclusion Policy**: Dot files, glob patterns and custom filters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Tree Monitor                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  MonitorConfig ──► walk ──► TreeWatcher ──► MonitorEvent        │
//! │       │                         │               │               │
//! │       ▼                         ▼               ▼               │
//! │  WalkPolicy              WatchProvider    created/changed/      │
//! │                          (inotify)        removed channels      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod mask;
pub mod monitor;
pub mod provider;
pub mod walker;
pub mod watcher;

pub use config::{MonitorConfig, PathFilter, WalkOptions};
pub use error::{MonitorError, Result};
pub use event::{EventKind, MonitorEvent};
pub use mask::{EventMask, WATCH_MASK};
pub use monitor::Monitor;
#[cfg(target_os = "linux")]
pub use provider::linux::InotifyProvider;
pub use provider::memory::{MemoryHandle, MemoryProvider};
pub use provider::{RawEvent, WatchDescriptor, WatchProvider};
pub use walker::{FileSet, WalkContext, WalkPolicy, walk};
pub use watcher::TreeWatcher;
