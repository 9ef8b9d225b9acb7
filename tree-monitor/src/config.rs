//! Configuration types for tree monitoring.

use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

/// Predicate deciding whether a walked entry is skipped.
///
/// Returning `true` excludes the path and, for directories, everything below it.
#[derive(Clone)]
pub struct PathFilter(Arc<dyn Fn(&Path, &Metadata) -> bool + Send + Sync>);

impl PathFilter {
    /// Wrap a closure as a filter.
    pub fn new(filter: impl Fn(&Path, &Metadata) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(filter))
    }

    /// Whether the entry should be skipped.
    pub fn excludes(&self, path: &Path, metadata: &Metadata) -> bool {
        (self.0)(path, metadata)
    }
}

impl fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PathFilter(..)")
    }
}

/// Options controlling which entries a walk visits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkOptions {
    /// Skip entries whose basename starts with `.`.
    pub ignore_dot_files: bool,

    /// Patterns to exclude (glob patterns, matched against the full path).
    pub exclude_patterns: Vec<String>,

    /// Maximum depth to recurse (None = unlimited). The root is depth 0.
    pub max_depth: Option<usize>,

    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,

    /// Custom exclusion predicate.
    #[serde(skip)]
    pub filter: Option<PathFilter>,
}

impl WalkOptions {
    /// Create options that visit everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip dot files and dot directories.
    pub fn ignore_dot_files(mut self) -> Self {
        self.ignore_dot_files = true;
        self
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Set the maximum depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Enable following symbolic links.
    pub fn follow_symlinks(mut self) -> Self {
        self.follow_symlinks = true;
        self
    }

    /// Set the exclusion predicate.
    pub fn with_filter(
        mut self,
        filter: impl Fn(&Path, &Metadata) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(PathFilter::new(filter));
        self
    }

    /// Compile the exclude patterns, rejecting invalid ones.
    pub fn compile_patterns(&self) -> Result<Vec<glob::Pattern>> {
        self.exclude_patterns
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern)
                    .map_err(|e| MonitorError::InvalidPattern(format!("{pattern}: {e}")))
            })
            .collect()
    }
}

/// Configuration for a monitored tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Root of the tree.
    pub root: PathBuf,

    /// Walk options, reused for directories discovered at runtime.
    #[serde(default)]
    pub walk: WalkOptions,

    /// How long an unmatched move-source waits for its destination.
    #[serde(default = "default_move_timeout_ms")]
    pub move_timeout_ms: u64,

    /// Capacity of each event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_move_timeout_ms() -> u64 {
    1000
}

fn default_channel_capacity() -> usize {
    1024
}

impl MonitorConfig {
    /// Create a new monitor config.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            walk: WalkOptions::default(),
            move_timeout_ms: default_move_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }

    /// Load a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the walk options.
    pub fn with_walk(mut self, walk: WalkOptions) -> Self {
        self.walk = walk;
        self
    }

    /// Set the move correlation timeout.
    pub fn with_move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Move correlation timeout as a duration.
    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }

    /// Check the config for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(MonitorError::Config(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.move_timeout_ms == 0 {
            return Err(MonitorError::Config(
                "move_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.walk.compile_patterns()?;
        Ok(())
    }
}
