//! Error types for the tree monitor.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors that can occur while walking or watching a tree.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Root directory not found.
    #[error("directory not found: {0}")]
    RootNotFound(String),

    /// Root is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid exclude pattern.
    #[error("invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Watch limit exceeded.
    #[error("watch limit exceeded: too many paths")]
    WatchLimitExceeded,

    /// A stat or listing failed during a walk.
    #[error("failed to walk {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// No watch provider exists for this platform.
    #[error("unsupported platform: {0}")]
    Unsupported(&'static str),

    /// The event loop task panicked or was aborted.
    #[error("monitor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl MonitorError {
    /// Classify an IO error raised while stat'ing the root of a walk.
    pub(crate) fn from_root_io(path: &std::path::Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::RootNotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(path.display().to_string())
            }
            _ => Self::Walk {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}
