//! Concurrent recursive tree walking.
//!
//! A walk stats every child of every directory concurrently inside a single
//! task. Outstanding probes are counted by a [`WalkContext`]; the walk ends
//! exactly once, when the last probe completes or the first fatal error is
//! seen.

use std::collections::{BTreeSet, HashSet};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::fs;
use tracing::{debug, trace};

use crate::config::{PathFilter, WalkOptions};
use crate::error::{MonitorError, Result};

/// Set of member paths of a tree.
pub type FileSet = BTreeSet<PathBuf>;

/// Compiled exclusion policy shared by walks and runtime events.
#[derive(Debug, Clone)]
pub struct WalkPolicy {
    ignore_dot_files: bool,
    patterns: Vec<glob::Pattern>,
    filter: Option<PathFilter>,
    max_depth: Option<usize>,
    follow_symlinks: bool,
}

impl WalkPolicy {
    /// Compile walk options.
    pub fn new(options: &WalkOptions) -> Result<Self> {
        Ok(Self {
            ignore_dot_files: options.ignore_dot_files,
            patterns: options.compile_patterns()?,
            filter: options.filter.clone(),
            max_depth: options.max_depth,
            follow_symlinks: options.follow_symlinks,
        })
    }

    /// Whether a path is excluded by name alone.
    ///
    /// Used for runtime events, where no metadata is at hand.
    pub fn excludes_path(&self, path: &Path) -> bool {
        if self.ignore_dot_files
            && path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with('.'))
        {
            return true;
        }

        let path_str = path.to_string_lossy();
        self.patterns.iter().any(|p| p.matches(&path_str))
    }

    /// Whether a walked entry is excluded.
    pub fn excludes(&self, path: &Path, metadata: &Metadata) -> bool {
        self.excludes_path(path)
            || self
                .filter
                .as_ref()
                .is_some_and(|filter| filter.excludes(path, metadata))
    }

    /// Whether an entry at `depth` below the walk root is kept.
    pub fn within_depth(&self, depth: usize) -> bool {
        self.max_depth.is_none_or(|max| depth <= max)
    }

    /// Policy for walking a subtree whose root sits at `depth`.
    pub fn rebased(&self, depth: usize) -> Self {
        Self {
            max_depth: self.max_depth.map(|max| max.saturating_sub(depth)),
            ..self.clone()
        }
    }

    fn descends(&self, depth: usize) -> bool {
        self.max_depth.is_none_or(|max| depth < max)
    }
}

/// Per-walk state: the result set and the count of outstanding probes.
#[derive(Debug)]
pub struct WalkContext {
    files: FileSet,
    visited: HashSet<PathBuf>,
    pending: usize,
    finished: bool,
}

impl WalkContext {
    /// Start a walk whose result already contains `root`.
    pub fn new(root: &Path) -> Self {
        let mut files = FileSet::new();
        files.insert(root.to_path_buf());
        Self {
            files,
            visited: HashSet::new(),
            pending: 0,
            finished: false,
        }
    }

    /// Record one more outstanding probe.
    pub fn schedule(&mut self) {
        self.pending += 1;
    }

    /// Record a finished probe.
    ///
    /// Returns true exactly once: on the completion that brings the counter
    /// back to zero. Follow-up probes must be scheduled before the probe that
    /// produced them is completed.
    pub fn complete(&mut self) -> bool {
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 && !self.finished {
            self.finished = true;
            return true;
        }
        false
    }

    /// Number of outstanding probes.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Whether the walk has produced its result.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Add a member path.
    pub fn insert(&mut self, path: PathBuf) {
        self.files.insert(path);
    }

    /// Consume the context, yielding the result set.
    pub fn into_files(self) -> FileSet {
        self.files
    }
}

enum Probe {
    Listed {
        dir: PathBuf,
        depth: usize,
        canonical: Option<PathBuf>,
        result: io::Result<Vec<PathBuf>>,
    },
    Stat {
        path: PathBuf,
        depth: usize,
        result: io::Result<Metadata>,
    },
}

fn list(dir: PathBuf, depth: usize, canonicalize: bool) -> BoxFuture<'static, Probe> {
    Box::pin(async move {
        let canonical = if canonicalize {
            fs::canonicalize(&dir).await.ok()
        } else {
            None
        };
        let result = read_children(&dir).await;
        Probe::Listed {
            dir,
            depth,
            canonical,
            result,
        }
    })
}

fn stat(path: PathBuf, depth: usize, follow: bool) -> BoxFuture<'static, Probe> {
    Box::pin(async move {
        let result = if follow {
            fs::metadata(&path).await
        } else {
            fs::symlink_metadata(&path).await
        };
        Probe::Stat {
            path,
            depth,
            result,
        }
    })
}

async fn read_children(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        children.push(entry.path());
    }
    Ok(children)
}

/// Enumerate `root` and everything reachable below it.
pub async fn walk(root: &Path, options: &WalkOptions) -> Result<FileSet> {
    let policy = WalkPolicy::new(options)?;
    walk_with_policy(root, &policy).await
}

/// Enumerate `root` using an already compiled policy.
pub async fn walk_with_policy(root: &Path, policy: &WalkPolicy) -> Result<FileSet> {
    let metadata = if policy.follow_symlinks {
        fs::metadata(root).await
    } else {
        fs::symlink_metadata(root).await
    }
    .map_err(|e| MonitorError::from_root_io(root, e))?;

    if !metadata.is_dir() {
        return Err(MonitorError::NotADirectory(root.display().to_string()));
    }

    let mut ctx = WalkContext::new(root);
    let mut probes = FuturesUnordered::new();

    // A directory is listed only when its children are within depth.
    if policy.descends(0) {
        ctx.schedule();
        probes.push(list(root.to_path_buf(), 0, policy.follow_symlinks));
    }

    while let Some(probe) = probes.next().await {
        match probe {
            Probe::Listed {
                dir,
                depth,
                canonical,
                result,
            } => match result {
                Ok(children) => {
                    let first_visit = canonical.is_none_or(|c| ctx.visited.insert(c));
                    if first_visit {
                        for child in children {
                            ctx.schedule();
                            probes.push(stat(child, depth + 1, policy.follow_symlinks));
                        }
                    } else {
                        debug!("Skipping already visited directory: {}", dir.display());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && dir != root => {
                    trace!("Directory vanished before listing: {}", dir.display());
                }
                Err(e) => return Err(MonitorError::Walk { path: dir, source: e }),
            },
            Probe::Stat {
                path,
                depth,
                result,
            } => match result {
                Ok(metadata) => {
                    if policy.excludes(&path, &metadata) {
                        trace!("Excluded: {}", path.display());
                    } else {
                        if metadata.is_dir() && policy.descends(depth) {
                            ctx.schedule();
                            probes.push(list(path.clone(), depth, policy.follow_symlinks));
                        }
                        ctx.insert(path);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    trace!("Entry vanished before stat: {}", path.display());
                }
                Err(e) => return Err(MonitorError::Walk { path, source: e }),
            },
        }

        if ctx.complete() {
            break;
        }
    }

    debug!("Walked {} ({} entries)", root.display(), ctx.files.len());
    Ok(ctx.into_files())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::{self as stdfs, File};
    use std::io::Write;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mut f = File::create(root.join("a.txt")).unwrap();
        writeln!(f, "Hello").unwrap();
        stdfs::create_dir_all(root.join("src/nested")).unwrap();
        File::create(root.join("src/main.rs")).unwrap();
        File::create(root.join("src/nested/deep.rs")).unwrap();
        stdfs::create_dir(root.join(".git")).unwrap();
        File::create(root.join(".git/config")).unwrap();
        File::create(root.join(".env")).unwrap();

        temp_dir
    }

    fn set(root: &Path, rel: &[&str]) -> FileSet {
        let mut files: FileSet = rel.iter().map(|r| root.join(r)).collect();
        files.insert(root.to_path_buf());
        files
    }

    #[test]
    fn test_context_completes_once() {
        let mut ctx = WalkContext::new(Path::new("/t"));
        ctx.schedule();
        ctx.schedule();

        assert!(!ctx.complete());
        assert!(ctx.complete());
        assert!(ctx.is_finished());
        assert!(!ctx.complete());
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn test_context_follow_ups_scheduled_before_completion() {
        let mut ctx = WalkContext::new(Path::new("/t"));

        // Root listing.
        ctx.schedule();
        // It discovers one child, scheduled before the listing completes.
        ctx.schedule();
        assert!(!ctx.complete());
        // The child is a directory: its listing is scheduled before its stat completes.
        ctx.schedule();
        assert!(!ctx.complete());
        assert_eq!(ctx.pending(), 1);
        assert!(ctx.complete());
    }

    #[tokio::test]
    async fn test_walk_full_tree() {
        let temp_dir = tree();
        let root = temp_dir.path();

        let files = walk(root, &WalkOptions::new()).await.unwrap();

        assert_eq!(
            files,
            set(
                root,
                &[
                    "a.txt",
                    "src",
                    "src/main.rs",
                    "src/nested",
                    "src/nested/deep.rs",
                    ".git",
                    ".git/config",
                    ".env",
                ]
            )
        );
    }

    #[tokio::test]
    async fn test_walk_is_stable() {
        let temp_dir = tree();
        let first = walk(temp_dir.path(), &WalkOptions::new()).await.unwrap();
        let second = walk(temp_dir.path(), &WalkOptions::new()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_walk_ignores_dot_files_and_their_subtrees() {
        let temp_dir = tree();
        let root = temp_dir.path();

        let files = walk(root, &WalkOptions::new().ignore_dot_files())
            .await
            .unwrap();

        assert_eq!(
            files,
            set(
                root,
                &["a.txt", "src", "src/main.rs", "src/nested", "src/nested/deep.rs"]
            )
        );
    }

    #[tokio::test]
    async fn test_walk_filter_excludes_subtree() {
        let temp_dir = tree();
        let root = temp_dir.path();
        let excluded = root.join("src/nested");

        let options = WalkOptions::new().with_filter(move |path, _| path == excluded);
        let files = walk(root, &options).await.unwrap();

        assert!(files.contains(&root.join("src/main.rs")));
        assert!(!files.contains(&root.join("src/nested")));
        assert!(!files.contains(&root.join("src/nested/deep.rs")));
    }

    #[tokio::test]
    async fn test_walk_filter_sees_metadata() {
        let temp_dir = tree();
        let root = temp_dir.path();

        let options = WalkOptions::new().with_filter(|_, metadata| metadata.is_file());
        let files = walk(root, &options).await.unwrap();

        assert_eq!(files, set(root, &["src", "src/nested", ".git"]));
    }

    #[tokio::test]
    async fn test_walk_exclude_patterns() {
        let temp_dir = tree();
        let root = temp_dir.path();

        let files = walk(root, &WalkOptions::new().exclude("**/*.rs"))
            .await
            .unwrap();

        assert!(files.contains(&root.join("src/nested")));
        assert!(!files.contains(&root.join("src/main.rs")));
        assert!(!files.contains(&root.join("src/nested/deep.rs")));
    }

    #[tokio::test]
    async fn test_walk_max_depth() {
        let temp_dir = tree();
        let root = temp_dir.path();

        let files = walk(root, &WalkOptions::new().with_max_depth(1).ignore_dot_files())
            .await
            .unwrap();

        assert_eq!(files, set(root, &["a.txt", "src"]));
    }

    #[tokio::test]
    async fn test_walk_max_depth_zero_keeps_only_root() {
        let temp_dir = tree();
        let root = temp_dir.path();

        let files = walk(root, &WalkOptions::new().with_max_depth(0))
            .await
            .unwrap();

        assert_eq!(files, set(root, &[]));
    }

    #[tokio::test]
    async fn test_walk_rebased_policy_stops_at_tree_depth() {
        let temp_dir = tree();
        let root = temp_dir.path();
        let policy = WalkPolicy::new(&WalkOptions::new().with_max_depth(1)).unwrap();

        let files = walk_with_policy(&root.join("src"), &policy.rebased(1))
            .await
            .unwrap();

        assert_eq!(files, set(&root.join("src"), &[]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_fails_on_unreadable_entry() {
        let temp_dir = tree();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(root.join("src/x"), root.join("src/x")).unwrap();

        let result = walk(root, &WalkOptions::new().follow_symlinks()).await;

        match result {
            Err(MonitorError::Walk { path, .. }) => assert_eq!(path, root.join("src/x")),
            other => panic!("expected a walk error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_skips_entry_gone_before_stat() {
        let temp_dir = tree();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(root.join("missing"), root.join("src/dangling")).unwrap();

        let files = walk(root, &WalkOptions::new().follow_symlinks())
            .await
            .unwrap();

        assert!(files.contains(&root.join("src/main.rs")));
        assert!(!files.contains(&root.join("src/dangling")));
    }

    #[tokio::test]
    async fn test_walk_skips_directory_gone_before_listing() {
        let temp_dir = tree();
        let root = temp_dir.path();

        // Removes `src/nested` after its stat, before it is listed.
        let options = WalkOptions::new().with_filter(|path, _| {
            if path.ends_with("src/nested") {
                stdfs::remove_dir_all(path).unwrap();
            }
            false
        });
        let files = walk(root, &options).await.unwrap();

        assert!(files.contains(&root.join("src/main.rs")));
        assert!(!files.contains(&root.join("src/nested/deep.rs")));
    }

    #[tokio::test]
    async fn test_walk_empty_root() {
        let temp_dir = TempDir::new().unwrap();
        let files = walk(temp_dir.path(), &WalkOptions::new()).await.unwrap();
        assert_eq!(files, set(temp_dir.path(), &[]));
    }

    #[tokio::test]
    async fn test_walk_missing_root() {
        let result = walk(Path::new("/nonexistent/path/12345"), &WalkOptions::new()).await;
        assert!(matches!(result, Err(MonitorError::RootNotFound(_))));
    }

    #[tokio::test]
    async fn test_walk_file_root() {
        let temp_dir = tree();
        let result = walk(&temp_dir.path().join("a.txt"), &WalkOptions::new()).await;
        assert!(matches!(result, Err(MonitorError::NotADirectory(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_symlink_cycle_terminates() {
        let temp_dir = tree();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(root, root.join("src/loop")).unwrap();

        let files = walk(root, &WalkOptions::new().follow_symlinks())
            .await
            .unwrap();
        assert!(files.contains(&root.join("src/loop")));

        let files = walk(root, &WalkOptions::new()).await.unwrap();
        assert!(files.contains(&root.join("src/loop")));
        assert!(!files.contains(&root.join("src/loop/a.txt")));
    }
}
