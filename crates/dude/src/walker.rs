use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::progress::Reporter;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub files: u64,
    pub errors: u64,
}

impl WalkStats {
    fn merge(&mut self, other: WalkStats) {
        self.files += other.files;
        self.errors += other.errors;
    }
}

/// Enumerates regular files under a root into a [`Registry`].
///
/// Symlinks and directories are never registered. Unreadable entries are
/// reported and skipped without aborting the walk.
#[derive(Clone)]
pub struct Walker {
    /// Paths that must never be registered, e.g. the cache database itself
    exclude: Arc<Vec<PathBuf>>,
    reporter: Reporter,
    cancelled: Arc<AtomicBool>,
}

impl Walker {
    pub fn new(exclude: Vec<PathBuf>, reporter: Reporter, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            exclude: Arc::new(exclude),
            reporter,
            cancelled,
        }
    }

    /// Walk one root on the calling thread
    pub fn walk(&self, root: &Path, registry: &Registry) -> WalkStats {
        let mut stats = WalkStats::default();

        for entry in WalkDir::new(root).follow_links(false) {
            if self.cancelled.load(Ordering::Relaxed) {
                debug!(root = %root.display(), "walk cancelled");
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    stats.errors += 1;
                    let path = e.path().unwrap_or(root).to_path_buf();
                    self.reporter.skipped(&path, e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if self.exclude.iter().any(|excluded| excluded == entry.path()) {
                debug!(path = %entry.path().display(), "excluded from walk");
                continue;
            }

            // The cache and the results file key on UTF-8 paths
            if entry.path().to_str().is_none() {
                stats.errors += 1;
                self.reporter.skipped(entry.path(), "path is not valid UTF-8");
                continue;
            }

            if registry.insert(entry.into_path()) {
                stats.files += 1;
                self.reporter.discovered();
            }
        }

        stats
    }

    /// Walk every `(root, registry)` pair concurrently and wait for all of them
    pub async fn walk_all(&self, jobs: Vec<(PathBuf, Arc<Registry>)>) -> Result<WalkStats> {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|(root, registry)| {
                let walker = self.clone();
                tokio::task::spawn_blocking(move || {
                    let stats = walker.walk(&root, &registry);
                    info!(root = %root.display(), files = stats.files, errors = stats.errors, "walk finished");
                    stats
                })
            })
            .collect();

        let mut total = WalkStats::default();
        for handle in handles {
            total.merge(handle.await.context("Walk task panicked")?);
        }
        Ok(total)
    }
}
