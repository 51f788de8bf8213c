use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::db::CacheRecord;
use crate::digest::{fingerprint_file, Fingerprint};
use crate::progress::Reporter;
use crate::queue::CacheSender;
use crate::registry::{format_mod_time, Registry};

/// Cache contents as loaded at the start of a run
pub type CacheSnapshot = HashMap<PathBuf, CacheRecord>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashStats {
    /// Digests computed by reading file content
    pub fresh: u64,
    /// Digests reused from the cache snapshot
    pub cached: u64,
    /// Entries that could not be stat'ed or read
    pub skipped: u64,
}

impl HashStats {
    pub fn merge(&mut self, other: HashStats) {
        self.fresh += other.fresh;
        self.cached += other.cached;
        self.skipped += other.skipped;
    }
}

/// Result of processing one entry
#[derive(Debug)]
struct Hashed {
    record: CacheRecord,
    cached: bool,
}

/// Bounded pool that gives every registry entry a digest exactly once.
///
/// At most `workers` entries are in flight; the rest wait on a semaphore
/// instead of piling up as spawned tasks.
#[derive(Clone)]
pub struct HasherPool {
    workers: usize,
    fingerprint: Arc<dyn Fingerprint>,
    snapshot: Arc<CacheSnapshot>,
    reporter: Reporter,
    cancelled: Arc<AtomicBool>,
}

impl HasherPool {
    pub fn new(
        workers: usize,
        fingerprint: Arc<dyn Fingerprint>,
        snapshot: Arc<CacheSnapshot>,
        reporter: Reporter,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            fingerprint,
            snapshot,
            reporter,
            cancelled,
        }
    }

    /// Hash every entry of `registry`, emitting one record per entry on `sender`.
    ///
    /// `sender` is dropped when the last worker finishes, which deregisters
    /// this pool from the persistence queue.
    pub async fn run(&self, registry: Arc<Registry>, sender: CacheSender) -> Result<HashStats> {
        let sender = Arc::new(sender);
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let aborted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        let paths = registry.paths();
        info!(files = paths.len(), workers = self.workers, digest = self.fingerprint.name(), "hashing");

        for path in paths {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("Hasher semaphore closed")?;

            if self.cancelled.load(Ordering::Relaxed) || aborted.load(Ordering::Relaxed) {
                break;
            }

            let pool = self.clone();
            let registry = Arc::clone(&registry);
            let sender = Arc::clone(&sender);
            let aborted = Arc::clone(&aborted);
            tasks.spawn(async move {
                let _permit = permit;
                let result = pool.process(path, &registry, &sender).await;
                if result.is_err() {
                    aborted.store(true, Ordering::Relaxed);
                }
                result
            });
        }

        let mut stats = HashStats::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.context("Hash worker panicked")? {
                Ok(Some(true)) => stats.cached += 1,
                Ok(Some(false)) => stats.fresh += 1,
                Ok(None) => stats.skipped += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(sender);

        if let Some(e) = first_error {
            return Err(e);
        }
        if self.cancelled.load(Ordering::Relaxed) {
            bail!("Hashing cancelled");
        }

        debug!(fresh = stats.fresh, cached = stats.cached, skipped = stats.skipped, "hasher pool finished");
        Ok(stats)
    }

    /// Returns `Some(cached)` on success and `None` when the file was skipped
    async fn process(
        &self,
        path: PathBuf,
        registry: &Registry,
        sender: &CacheSender,
    ) -> Result<Option<bool>> {
        let snapshot = Arc::clone(&self.snapshot);
        let fingerprint = Arc::clone(&self.fingerprint);
        let job_path = path.clone();
        let hashed = tokio::task::spawn_blocking(move || {
            hash_entry(&job_path, &snapshot, fingerprint.as_ref())
        })
        .await
        .context("Hash job panicked")?;

        let Hashed { record, cached } = match hashed {
            Ok(hashed) => hashed,
            Err(e) => {
                self.reporter.skipped(&path, e);
                return Ok(None);
            }
        };

        registry.record_digest(
            &record.path,
            record.size,
            record.modified_at.clone(),
            record.digest.clone(),
        );
        sender.send(record).await?;
        self.reporter.hashed(cached);
        Ok(Some(cached))
    }
}

/// Stat `path` and either reuse the snapshot's digest or stream the content
fn hash_entry(
    path: &Path,
    snapshot: &CacheSnapshot,
    fingerprint: &dyn Fingerprint,
) -> io::Result<Hashed> {
    let metadata = fs::metadata(path)?;
    let size = metadata.len();
    let modified_at = format_mod_time(metadata.modified()?);

    if let Some(known) = snapshot.get(path) {
        if known.is_fresh(size, &modified_at) {
            return Ok(Hashed {
                record: known.clone(),
                cached: true,
            });
        }
    }

    let digest = fingerprint_file(fingerprint, path)?;
    Ok(Hashed {
        record: CacheRecord {
            path: path.to_path_buf(),
            digest,
            size,
            modified_at,
        },
        cached: false,
    })
}
