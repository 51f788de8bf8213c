//! One duplicate-finding run: walk, hash, persist, match, verify, report.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::db::{Database, PersistStats, PersistenceActor};
use crate::digest::Fingerprint;
use crate::hasher::{HashStats, HasherPool};
use crate::matcher::{find_cross_duplicates, find_duplicates, DuplicateGroup};
use crate::params::ExecutionParams;
use crate::progress::Reporter;
use crate::registry::Registry;
use crate::report;
use crate::verify::{Verifier, VerifyMode};
use crate::walker::Walker;

/// What a finished run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub files_discovered: u64,
    pub fresh_hashes: u64,
    pub cache_hits: u64,
    pub skipped: u64,
    /// Enqueue attempts that found the persistence queue full
    pub queue_send_failures: u64,
    pub persisted: PersistStats,
    pub duplicate_groups: usize,
    pub duplicate_pairs: usize,
    /// Digest-equal pairs dropped by paranoid verification
    pub rejected_collisions: u64,
    /// Set when a results file was written
    pub results_path: Option<PathBuf>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn found_duplicates(&self) -> bool {
        self.duplicate_groups > 0
    }
}

pub struct Pipeline {
    params: ExecutionParams,
    fingerprint: Arc<dyn Fingerprint>,
    reporter: Reporter,
    cancelled: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(params: ExecutionParams) -> Self {
        Self {
            fingerprint: params.digest.into_fingerprint(),
            params,
            reporter: Reporter::silent(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the digest implied by the parameters
    pub fn with_fingerprint(mut self, fingerprint: Arc<dyn Fingerprint>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let params = &self.params;
        info!(
            source = %params.source_root.display(),
            target = ?params.target_root.as_ref().map(|t| t.display().to_string()),
            workers = params.workers,
            paranoid = params.paranoid,
            digest = self.fingerprint.name(),
            "starting run"
        );

        let db = Database::new(params.cache_path())
            .await
            .context("Failed to open fingerprint cache")?;
        let snapshot = Arc::new(db.load_snapshot().await?);
        debug!(records = snapshot.len(), "loaded cache snapshot");

        let (queue, actor) = PersistenceActor::spawn(db, params.buffer_size, params.retry);
        let metrics = queue.metrics();

        let source = Arc::new(Registry::new());
        let target = params.target_root.as_ref().map(|_| Arc::new(Registry::new()));

        let mut jobs = vec![(params.source_root.clone(), Arc::clone(&source))];
        if let (Some(root), Some(registry)) = (&params.target_root, &target) {
            jobs.push((root.clone(), Arc::clone(registry)));
        }
        let walker = Walker::new(params.own_artifacts(), self.reporter.clone(), Arc::clone(&self.cancelled));
        let walked = walker.walk_all(jobs).await;

        let discovered = source.len() + target.as_ref().map_or(0, |t| t.len());
        if walked.is_err() || self.is_cancelled() || discovered == 0 {
            drop(queue);
            let persisted = actor.await.context("Persistence actor panicked")??;
            let walked = walked?;
            if self.is_cancelled() {
                bail!("Run cancelled");
            }

            info!(errors = walked.errors, "no files found");
            report::remove_stale(&params.results_path())?;
            return Ok(RunSummary {
                skipped: walked.errors,
                persisted,
                elapsed: started.elapsed(),
                ..RunSummary::default()
            });
        }

        // Both senders exist before the queue handle goes away, so the
        // channel cannot close while either pool still has work.
        let pool = HasherPool::new(
            params.workers,
            Arc::clone(&self.fingerprint),
            snapshot,
            self.reporter.clone(),
            Arc::clone(&self.cancelled),
        );
        let source_sender = queue.register();
        let target_sender = target.as_ref().map(|registry| (Arc::clone(registry), queue.register()));
        drop(queue);

        let source_job = pool.run(Arc::clone(&source), source_sender);
        let target_job = async {
            match target_sender {
                Some((registry, sender)) => pool.run(registry, sender).await,
                None => Ok(HashStats::default()),
            }
        };
        let hashed = tokio::try_join!(source_job, target_job);

        let persisted = actor.await.context("Persistence actor panicked")??;
        let (source_stats, target_stats) = hashed?;
        let walked = walked?;

        let mut hash_stats = source_stats;
        hash_stats.merge(target_stats);

        let mut groups = match &target {
            Some(target) => find_cross_duplicates(&source.snapshot(), &target.snapshot()),
            None => find_duplicates(&source.snapshot()),
        };
        debug!(groups = groups.len(), "matched by digest");

        let mut rejected_collisions = 0;
        if params.paranoid && !groups.is_empty() {
            let mode = if params.dual_root {
                VerifyMode::AgainstPrimary
            } else {
                VerifyMode::Partition
            };
            let verifier = Verifier::new(params.workers, self.reporter.clone(), Arc::clone(&self.cancelled));
            let (verified, stats) = verifier.verify(groups, mode).await?;
            rejected_collisions = stats.rejected;
            hash_stats.skipped += stats.errors;
            groups = verified;
        }

        let results_path = self.publish(&groups)?;

        let summary = RunSummary {
            files_discovered: discovered as u64,
            fresh_hashes: hash_stats.fresh,
            cache_hits: hash_stats.cached,
            skipped: walked.errors + hash_stats.skipped,
            queue_send_failures: metrics.send_failures(),
            persisted,
            duplicate_groups: groups.len(),
            duplicate_pairs: groups.iter().map(DuplicateGroup::pairs).sum(),
            rejected_collisions,
            results_path,
            elapsed: started.elapsed(),
        };

        info!(
            files = summary.files_discovered,
            fresh = summary.fresh_hashes,
            cached = summary.cache_hits,
            skipped = summary.skipped,
            persisted = summary.persisted.total(),
            queue_full = summary.queue_send_failures,
            groups = summary.duplicate_groups,
            pairs = summary.duplicate_pairs,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(summary)
    }

    /// Write the results file, or remove an outdated one when nothing matched
    fn publish(&self, groups: &[DuplicateGroup]) -> Result<Option<PathBuf>> {
        let path = self.params.results_path();
        if groups.is_empty() {
            if report::remove_stale(&path)? {
                debug!(path = %path.display(), "removed stale results");
            }
            return Ok(None);
        }

        report::write_csv(&path, &report::flatten(groups))?;
        info!(path = %path.display(), "results written");
        Ok(Some(path))
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
