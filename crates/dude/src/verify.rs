use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::digest::READ_BUFFER_SIZE;
use crate::matcher::DuplicateGroup;
use crate::progress::Reporter;
use crate::registry::FileEntry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyStats {
    /// Byte comparisons performed
    pub compared: u64,
    /// Digest-equal pairs whose content differed
    pub rejected: u64,
    /// Comparisons abandoned because a file could not be read
    pub errors: u64,
}

impl VerifyStats {
    fn merge(&mut self, other: VerifyStats) {
        self.compared += other.compared;
        self.rejected += other.rejected;
        self.errors += other.errors;
    }
}

/// How a digest group is re-checked byte by byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Split a group into classes of truly identical files; every class of
    /// two or more stays a group led by its first member
    Partition,
    /// Keep only the duplicates identical to the primary
    AgainstPrimary,
}

/// Paranoid verification pool: one group per job, `workers` jobs at a time
pub struct Verifier {
    workers: usize,
    reporter: Reporter,
    cancelled: Arc<AtomicBool>,
}

impl Verifier {
    pub fn new(workers: usize, reporter: Reporter, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            workers: workers.max(1),
            reporter,
            cancelled,
        }
    }

    /// Drop every pair whose bytes differ. Group order is preserved.
    pub async fn verify(
        &self,
        groups: Vec<DuplicateGroup>,
        mode: VerifyMode,
    ) -> Result<(Vec<DuplicateGroup>, VerifyStats)> {
        info!(groups = groups.len(), "verifying duplicates byte by byte");
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (index, group) in groups.into_iter().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("Verifier semaphore closed")?;
            if self.cancelled.load(Ordering::Relaxed) {
                break;
            }

            let reporter = self.reporter.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let (verified, stats) = match mode {
                    VerifyMode::Partition => partition_group(group, &reporter),
                    VerifyMode::AgainstPrimary => filter_group(group, &reporter),
                };
                (index, verified, stats)
            });
        }

        let mut results = Vec::new();
        let mut stats = VerifyStats::default();
        while let Some(joined) = tasks.join_next().await {
            let (index, verified, group_stats) = joined.context("Verify worker panicked")?;
            stats.merge(group_stats);
            results.push((index, verified));
        }

        if self.cancelled.load(Ordering::Relaxed) {
            bail!("Verification cancelled");
        }

        results.sort_by_key(|(index, _)| *index);
        let verified: Vec<DuplicateGroup> =
            results.into_iter().flat_map(|(_, groups)| groups).collect();

        debug!(
            compared = stats.compared,
            rejected = stats.rejected,
            errors = stats.errors,
            "verification finished"
        );
        Ok((verified, stats))
    }
}

fn compare(a: &FileEntry, b: &FileEntry, reporter: &Reporter, stats: &mut VerifyStats) -> Option<bool> {
    let result = files_identical(&a.path, &b.path);
    reporter.compared();
    stats.compared += 1;
    match result {
        Ok(same) => Some(same),
        Err(e) => {
            stats.errors += 1;
            reporter.skipped(&b.path, format!("comparison with {} failed: {}", a.path.display(), e));
            None
        }
    }
}

fn filter_group(group: DuplicateGroup, reporter: &Reporter) -> (Vec<DuplicateGroup>, VerifyStats) {
    let mut stats = VerifyStats::default();
    let DuplicateGroup { primary, duplicates } = group;

    let duplicates: Vec<FileEntry> = duplicates
        .into_iter()
        .filter(|candidate| match compare(&primary, candidate, reporter, &mut stats) {
            Some(true) => true,
            Some(false) => {
                stats.rejected += 1;
                false
            }
            None => false,
        })
        .collect();

    if duplicates.is_empty() {
        return (Vec::new(), stats);
    }
    (vec![DuplicateGroup { primary, duplicates }], stats)
}

fn partition_group(group: DuplicateGroup, reporter: &Reporter) -> (Vec<DuplicateGroup>, VerifyStats) {
    let mut stats = VerifyStats::default();
    let DuplicateGroup { primary, duplicates } = group;
    let mut classes: Vec<Vec<FileEntry>> = vec![vec![primary]];

    'candidates: for candidate in duplicates {
        for (i, class) in classes.iter_mut().enumerate() {
            match compare(&class[0], &candidate, reporter, &mut stats) {
                Some(true) => {
                    class.push(candidate);
                    continue 'candidates;
                }
                Some(false) => {
                    if i == 0 {
                        stats.rejected += 1;
                    }
                }
                None => continue 'candidates,
            }
        }
        classes.push(vec![candidate]);
    }

    let groups = classes
        .into_iter()
        .filter(|class| class.len() > 1)
        .map(|mut class| {
            let primary = class.remove(0);
            DuplicateGroup {
                primary,
                duplicates: class,
            }
        })
        .collect();
    (groups, stats)
}

/// Byte-for-byte equality of two files
pub fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }

    let mut file_a = File::open(a)?;
    let mut file_b = File::open(b)?;
    let mut buf_a = vec![0u8; READ_BUFFER_SIZE];
    let mut buf_b = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n_a = read_chunk(&mut file_a, &mut buf_a)?;
        let n_b = read_chunk(&mut file_b, &mut buf_b)?;
        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
        if n_a == 0 {
            return Ok(true);
        }
    }
}

/// Fill `buf` as far as the reader allows; short only at end of file
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
