//! Resolution and validation of run parameters.
//!
//! Everything here happens before the pipeline starts; a failure means no
//! file has been read and nothing has been written to the cache.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::digest::DigestAlgorithm;
use crate::queue::RetryPolicy;
use crate::settings::Settings;

pub const CACHE_FILE_NAME: &str = "dude.db";
pub const RESULTS_FILE_NAME: &str = "results.csv";

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const MAX_BUFFER_SIZE: usize = 1_048_576;

const WRITE_CHECK_NAME: &str = ".dude-write-check";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{arg}: path does not exist: {path}")]
    NotExists { arg: &'static str, path: PathBuf },

    #[error("{arg}: path is not a directory: {path}")]
    NotDirectory { arg: &'static str, path: PathBuf },

    #[error("{arg}: no read access to {path}: {source}")]
    NoReadAccess {
        arg: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("{arg}: no write access to {path}: {source}")]
    NoWriteAccess {
        arg: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("source and target resolve to the same directory: {0}")]
    SameRoots(PathBuf),
}

/// Immutable description of one run
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub source_root: PathBuf,
    pub target_root: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub results_dir: PathBuf,
    pub workers: usize,
    pub buffer_size: usize,
    pub dual_root: bool,
    pub paranoid: bool,
    pub digest: DigestAlgorithm,
    pub retry: RetryPolicy,
}

impl ExecutionParams {
    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE_NAME)
    }

    pub fn results_path(&self) -> PathBuf {
        self.results_dir.join(RESULTS_FILE_NAME)
    }

    /// Files the run itself writes; they must never be scanned
    pub fn own_artifacts(&self) -> Vec<PathBuf> {
        let cache = self.cache_path();
        let mut paths = vec![self.results_path()];
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut sibling = cache.clone().into_os_string();
            sibling.push(suffix);
            paths.push(PathBuf::from(sibling));
        }
        paths.push(cache);
        paths
    }
}

/// Unvalidated inputs, as collected from the command line
#[derive(Debug, Clone, Default)]
pub struct RawParams {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub results_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub buffer_size: Option<usize>,
    pub paranoid: bool,
    pub digest: Option<DigestAlgorithm>,
}

impl RawParams {
    /// Fill gaps from `settings`, check every path, and clamp the numbers
    pub fn resolve(self, settings: &Settings) -> Result<ExecutionParams, ValidationError> {
        let source_root = readable_dir("source", &self.source)?;
        let target_root = match &self.target {
            Some(target) => Some(readable_dir("target", target)?),
            None => None,
        };
        if target_root.as_ref() == Some(&source_root) {
            return Err(ValidationError::SameRoots(source_root));
        }

        let cache_dir = self.cache_dir.unwrap_or_else(|| settings.cache_dir());
        let results_dir = self.results_dir.unwrap_or_else(|| settings.results_dir());
        check_writable("cache-dir", &cache_dir)?;
        check_writable("results-dir", &results_dir)?;
        let cache_dir = create_dir("cache-dir", &cache_dir)?;
        let results_dir = create_dir("results-dir", &results_dir)?;

        Ok(ExecutionParams {
            dual_root: target_root.is_some(),
            source_root,
            target_root,
            cache_dir,
            results_dir,
            workers: resolve_workers(self.workers.unwrap_or(settings.scan.workers)),
            buffer_size: resolve_buffer_size(self.buffer_size.unwrap_or(settings.scan.buffer_size)),
            paranoid: self.paranoid || settings.scan.paranoid,
            digest: self.digest.unwrap_or(settings.scan.digest),
            retry: settings.retry.policy(),
        })
    }
}

/// 0 means "all logical CPUs"; anything above that is clamped down
pub fn resolve_workers(requested: usize) -> usize {
    let max = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if requested == 0 {
        max
    } else {
        requested.min(max)
    }
}

pub fn resolve_buffer_size(requested: usize) -> usize {
    match requested {
        0 => DEFAULT_BUFFER_SIZE,
        n => n.min(MAX_BUFFER_SIZE),
    }
}

/// Must exist, be a directory, and be listable. Returns the canonical path.
fn readable_dir(arg: &'static str, path: &Path) -> Result<PathBuf, ValidationError> {
    let metadata = fs::metadata(path).map_err(|_| ValidationError::NotExists {
        arg,
        path: path.to_path_buf(),
    })?;
    if !metadata.is_dir() {
        return Err(ValidationError::NotDirectory {
            arg,
            path: path.to_path_buf(),
        });
    }
    fs::read_dir(path).map_err(|source| ValidationError::NoReadAccess {
        arg,
        path: path.to_path_buf(),
        source,
    })?;
    fs::canonicalize(path).map_err(|source| ValidationError::NoReadAccess {
        arg,
        path: path.to_path_buf(),
        source,
    })
}

/// Must be a writable directory, or creatable under a writable one. Leaves
/// nothing behind.
fn check_writable(arg: &'static str, path: &Path) -> Result<(), ValidationError> {
    if path.exists() && !path.is_dir() {
        return Err(ValidationError::NotDirectory {
            arg,
            path: path.to_path_buf(),
        });
    }

    let existing = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or(Path::new("."));
    if !existing.is_dir() {
        return Err(ValidationError::NotDirectory {
            arg,
            path: existing.to_path_buf(),
        });
    }

    let no_write = |source| ValidationError::NoWriteAccess {
        arg,
        path: path.to_path_buf(),
        source,
    };
    let marker = existing.join(WRITE_CHECK_NAME);
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&marker)
        .map_err(no_write)?;
    fs::remove_file(&marker).map_err(no_write)
}

/// Create a checked directory and return its canonical path
fn create_dir(arg: &'static str, path: &Path) -> Result<PathBuf, ValidationError> {
    let no_write = |source| ValidationError::NoWriteAccess {
        arg,
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(path).map_err(no_write)?;
    fs::canonicalize(path).map_err(no_write)
}
