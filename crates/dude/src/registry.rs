use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A regular file discovered under one of the scanned roots.
///
/// `digest` stays `None` until a hash worker processes the entry, and stays
/// `None` for files that could not be read. Such entries never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub name: String,
    pub digest: Option<String>,
    pub size: u64,
    pub modified_at: Option<String>,
}

impl FileEntry {
    pub fn discovered(path: PathBuf) -> Self {
        let name = file_name(&path);
        Self {
            path,
            name,
            digest: None,
            size: 0,
            modified_at: None,
        }
    }
}

/// Last path component, lossily converted
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

/// Format a modification time the way the cache stores it.
///
/// Fixed-width RFC 3339 with nanoseconds so the strings compare and sort
/// like the instants they encode, and same-second edits still differ.
pub fn format_mod_time(modified: SystemTime) -> String {
    let dt: DateTime<Utc> = modified.into();
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Concurrency-safe set of discovered files keyed by full path.
///
/// Walk tasks insert, hash workers update their own key, and the matcher
/// reads a sorted snapshot once every worker has finished.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<PathBuf, FileEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly discovered path. Returns false if it was already known.
    pub fn insert(&self, path: PathBuf) -> bool {
        match self.entries.entry(path) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let entry = FileEntry::discovered(slot.key().clone());
                slot.insert(entry);
                true
            }
        }
    }

    /// Record the result of hashing `path`
    pub fn record_digest(&self, path: &Path, size: u64, modified_at: String, digest: String) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.size = size;
            entry.modified_at = Some(modified_at);
            entry.digest = Some(digest);
            entry.name = file_name(path);
        }
    }

    pub fn get(&self, path: &Path) -> Option<FileEntry> {
        self.entries.get(path).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All known paths, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.entries.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Copy of every entry, sorted by path so "first seen" is deterministic
    pub fn snapshot(&self) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }
}
