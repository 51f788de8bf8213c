//! Grouping of hashed entries by digest.
//!
//! Linkage is directional: each group has one primary and its duplicates
//! hang off it. Duplicates never point back at the primary, so callers must
//! traverse from primaries. Input order decides who is primary; feed
//! [`Registry::snapshot`](crate::registry::Registry::snapshot) output to get
//! path order.

use std::collections::HashMap;

use crate::registry::FileEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub primary: FileEntry,
    pub duplicates: Vec<FileEntry>,
}

impl DuplicateGroup {
    /// Number of (primary, duplicate) pairs in this group
    pub fn pairs(&self) -> usize {
        self.duplicates.len()
    }
}

/// Single-root mode: every digest seen more than once becomes a group whose
/// primary is its first entry in `entries`.
pub fn find_duplicates(entries: &[FileEntry]) -> Vec<DuplicateGroup> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut buckets: Vec<Vec<&FileEntry>> = Vec::new();

    for entry in entries {
        let Some(digest) = entry.digest.as_deref() else {
            continue;
        };
        match index.get(digest) {
            Some(&i) => buckets[i].push(entry),
            None => {
                index.insert(digest, buckets.len());
                buckets.push(vec![entry]);
            }
        }
    }

    buckets
        .into_iter()
        .filter(|bucket| bucket.len() > 1)
        .map(|bucket| DuplicateGroup {
            primary: bucket[0].clone(),
            duplicates: bucket[1..].iter().map(|e| (*e).clone()).collect(),
        })
        .collect()
}

/// Dual-root mode: each source entry with at least one equal-digest target
/// entry becomes a group, with the matching targets as its duplicates.
pub fn find_cross_duplicates(source: &[FileEntry], target: &[FileEntry]) -> Vec<DuplicateGroup> {
    let mut by_digest: HashMap<&str, Vec<&FileEntry>> = HashMap::new();
    for entry in target {
        if let Some(digest) = entry.digest.as_deref() {
            by_digest.entry(digest).or_default().push(entry);
        }
    }

    source
        .iter()
        .filter_map(|entry| {
            let digest = entry.digest.as_deref()?;
            let matches = by_digest.get(digest)?;
            Some(DuplicateGroup {
                primary: entry.clone(),
                duplicates: matches
                    .iter()
                    .filter(|m| m.path != entry.path)
                    .map(|m| (*m).clone())
                    .collect(),
            })
        })
        .filter(|group| !group.duplicates.is_empty())
        .collect()
}
