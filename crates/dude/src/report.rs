use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::matcher::DuplicateGroup;

/// Value written to every column of the row that closes a group
pub const SEPARATOR: &str = "------";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRow {
    #[serde(rename = "Primary Name")]
    pub primary_name: String,
    #[serde(rename = "Primary Path")]
    pub primary_path: String,
    #[serde(rename = "Duplicate Name")]
    pub duplicate_name: String,
    #[serde(rename = "Duplicate Path")]
    pub duplicate_path: String,
}

impl ResultRow {
    pub fn separator() -> Self {
        Self {
            primary_name: SEPARATOR.to_string(),
            primary_path: SEPARATOR.to_string(),
            duplicate_name: SEPARATOR.to_string(),
            duplicate_path: SEPARATOR.to_string(),
        }
    }

    pub fn is_separator(&self) -> bool {
        *self == Self::separator()
    }
}

/// One row per (primary, duplicate) pair, with a separator after each group
pub fn flatten(groups: &[DuplicateGroup]) -> Vec<ResultRow> {
    let mut rows = Vec::new();
    for group in groups {
        for duplicate in &group.duplicates {
            rows.push(ResultRow {
                primary_name: group.primary.name.clone(),
                primary_path: group.primary.path.display().to_string(),
                duplicate_name: duplicate.name.clone(),
                duplicate_path: duplicate.path.display().to_string(),
            });
        }
        rows.push(ResultRow::separator());
    }
    rows
}

/// Write `rows` as CSV, replacing any existing file
pub fn write_csv(path: &Path, rows: &[ResultRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create results file {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write results to {}", path.display()))?;
    Ok(())
}

/// Delete a results file left by an earlier run, if any. Returns true if one was removed.
pub fn remove_stale(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to remove stale results {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FileEntry;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn group(primary: &str, duplicates: &[&str]) -> DuplicateGroup {
        DuplicateGroup {
            primary: FileEntry::discovered(PathBuf::from(primary)),
            duplicates: duplicates
                .iter()
                .map(|d| FileEntry::discovered(PathBuf::from(d)))
                .collect(),
        }
    }

    #[test]
    fn test_flatten_adds_separator_after_each_group() {
        let groups = vec![group("/r/a.txt", &["/r/b.txt", "/r/c.txt"]), group("/r/x", &["/r/y"])];

        let rows = flatten(&groups);

        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].primary_name, "a.txt");
        assert_eq!(rows[0].duplicate_path, "/r/b.txt");
        assert_eq!(rows[1].duplicate_name, "c.txt");
        assert!(rows[2].is_separator());
        assert_eq!(rows[3].primary_path, "/r/x");
        assert!(rows[4].is_separator());
    }

    #[test]
    fn test_write_csv_header_and_rows() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out").join("results.csv");

        write_csv(&path, &flatten(&[group("/r/a.txt", &["/r/b.txt"])])).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines[0], "Primary Name,Primary Path,Duplicate Name,Duplicate Path");
        assert_eq!(lines[1], "a.txt,/r/a.txt,b.txt,/r/b.txt");
        assert_eq!(lines[2], "------,------,------,------");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_remove_stale() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("results.csv");
        assert!(!remove_stale(&path).unwrap());

        fs::write(&path, "old").unwrap();
        assert!(remove_stale(&path).unwrap());
        assert!(!path.exists());
    }
}
