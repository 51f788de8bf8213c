use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::queue::{CacheQueue, RetryPolicy};

/// Most records the actor applies in a single transaction
const PERSIST_BATCH_SIZE: usize = 256;

/// What the cache knows, or should know, about one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub path: PathBuf,
    pub digest: String,
    pub size: u64,
    pub modified_at: String,
}

impl CacheRecord {
    /// True when `size` and `modified_at` still describe the file this record was made from
    pub fn is_fresh(&self, size: u64, modified_at: &str) -> bool {
        self.size == size && self.modified_at == modified_at
    }
}

/// A cache row including its bookkeeping columns
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: i64,
    pub record: CacheRecord,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl PersistStats {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn merge(&mut self, other: PersistStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

/// Sole writer of the fingerprint cache during a run.
///
/// Drains the bounded record queue until every registered sender is gone,
/// then returns what it wrote. A store error ends the actor with `Err`; the
/// receiver is dropped with it, so producers see a closed queue.
pub struct PersistenceActor {
    db: Database,
    receiver: mpsc::Receiver<CacheRecord>,
}

impl PersistenceActor {
    pub fn new(db: Database, receiver: mpsc::Receiver<CacheRecord>) -> Self {
        Self { db, receiver }
    }

    /// Create the queue and start the actor on the current runtime
    pub fn spawn(
        db: Database,
        capacity: usize,
        retry: RetryPolicy,
    ) -> (CacheQueue, JoinHandle<Result<PersistStats>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let actor = Self::new(db, rx);
        let handle = tokio::spawn(async move { actor.run().await });
        (CacheQueue::new(tx, retry), handle)
    }

    pub async fn run(mut self) -> Result<PersistStats> {
        debug!("persistence actor started");
        let mut stats = PersistStats::default();
        let mut batch = Vec::with_capacity(PERSIST_BATCH_SIZE);

        while self.receiver.recv_many(&mut batch, PERSIST_BATCH_SIZE).await > 0 {
            let applied = self
                .db
                .upsert_batch(&batch)
                .await
                .context("Failed to write fingerprint cache")?;
            debug!(records = batch.len(), "persisted batch");
            stats.merge(applied);
            batch.clear();
        }

        debug!(
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "persistence actor finished"
        );
        Ok(stats)
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open cache at {}", db_path.display()))?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory cache; a single connection keeps every query on the same database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory cache")?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    /// Read every record into memory, keyed by path.
    ///
    /// Called once per run before any hashing starts.
    pub async fn load_snapshot(&self) -> Result<HashMap<PathBuf, CacheRecord>> {
        let rows = sqlx::query("SELECT file_path, hash, file_size, mod_time FROM file_hashes")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load fingerprint cache")?;

        let snapshot: HashMap<PathBuf, CacheRecord> = rows
            .iter()
            .map(|row| {
                let record = record_from_row(row);
                (record.path.clone(), record)
            })
            .collect();

        info!(records = snapshot.len(), "loaded fingerprint cache");
        Ok(snapshot)
    }

    pub async fn get_by_path(&self, path: &Path) -> Result<Option<StoredRecord>> {
        let row = sqlx::query(
            "SELECT id, file_path, hash, file_size, mod_time, created_at, updated_at
             FROM file_hashes WHERE file_path = ?",
        )
        .bind(path_key(path)?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredRecord {
            id: row.get("id"),
            record: record_from_row(&row),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_hashes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn upsert(&self, record: &CacheRecord) -> Result<UpsertOutcome> {
        let mut conn = self.pool.acquire().await?;
        upsert_on(&mut *conn, record, &Utc::now().to_rfc3339()).await
    }

    /// Apply a batch of upserts in one transaction
    pub async fn upsert_batch(&self, records: &[CacheRecord]) -> Result<PersistStats> {
        let now = Utc::now().to_rfc3339();
        let mut stats = PersistStats::default();
        let mut tx = self.pool.begin().await?;

        for record in records {
            stats.record(upsert_on(&mut *tx, record, &now).await?);
        }

        tx.commit().await?;
        Ok(stats)
    }

    pub async fn delete_by_path(&self, path: &Path) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_hashes WHERE file_path = ?")
            .bind(path_key(path)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove records whose file no longer exists. Returns how many were removed.
    pub async fn prune_missing(&self) -> Result<u64> {
        let paths: Vec<String> = sqlx::query_scalar("SELECT file_path FROM file_hashes")
            .fetch_all(&self.pool)
            .await?;

        let mut removed = 0;
        for path in paths {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false)
                && self.delete_by_path(Path::new(&path)).await?
            {
                removed += 1;
            }
        }

        info!(removed, "pruned fingerprint cache");
        Ok(removed)
    }
}

/// Cache key for `path`. Only UTF-8 paths are stored; anything else would be
/// mangled into a key shared with other files.
fn path_key(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Path is not valid UTF-8: {}", path.display()))
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> CacheRecord {
    let path: String = row.get("file_path");
    let size: i64 = row.get("file_size");
    CacheRecord {
        path: PathBuf::from(path),
        digest: row.get("hash"),
        size: size as u64,
        modified_at: row.get("mod_time"),
    }
}

/// Insert a new record, update a changed one, or leave an identical one alone
async fn upsert_on(
    conn: &mut SqliteConnection,
    record: &CacheRecord,
    now: &str,
) -> Result<UpsertOutcome> {
    let path_str = path_key(&record.path)?;

    let existing = sqlx::query("SELECT file_size, mod_time FROM file_hashes WHERE file_path = ?")
        .bind(path_str)
        .fetch_optional(&mut *conn)
        .await?;

    match existing {
        None => {
            sqlx::query(
                "INSERT INTO file_hashes (file_path, hash, file_size, mod_time, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(path_str)
            .bind(&record.digest)
            .bind(record.size as i64)
            .bind(&record.modified_at)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertOutcome::Inserted)
        }
        Some(row) => {
            let size: i64 = row.get("file_size");
            let mod_time: String = row.get("mod_time");
            if size as u64 == record.size && mod_time == record.modified_at {
                return Ok(UpsertOutcome::Unchanged);
            }

            sqlx::query(
                "UPDATE file_hashes SET hash = ?, file_size = ?, mod_time = ?, updated_at = ?
                 WHERE file_path = ?",
            )
            .bind(&record.digest)
            .bind(record.size as i64)
            .bind(&record.modified_at)
            .bind(now)
            .bind(path_str)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertOutcome::Updated)
        }
    }
}
