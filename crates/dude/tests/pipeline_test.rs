use dude::db::Database;
use dude::digest::{DigestAlgorithm, Fingerprint};
use dude::params::{ExecutionParams, RawParams, ValidationError};
use dude::progress::{PipelineEvent, ProgressTotals, Reporter};
use dude::settings::Settings;
use dude::Pipeline;
use filetime::FileTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// MD5 that counts how many files it actually read
#[derive(Default)]
struct CountingFingerprint {
    reads: AtomicUsize,
}

impl CountingFingerprint {
    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Fingerprint for CountingFingerprint {
    fn name(&self) -> &str {
        "counting-md5"
    }

    fn fingerprint(&self, reader: &mut dyn Read) -> io::Result<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        DigestAlgorithm::Md5.fingerprint(reader)
    }
}

/// Gives every file the same digest
struct CollidingFingerprint;

impl Fingerprint for CollidingFingerprint {
    fn name(&self) -> &str {
        "colliding"
    }

    fn fingerprint(&self, reader: &mut dyn Read) -> io::Result<String> {
        io::copy(reader, &mut io::sink())?;
        Ok("0".repeat(32))
    }
}

/// MD5 that raises the cancel flag once it has read `after` files
struct CancellingFingerprint {
    reads: AtomicUsize,
    after: usize,
    flag: Arc<AtomicBool>,
}

impl Fingerprint for CancellingFingerprint {
    fn name(&self) -> &str {
        "cancelling-md5"
    }

    fn fingerprint(&self, reader: &mut dyn Read) -> io::Result<String> {
        if self.reads.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.flag.store(true, Ordering::SeqCst);
        }
        DigestAlgorithm::Md5.fingerprint(reader)
    }
}

struct Workspace {
    temp: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("source")).unwrap();
        Self { temp }
    }

    fn source(&self) -> PathBuf {
        self.temp.path().join("source")
    }

    fn target(&self) -> PathBuf {
        let target = self.temp.path().join("target");
        fs::create_dir_all(&target).unwrap();
        target
    }

    fn write(&self, relative: &str, body: &[u8]) -> PathBuf {
        let path = self.temp.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    fn raw(&self) -> RawParams {
        RawParams {
            source: self.source(),
            cache_dir: Some(self.temp.path().join("cache")),
            results_dir: Some(self.temp.path().join("results")),
            ..RawParams::default()
        }
    }

    fn params(&self) -> ExecutionParams {
        self.raw().resolve(&Settings::default()).unwrap()
    }

    fn dual_params(&self) -> ExecutionParams {
        RawParams {
            target: Some(self.target()),
            ..self.raw()
        }
        .resolve(&Settings::default())
        .unwrap()
    }
}

fn read_rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

fn separator() -> Vec<String> {
    vec!["------".to_string(); 4]
}

#[tokio::test]
async fn test_empty_source_produces_no_artifact() {
    let ws = Workspace::new();
    let params = ws.params();
    let results = params.results_path();

    let summary = Pipeline::new(params).run().await.unwrap();

    assert_eq!(summary.files_discovered, 0);
    assert!(!summary.found_duplicates());
    assert!(summary.results_path.is_none());
    assert!(!results.exists());
}

#[tokio::test]
async fn test_single_root_pair_is_reported() {
    let ws = Workspace::new();
    let a = ws.write("source/a.txt", b"x");
    let b = ws.write("source/b.txt", b"x");
    ws.write("source/c.txt", b"y");

    let params = ws.params();
    let summary = Pipeline::new(params.clone()).run().await.unwrap();

    assert_eq!(summary.files_discovered, 3);
    assert_eq!(summary.fresh_hashes, 3);
    assert_eq!(summary.duplicate_groups, 1);
    assert_eq!(summary.duplicate_pairs, 1);
    assert_eq!(summary.results_path.as_deref(), Some(params.results_path().as_path()));

    let rows = read_rows(&params.results_path());
    assert_eq!(rows.len(), 2);
    let a = fs::canonicalize(a).unwrap();
    let b = fs::canonicalize(b).unwrap();
    assert_eq!(
        rows[0],
        vec![
            "a.txt".to_string(),
            a.display().to_string(),
            "b.txt".to_string(),
            b.display().to_string()
        ]
    );
    assert_eq!(rows[1], separator());

    let db = Database::new(params.cache_path()).await.unwrap();
    let cached = db.get_by_path(&a).await.unwrap().unwrap();
    assert_eq!(cached.record.digest, "9dd4e461268c8034f5c8564e155c67a6");
    assert_eq!(db.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_dual_root_only_links_across_roots() {
    let ws = Workspace::new();
    ws.write("source/f.txt", b"dup");
    ws.write("source/also_f.txt", b"dup");
    ws.write("target/g.txt", b"dup");
    ws.write("target/h.txt", b"other");

    let params = ws.dual_params();
    assert!(params.dual_root);
    let summary = Pipeline::new(params.clone()).run().await.unwrap();

    assert_eq!(summary.files_discovered, 4);
    assert_eq!(summary.duplicate_groups, 2);
    assert_eq!(summary.duplicate_pairs, 2);

    let rows = read_rows(&params.results_path());
    let data: Vec<_> = rows.iter().filter(|r| **r != separator()).collect();
    assert_eq!(data.len(), 2);
    for row in data {
        assert_eq!(row[2], "g.txt");
        assert!(row[1].starts_with(&params.source_root.display().to_string()));
    }
}

#[tokio::test]
async fn test_dual_root_without_matches_writes_nothing() {
    let ws = Workspace::new();
    ws.write("source/a", b"same");
    ws.write("source/b", b"same");
    ws.write("target/c", b"different");

    let params = ws.dual_params();
    let summary = Pipeline::new(params.clone()).run().await.unwrap();

    assert!(!summary.found_duplicates());
    assert!(!params.results_path().exists());
}

#[tokio::test]
async fn test_paranoid_rejects_forced_collision() {
    let ws = Workspace::new();
    ws.write("source/one.txt", b"first body");
    ws.write("source/two.txt", b"second body");

    let mut params = ws.params();
    params.paranoid = true;
    let summary = Pipeline::new(params.clone())
        .with_fingerprint(Arc::new(CollidingFingerprint))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.duplicate_groups, 0);
    assert_eq!(summary.rejected_collisions, 1);
    assert!(!params.results_path().exists());
}

#[tokio::test]
async fn test_without_paranoid_collision_is_reported() {
    let ws = Workspace::new();
    ws.write("source/one.txt", b"first body");
    ws.write("source/two.txt", b"second body");

    let summary = Pipeline::new(ws.params())
        .with_fingerprint(Arc::new(CollidingFingerprint))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.duplicate_groups, 1);
    assert_eq!(summary.rejected_collisions, 0);
}

#[tokio::test]
async fn test_second_run_reads_nothing_and_keeps_cache_rows() {
    let ws = Workspace::new();
    let a = ws.write("source/a.txt", b"x");
    ws.write("source/b.txt", b"x");
    ws.write("source/nested/c.txt", b"z");

    let params = ws.params();
    let first = Arc::new(CountingFingerprint::default());
    Pipeline::new(params.clone())
        .with_fingerprint(first.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(first.reads(), 3);

    let a = fs::canonicalize(a).unwrap();
    let before = {
        let db = Database::new(params.cache_path()).await.unwrap();
        db.get_by_path(&a).await.unwrap().unwrap()
    };

    let second = Arc::new(CountingFingerprint::default());
    let summary = Pipeline::new(params.clone())
        .with_fingerprint(second.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(second.reads(), 0);
    assert_eq!(summary.cache_hits, 3);
    assert_eq!(summary.fresh_hashes, 0);
    assert_eq!(summary.persisted.unchanged, 3);
    assert_eq!(summary.duplicate_groups, 1);

    let db = Database::new(params.cache_path()).await.unwrap();
    let after = db.get_by_path(&a).await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.id, before.id);
}

#[tokio::test]
async fn test_changed_mtime_forces_rehash() {
    let ws = Workspace::new();
    let a = ws.write("source/a.txt", b"aaaa");
    ws.write("source/b.txt", b"bbbb");

    let params = ws.params();
    Pipeline::new(params.clone()).run().await.unwrap();

    // Same size, new content, clearly different mtime
    fs::write(&a, b"bbbb").unwrap();
    filetime::set_file_mtime(&a, FileTime::from_unix_time(1_000_000_000, 0)).unwrap();

    let counting = Arc::new(CountingFingerprint::default());
    let summary = Pipeline::new(params.clone())
        .with_fingerprint(counting.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(counting.reads(), 1);
    assert_eq!(summary.fresh_hashes, 1);
    assert_eq!(summary.cache_hits, 1);
    assert_eq!(summary.persisted.updated, 1);
    assert_eq!(summary.duplicate_groups, 1);
}

#[tokio::test]
async fn test_stale_results_removed_when_duplicates_disappear() {
    let ws = Workspace::new();
    ws.write("source/a.txt", b"same");
    let b = ws.write("source/b.txt", b"same");

    let params = ws.params();
    Pipeline::new(params.clone()).run().await.unwrap();
    assert!(params.results_path().exists());

    fs::remove_file(b).unwrap();
    let summary = Pipeline::new(params.clone()).run().await.unwrap();

    assert!(!summary.found_duplicates());
    assert!(!params.results_path().exists());
}

#[tokio::test]
async fn test_tiny_queue_loses_no_records() {
    let ws = Workspace::new();
    for i in 0..200 {
        ws.write(&format!("source/d{}/f{:03}.bin", i % 7, i), format!("body {}", i % 50).as_bytes());
    }

    let mut settings = Settings::default();
    settings.scan.workers = 16;
    settings.scan.buffer_size = 1;
    settings.retry.initial_delay_ms = 1;
    settings.retry.max_delay_ms = 4;
    let params = ws.raw().resolve(&settings).unwrap();
    assert_eq!(params.buffer_size, 1);

    let summary = Pipeline::new(params.clone()).run().await.unwrap();

    assert_eq!(summary.files_discovered, 200);
    assert_eq!(summary.persisted.total(), 200);
    assert_eq!(summary.duplicate_groups, 50);
    assert_eq!(summary.duplicate_pairs, 150);

    let db = Database::new(params.cache_path()).await.unwrap();
    assert_eq!(db.count().await.unwrap(), 200);
}

#[tokio::test]
async fn test_repeated_runs_write_identical_results() {
    let ws = Workspace::new();
    for i in 0..30 {
        ws.write(&format!("source/{}/file{}.txt", i % 4, i), format!("{}", i % 6).as_bytes());
    }

    let params = ws.params();
    Pipeline::new(params.clone()).run().await.unwrap();
    let first = fs::read(params.results_path()).unwrap();

    Pipeline::new(params.clone()).run().await.unwrap();
    let second = fs::read(params.results_path()).unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_own_artifacts_inside_source_are_not_scanned() {
    let ws = Workspace::new();
    ws.write("source/a.txt", b"x");
    ws.write("source/b.txt", b"x");

    let params = RawParams {
        cache_dir: Some(ws.source().join("cache")),
        results_dir: Some(ws.source().join("results")),
        ..ws.raw()
    }
    .resolve(&Settings::default())
    .unwrap();

    Pipeline::new(params.clone()).run().await.unwrap();
    let summary = Pipeline::new(params.clone()).run().await.unwrap();

    assert_eq!(summary.files_discovered, 2);
    assert_eq!(summary.duplicate_pairs, 1);
}

#[tokio::test]
async fn test_progress_events_match_summary() {
    let ws = Workspace::new();
    ws.write("source/a", b"1");
    ws.write("source/b", b"1");
    ws.write("source/c", b"2");

    let mut params = ws.params();
    params.paranoid = true;
    let (tx, mut rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let summary = Pipeline::new(params)
        .with_reporter(Reporter::new(tx))
        .run()
        .await
        .unwrap();

    let mut totals = ProgressTotals::default();
    while let Some(event) = rx.recv().await {
        totals.apply(&event);
    }

    assert_eq!(totals.discovered, summary.files_discovered);
    assert_eq!(totals.hashed, 3);
    assert_eq!(totals.compared, 1);
    assert_eq!(totals.skipped, 0);
}

#[test]
fn test_validation_fails_before_processing() {
    let ws = Workspace::new();
    let err = RawParams {
        source: ws.temp.path().join("nope"),
        ..ws.raw()
    }
    .resolve(&Settings::default())
    .unwrap_err();

    assert!(matches!(err, ValidationError::NotExists { .. }));
    assert!(!ws.temp.path().join("cache").join("dude.db").exists());
}

#[tokio::test]
async fn test_cancelled_run_fails_after_committing_finished_work() {
    let ws = Workspace::new();
    for i in 0..10 {
        ws.write(&format!("source/f{:02}.txt", i), format!("{}", i).as_bytes());
    }

    let mut settings = Settings::default();
    settings.scan.workers = 1;
    let params = ws.raw().resolve(&settings).unwrap();
    assert_eq!(params.workers, 1);

    let cancelled = Arc::new(AtomicBool::new(false));
    let fingerprint = Arc::new(CancellingFingerprint {
        reads: AtomicUsize::new(0),
        after: 3,
        flag: Arc::clone(&cancelled),
    });
    let err = Pipeline::new(params.clone())
        .with_fingerprint(fingerprint.clone())
        .with_cancel_flag(cancelled)
        .run()
        .await
        .unwrap_err();

    assert!(err.to_string().contains("cancelled"));
    assert_eq!(fingerprint.reads.load(Ordering::SeqCst), 3);
    assert!(!params.results_path().exists());

    let db = Database::new(params.cache_path()).await.unwrap();
    assert_eq!(db.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_cache_write_failure_aborts_run() {
    let ws = Workspace::new();
    ws.write("source/a.txt", b"x");
    ws.write("source/b.txt", b"x");
    let params = ws.params();

    // Create the schema, then make every insert fail
    drop(Database::new(params.cache_path()).await.unwrap());
    let pool = SqlitePool::connect_with(SqliteConnectOptions::new().filename(params.cache_path()))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_insert BEFORE INSERT ON file_hashes
         BEGIN SELECT RAISE(ABORT, 'read-only cache'); END",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let err = Pipeline::new(params.clone()).run().await.unwrap_err();

    assert!(format!("{:#}", err).contains("Failed to write fingerprint cache"));
    assert!(!params.results_path().exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_non_utf8_names_are_skipped_on_every_run() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let ws = Workspace::new();
    ws.write("source/plain.txt", b"one");
    fs::write(ws.source().join(OsStr::from_bytes(b"a\xff")), b"one").unwrap();
    fs::write(ws.source().join(OsStr::from_bytes(b"a\xfe")), b"two-longer").unwrap();
    let params = ws.params();

    let first = Pipeline::new(params.clone()).run().await.unwrap();
    assert_eq!(first.files_discovered, 1);
    assert_eq!(first.skipped, 2);
    assert_eq!(first.persisted.inserted, 1);

    let second = Pipeline::new(params.clone()).run().await.unwrap();
    assert_eq!(second.cache_hits, 1);
    assert_eq!(second.fresh_hashes, 0);
    assert_eq!(second.persisted.unchanged, 1);

    let db = Database::new(params.cache_path()).await.unwrap();
    assert_eq!(db.count().await.unwrap(), 1);
}
