//! End-to-end tests for the storage engine.
//!
//! Every test opens its own database in a fresh temporary directory and
//! goes through the public facade only, the way the node uses it. Crashes
//! are simulated by writing the exact on-disk state a crash would leave and
//! reopening; faults are injected through the file-system and engine seams.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use lattice_db::{
    flat_files_bucket, Bucket, DataAccessor, Database, DatabaseConfig, DbError, DbResult,
    EngineOpener, FileSystem, FlatFileLocation, KvEngine, OsFileSystem, SledEngine, SledOpener,
    StoreFile, WriteSet,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn small_files(max_file_size: u32) -> DatabaseConfig {
    DatabaseConfig {
        max_open_files: 8,
        max_file_size,
    }
}

/// Routes engine logs through the test harness; `RUST_LOG=lattice_db=debug`
/// shows them for failing tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open(dir: &Path) -> Database {
    init_tracing();
    Database::builder(dir).open().expect("open database")
}

fn open_with(dir: &Path, config: DatabaseConfig) -> Database {
    init_tracing();
    Database::builder(dir).config(config).open().expect("open database")
}

fn flat_file(dir: &Path, store: &str, number: u32) -> PathBuf {
    dir.join(format!("{store}-{number:09}.fdb"))
}

/// Flips one byte of a file in place.
fn flip_byte(path: &Path, offset: usize) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[offset] ^= 0xFF;
    std::fs::write(path, bytes).unwrap();
}

/// File system whose appends can be made to fail halfway through.
struct FaultyFs {
    fail_appends: Arc<AtomicBool>,
}

struct FaultyFile {
    inner: Box<dyn StoreFile>,
    fail_appends: Arc<AtomicBool>,
}

impl StoreFile for FaultyFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.read_exact_at(buf, offset)
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            // Leave a torn record behind, like a crash mid-write would.
            self.inner.append(&data[..data.len() / 2])?;
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        self.inner.append(data)
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.inner.truncate(len)
    }

    fn len(&self) -> io::Result<u64> {
        self.inner.len()
    }
}

impl FileSystem for FaultyFs {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StoreFile>> {
        OsFileSystem.open_read(path)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn StoreFile>> {
        Ok(Box::new(FaultyFile {
            inner: OsFileSystem.open_append(path)?,
            fail_appends: Arc::clone(&self.fail_appends),
        }))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        OsFileSystem.create_dir_all(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        OsFileSystem.list(dir)
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        OsFileSystem.file_len(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        OsFileSystem.remove(path)
    }
}

/// sled engine whose batch commits can be made to fail.
struct FailingCommitEngine {
    inner: SledEngine,
    fail: Arc<AtomicBool>,
}

impl KvEngine for FailingCommitEngine {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn first_in(
        &self,
        lower: std::ops::Bound<&[u8]>,
        upper: std::ops::Bound<&[u8]>,
    ) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.inner.first_in(lower, upper)
    }

    fn last_in(
        &self,
        lower: std::ops::Bound<&[u8]>,
        upper: std::ops::Bound<&[u8]>,
    ) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.inner.last_in(lower, upper)
    }

    fn apply(&self, batch: &WriteSet) -> DbResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DbError::io(
                "commit metadata batch",
                io::Error::new(io::ErrorKind::Other, "injected commit failure"),
            ));
        }
        self.inner.apply(batch)
    }

    fn flush(&self) -> DbResult<()> {
        self.inner.flush()
    }

    fn close(&self) -> DbResult<()> {
        self.inner.close()
    }
}

struct FailingCommitOpener {
    fail: Arc<AtomicBool>,
}

impl EngineOpener for FailingCommitOpener {
    fn open(&self, path: &Path) -> DbResult<Box<dyn KvEngine>> {
        Ok(Box::new(FailingCommitEngine {
            inner: SledEngine::open(path)?,
            fail: Arc::clone(&self.fail),
        }))
    }

    fn recover(&self, path: &Path) -> DbResult<()> {
        SledOpener.recover(path)
    }
}

/// Reports corruption on the first open, then behaves.
struct CorruptOnceOpener {
    opens: Arc<AtomicUsize>,
    recoveries: Arc<AtomicUsize>,
}

impl EngineOpener for CorruptOnceOpener {
    fn open(&self, path: &Path) -> DbResult<Box<dyn KvEngine>> {
        if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(DbError::UnrecoverableCorruption("bad log segment".into()));
        }
        SledOpener.open(path)
    }

    fn recover(&self, path: &Path) -> DbResult<()> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        SledOpener.recover(path)
    }
}

// ---------------------------------------------------------------------------
// Flat-file records
// ---------------------------------------------------------------------------

#[test]
fn append_and_retrieve_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());

    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"x".to_vec(),
        b"a block body".to_vec(),
        (0..=255u8).collect(),
        vec![0xAB; 64 * 1024],
    ];
    let locations: Vec<_> = payloads
        .iter()
        .map(|p| db.append_to_store("blocks", p).unwrap())
        .collect();

    for (payload, location) in payloads.iter().zip(&locations) {
        assert_eq!(&db.retrieve_from_store("blocks", location).unwrap(), payload);
    }
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let location = {
        let db = open(dir.path());
        let location = db.append_to_store("blocks", b"persisted").unwrap();
        db.close().unwrap();
        location
    };

    let db = open(dir.path());
    assert_eq!(db.retrieve_from_store("blocks", &location).unwrap(), b"persisted");
    assert_eq!(db.store_names().unwrap(), ["blocks"]);
}

#[test]
fn flipped_payload_byte_is_a_checksum_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let location = {
        let db = open(dir.path());
        let location = db.append_to_store("blocks", b"sensitive payload").unwrap();
        db.close().unwrap();
        location
    };
    // Record layout: 4-byte length, payload, 4-byte CRC.
    flip_byte(&flat_file(dir.path(), "blocks", 0), 4 + 3);

    let db = open(dir.path());
    let err = db.retrieve_from_store("blocks", &location).unwrap_err();
    assert!(matches!(err, DbError::ChecksumMismatch { .. }), "got {err}");
    assert!(err.is_corruption());
}

#[test]
fn flipped_length_byte_is_a_checksum_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let location = {
        let db = open(dir.path());
        let location = db.append_to_store("blocks", b"payload").unwrap();
        db.close().unwrap();
        location
    };
    flip_byte(&flat_file(dir.path(), "blocks", 0), 0);

    let db = open(dir.path());
    let err = db.retrieve_from_store("blocks", &location).unwrap_err();
    assert!(matches!(err, DbError::ChecksumMismatch { .. }), "got {err}");

    let report = db.verify_store("blocks").unwrap();
    assert_eq!(report.records, 0);
    assert!(report.first_corrupt.is_some());
}

#[test]
fn malformed_location_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let err = db.retrieve_from_store("blocks", &[0u8; 5]).unwrap_err();
    assert!(matches!(err, DbError::InvalidLocation { expected: 12, actual: 5 }));
}

#[test]
fn location_beyond_write_cursor_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.append_to_store("blocks", b"only record").unwrap();
    let ahead = FlatFileLocation::new(0, 1_000, 16).serialize();
    assert!(db.retrieve_from_store("blocks", &ahead).unwrap_err().is_not_found());
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[test]
fn rollback_across_many_file_rollovers() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_with(dir.path(), small_files(16));

    let committed: Vec<_> = {
        let mut tx = db.begin().unwrap();
        let locations = (0..1000u32)
            .map(|i| tx.append_to_store("blocks", &[(i % 251) as u8]).unwrap())
            .collect();
        tx.commit().unwrap();
        locations
    };
    let checkpoint = db.current_location("blocks").unwrap();
    // One 9-byte record per 16-byte file.
    assert!(checkpoint.file_number >= 999);

    let discarded: Vec<_> = {
        let mut tx = db.begin().unwrap();
        let locations = (0..50u8)
            .map(|i| tx.append_to_store("blocks", &[i]).unwrap())
            .collect();
        tx.rollback().unwrap();
        locations
    };

    assert_eq!(db.current_location("blocks").unwrap(), checkpoint);
    for (i, location) in committed.iter().enumerate() {
        assert_eq!(
            db.retrieve_from_store("blocks", location).unwrap(),
            [(i as u32 % 251) as u8]
        );
    }
    for location in &discarded {
        assert!(db.retrieve_from_store("blocks", location).unwrap_err().is_not_found());
    }
    assert!(!flat_file(dir.path(), "blocks", checkpoint.file_number + 1).exists());
    assert!(!flat_file(dir.path(), "blocks", checkpoint.file_number + 3).exists());
}

#[test]
fn transaction_rollback_restores_store_location() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.append_to_store("blocks", b"genesis").unwrap();
    let l0 = db.current_location("blocks").unwrap();

    let mut tx = db.begin().unwrap();
    let l1 = tx.append_to_store("blocks", b"first").unwrap();
    let l2 = tx.append_to_store("blocks", b"second").unwrap();
    assert_eq!(tx.retrieve_from_store("blocks", &l2).unwrap(), b"second");
    tx.rollback().unwrap();
    drop(tx);

    assert_eq!(db.current_location("blocks").unwrap(), l0);
    assert!(db.retrieve_from_store("blocks", &l1).unwrap_err().is_not_found());
    assert!(db.retrieve_from_store("blocks", &l2).unwrap_err().is_not_found());
}

#[test]
fn rollback_covers_every_touched_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let blocks_before = db.current_location("blocks").unwrap();
    let headers_before = db.current_location("headers").unwrap();

    let mut tx = db.begin().unwrap();
    tx.append_to_store("blocks", b"body").unwrap();
    tx.append_to_store("headers", b"header").unwrap();
    tx.put(&Bucket::new(["index"]).key("h"), b"1").unwrap();
    tx.rollback().unwrap();
    drop(tx);

    assert_eq!(db.current_location("blocks").unwrap(), blocks_before);
    assert_eq!(db.current_location("headers").unwrap(), headers_before);
    assert!(!db.has(&Bucket::new(["index"]).key("h")).unwrap());
}

#[test]
fn dropped_transaction_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let before = db.current_location("blocks").unwrap();
    let key = Bucket::new(["index"]).key("dropped");

    {
        let mut tx = db.begin().unwrap();
        tx.append_to_store("blocks", b"never committed").unwrap();
        tx.put(&key, b"x").unwrap();
    }

    assert_eq!(db.current_location("blocks").unwrap(), before);
    assert!(!db.has(&key).unwrap());
    // The writer lock was released.
    db.begin().unwrap().commit().unwrap();
}

#[test]
fn finished_transaction_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let key = Bucket::new(["a"]).key("k");

    let mut tx = db.begin().unwrap();
    tx.put(&key, b"v").unwrap();
    tx.commit().unwrap();

    assert!(tx.is_closed());
    assert!(tx.put(&key, b"w").unwrap_err().is_closed());
    assert!(tx.get(&key).unwrap_err().is_closed());
    assert!(tx.append_to_store("blocks", b"x").unwrap_err().is_closed());
    assert!(tx.commit().unwrap_err().is_closed());
    assert!(tx.rollback().unwrap_err().is_closed());
    tx.rollback_unless_closed().unwrap();
    drop(tx);

    assert_eq!(db.get(&key).unwrap(), b"v");
}

#[test]
fn finished_transaction_releases_the_writer_lock() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(open(dir.path()));

    let mut committed = db.begin().unwrap();
    committed.append_to_store("blocks", b"first").unwrap();
    committed.commit().unwrap();

    // Another writer gets in while the committed transaction is still alive.
    let (done, finished) = std::sync::mpsc::channel();
    let writer = Arc::clone(&db);
    std::thread::spawn(move || {
        let _ = done.send(writer.append_to_store("blocks", b"second").map(|_| ()));
    });
    let appended = finished.recv_timeout(std::time::Duration::from_secs(10));
    assert!(matches!(appended, Ok(Ok(()))), "second writer blocked: {appended:?}");

    // Same thread, after a rollback.
    let mut rolled_back = db.begin().unwrap();
    rolled_back.put(&Bucket::new(["a"]).key("k"), b"v").unwrap();
    rolled_back.rollback().unwrap();
    let mut next = db.begin().unwrap();
    next.put(&Bucket::new(["a"]).key("k"), b"w").unwrap();
    next.commit().unwrap();

    assert_eq!(db.get(&Bucket::new(["a"]).key("k")).unwrap(), b"w");
    drop((committed, rolled_back, next));
    db.close().unwrap();
}

#[test]
fn failed_append_rolls_the_store_back() {
    let dir = tempfile::tempdir().unwrap();
    let fail = Arc::new(AtomicBool::new(false));
    let db = Database::builder(dir.path())
        .file_system(Arc::new(FaultyFs {
            fail_appends: Arc::clone(&fail),
        }))
        .open()
        .unwrap();

    let good = db.append_to_store("blocks", b"good record").unwrap();
    let before = db.current_location("blocks").unwrap();

    fail.store(true, Ordering::SeqCst);
    let err = db.append_to_store("blocks", b"this write tears").unwrap_err();
    assert!(matches!(err, DbError::Io { .. }), "got {err}");
    fail.store(false, Ordering::SeqCst);

    // The torn half-record was cut off and the next append reuses its slot.
    assert_eq!(db.current_location("blocks").unwrap(), before);
    let next = db.append_to_store("blocks", b"after the failure").unwrap();
    assert_eq!(
        FlatFileLocation::deserialize(&next).unwrap().file_offset,
        before.file_offset
    );
    assert_eq!(db.retrieve_from_store("blocks", &good).unwrap(), b"good record");
    assert_eq!(db.retrieve_from_store("blocks", &next).unwrap(), b"after the failure");
    assert!(db.verify_store("blocks").unwrap().first_corrupt.is_none());
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[test]
fn crash_between_append_and_commit_is_reconciled() {
    let dir = tempfile::tempdir().unwrap();
    let (l_prev, l) = {
        let db = open(dir.path());
        db.append_to_store("blocks", b"committed").unwrap();
        let l_prev = db.current_location("blocks").unwrap();
        let l = db.append_to_store("blocks", b"lost in the crash").unwrap();

        // Roll the persisted cursor back as if the second commit never
        // happened; the flat file still holds the record.
        let mut tx = db.begin().unwrap();
        tx.put(&flat_files_bucket().key("blocks"), &l_prev.serialize())
            .unwrap();
        tx.commit().unwrap();
        db.close().unwrap();
        (l_prev, l)
    };

    let db = open(dir.path());
    assert_eq!(db.current_location("blocks").unwrap(), l_prev);
    assert!(db.retrieve_from_store("blocks", &l).unwrap_err().is_not_found());
    assert_eq!(
        std::fs::metadata(flat_file(dir.path(), "blocks", 0)).unwrap().len(),
        u64::from(l_prev.file_offset)
    );
}

#[test]
fn reconciliation_removes_files_past_the_persisted_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_files(32);
    let l_prev = {
        let db = open_with(dir.path(), config.clone());
        db.append_to_store("blocks", b"first file").unwrap();
        let l_prev = db.current_location("blocks").unwrap();
        for _ in 0..4 {
            db.append_to_store("blocks", b"rolled away").unwrap();
        }
        db.put(&flat_files_bucket().key("blocks"), &l_prev.serialize())
            .unwrap();
        db.close().unwrap();
        l_prev
    };
    assert!(flat_file(dir.path(), "blocks", 3).exists());

    let db = open_with(dir.path(), config);
    assert_eq!(db.current_location("blocks").unwrap(), l_prev);
    assert!(!flat_file(dir.path(), "blocks", l_prev.file_number + 1).exists());
}

#[test]
fn persisted_cursor_past_physical_end_is_unrecoverable() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path());
        db.append_to_store("blocks", b"record").unwrap();
        let ahead = FlatFileLocation::cursor(0, 10_000);
        db.put(&flat_files_bucket().key("blocks"), &ahead.serialize())
            .unwrap();
        db.close().unwrap();
    }

    let err = Database::open(dir.path()).unwrap_err();
    assert!(matches!(err, DbError::UnrecoverableCorruption(_)), "got {err}");
}

#[test]
fn persisted_cursor_past_its_own_file_keeps_later_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_files(32);
    let locations = {
        let db = open_with(dir.path(), config.clone());
        // 20-byte records: one per 32-byte file.
        let locations: Vec<_> = (0..3u8)
            .map(|i| db.append_to_store("blocks", &[i; 12]).unwrap())
            .collect();
        let bogus = FlatFileLocation::cursor(1, 500);
        db.put(&flat_files_bucket().key("blocks"), &bogus.serialize())
            .unwrap();
        db.close().unwrap();
        locations
    };

    let err = Database::builder(dir.path())
        .config(config.clone())
        .open()
        .unwrap_err();
    assert!(matches!(err, DbError::UnrecoverableCorruption(_)), "got {err}");
    assert!(flat_file(dir.path(), "blocks", 2).exists());
    assert_eq!(
        std::fs::metadata(flat_file(dir.path(), "blocks", 1)).unwrap().len(),
        20
    );

    // Repairing the cursor by hand brings every record back.
    {
        let engine = SledEngine::open(&dir.path().join("metadata")).unwrap();
        let mut fix = WriteSet::new();
        fix.put(
            flat_files_bucket().key("blocks").full_key(),
            FlatFileLocation::cursor(2, 20).serialize().to_vec(),
        );
        engine.apply(&fix).unwrap();
        engine.close().unwrap();
    }
    let db = open_with(dir.path(), config);
    for (i, location) in locations.iter().enumerate() {
        assert_eq!(db.retrieve_from_store("blocks", location).unwrap(), [i as u8; 12]);
    }
}

#[test]
fn failed_commit_orphans_appends_until_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let fail = Arc::new(AtomicBool::new(false));
    let (committed_end, orphan) = {
        let db = Database::builder(dir.path())
            .engine_opener(FailingCommitOpener {
                fail: Arc::clone(&fail),
            })
            .open()
            .unwrap();
        db.append_to_store("blocks", b"committed").unwrap();
        let committed_end = db.current_location("blocks").unwrap();

        let mut tx = db.begin().unwrap();
        let orphan = tx.append_to_store("blocks", b"orphan").unwrap();
        fail.store(true, Ordering::SeqCst);
        assert!(tx.commit().is_err());
        assert!(tx.is_closed());
        drop(tx);
        fail.store(false, Ordering::SeqCst);

        // Not rolled back: the record is still readable in this session.
        assert_eq!(db.retrieve_from_store("blocks", &orphan).unwrap(), b"orphan");
        db.close().unwrap();
        (committed_end, orphan)
    };

    let db = open(dir.path());
    assert_eq!(db.current_location("blocks").unwrap(), committed_end);
    assert!(db.retrieve_from_store("blocks", &orphan).unwrap_err().is_not_found());
}

#[test]
fn engine_corruption_is_recovered_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let key = Bucket::new(["chain"]).key("tip");
    {
        let db = open(dir.path());
        db.put(&key, b"block 42").unwrap();
        db.close().unwrap();
    }

    let opens = Arc::new(AtomicUsize::new(0));
    let recoveries = Arc::new(AtomicUsize::new(0));
    let db = Database::builder(dir.path())
        .engine_opener(CorruptOnceOpener {
            opens: Arc::clone(&opens),
            recoveries: Arc::clone(&recoveries),
        })
        .open()
        .unwrap();

    assert_eq!(opens.load(Ordering::SeqCst), 2);
    assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    assert_eq!(db.get(&key).unwrap(), b"block 42");
}

#[test]
fn database_reopens_right_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let key = Bucket::new(["chain"]).key("height");
    for height in 0..5u32 {
        let db = open(dir.path());
        if height > 0 {
            assert_eq!(db.get(&key).unwrap(), (height - 1).to_le_bytes());
        }
        db.put(&key, &height.to_le_bytes()).unwrap();
        db.close().unwrap();
    }
}

// ---------------------------------------------------------------------------
// Metadata & cursors
// ---------------------------------------------------------------------------

#[test]
fn bucket_path_composition() {
    assert_eq!(Bucket::new(["a", "b"]).path(), b"a/b/");
    assert_eq!(Bucket::new(["a"]).sub("b").path(), b"a/b/");
    assert_eq!(Bucket::new(["a", "b"]).key("k").full_key(), b"a/b/k");
}

#[test]
fn cursor_walks_one_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let tips = Bucket::new(["dag", "tips"]);
    for (k, v) in [("c", "3"), ("a", "1"), ("b", "2")] {
        db.put(&tips.key(k), v.as_bytes()).unwrap();
    }
    db.put(&Bucket::new(["dag"]).key("other"), b"x").unwrap();

    let mut cursor = db.cursor(&tips).unwrap();
    let mut seen = Vec::new();
    let mut more = cursor.first().unwrap();
    while more {
        seen.push((cursor.key().unwrap().suffix().to_vec(), cursor.value().unwrap().to_vec()));
        more = cursor.next().unwrap();
    }
    assert_eq!(
        seen,
        [
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );
}

#[test]
fn cursor_sees_keys_committed_while_it_iterates() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let tips = Bucket::new(["dag", "tips"]);
    db.put(&tips.key("a"), b"1").unwrap();

    let mut cursor = db.cursor(&tips).unwrap();
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.key().unwrap().suffix(), b"a");

    // Written behind the cursor's position and ahead of it.
    db.put(&tips.key("0"), b"0").unwrap();
    db.put(&tips.key("b"), b"2").unwrap();

    assert!(cursor.next().unwrap());
    assert_eq!(cursor.key().unwrap().suffix(), b"b");
    assert!(!cursor.next().unwrap());
}

#[test]
fn closed_cursor_asymmetry() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let bucket = Bucket::new(["a"]);
    db.put(&bucket.key("k"), b"v").unwrap();

    let mut cursor = db.cursor(&bucket).unwrap();
    cursor.close().unwrap();

    assert!(!cursor.first().unwrap());
    assert!(!cursor.next().unwrap());
    assert!(cursor.key().unwrap_err().is_closed());
    assert!(cursor.value().unwrap_err().is_closed());
    assert!(cursor.seek(&bucket.key("k")).unwrap_err().is_closed());
    assert!(cursor.close().unwrap_err().is_closed());
}

#[test]
fn transaction_cursor_sees_its_own_writes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let bucket = Bucket::new(["utxo"]);
    for k in ["1", "3", "5"] {
        db.put(&bucket.key(k), b"base").unwrap();
    }

    let mut tx = db.begin().unwrap();
    tx.put(&bucket.key("2"), b"pending").unwrap();
    tx.delete(&bucket.key("3")).unwrap();
    tx.put(&bucket.key("5"), b"updated").unwrap();

    let mut forward = Vec::new();
    {
        let mut cursor = tx.cursor(&bucket).unwrap();
        while cursor.next().unwrap() {
            forward.push((cursor.key().unwrap().suffix().to_vec(), cursor.value().unwrap().to_vec()));
        }
    }
    assert_eq!(
        forward,
        [
            (b"1".to_vec(), b"base".to_vec()),
            (b"2".to_vec(), b"pending".to_vec()),
            (b"5".to_vec(), b"updated".to_vec()),
        ]
    );

    let mut backward = Vec::new();
    {
        let mut cursor = tx.cursor(&bucket).unwrap();
        while cursor.prev().unwrap() {
            backward.push(cursor.key().unwrap().suffix().to_vec());
        }
    }
    assert_eq!(backward, [b"5".to_vec(), b"2".to_vec(), b"1".to_vec()]);

    // Outside the transaction the base is untouched.
    let mut cursor = db.cursor(&bucket).unwrap();
    cursor.seek(&bucket.key("3")).unwrap();
    assert_eq!(cursor.value().unwrap(), b"base");
}

#[test]
fn generic_code_runs_against_database_and_transaction() {
    fn index_block(accessor: &mut impl DataAccessor, hash: &str, body: &[u8]) -> DbResult<()> {
        let location = accessor.append_to_store("blocks", body)?;
        accessor.put(&Bucket::new(["block-index"]).key(hash), &location)
    }

    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());
    index_block(&mut db, "h1", b"body one").unwrap();
    {
        let mut tx = db.begin().unwrap();
        index_block(&mut tx, "h2", b"body two").unwrap();
        tx.commit().unwrap();
    }

    for (hash, body) in [("h1", b"body one"), ("h2", b"body two")] {
        let location = db.get(&Bucket::new(["block-index"]).key(hash)).unwrap();
        assert_eq!(db.retrieve_from_store("blocks", &location).unwrap(), body);
    }
}

// ---------------------------------------------------------------------------
// Pruning, verification, lifecycle
// ---------------------------------------------------------------------------

#[test]
fn pruning_and_verification() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_with(dir.path(), small_files(32));
    let locations: Vec<_> = (0..10u8)
        .map(|i| db.append_to_store("blocks", &[i; 16]).unwrap())
        .collect();
    let last_file = db.current_location("blocks").unwrap().file_number;
    assert!(last_file >= 9);

    let preserved: HashSet<u32> = [1].into_iter().collect();
    db.delete_store_files_up_to("blocks", 5, &preserved).unwrap();

    assert!(!flat_file(dir.path(), "blocks", 0).exists());
    assert!(flat_file(dir.path(), "blocks", 1).exists());
    assert!(!flat_file(dir.path(), "blocks", 4).exists());
    assert!(flat_file(dir.path(), "blocks", 5).exists());

    assert_eq!(db.retrieve_from_store("blocks", &locations[9]).unwrap(), [9u8; 16]);
    let report = db.verify_store("blocks").unwrap();
    assert_eq!(report.files, 6);
    assert_eq!(report.records, 6);
    assert!(report.first_corrupt.is_none());
}

#[test]
fn invalid_store_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    for name in ["", "..", "../escape", "a/b"] {
        let err = db.append_to_store(name, b"x").unwrap_err();
        assert!(matches!(err, DbError::InvalidStoreName(_)), "accepted {name:?}");
    }
}

#[test]
fn closed_database_rejects_everything() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let key = Bucket::new(["a"]).key("k");
    db.put(&key, b"v").unwrap();
    db.close().unwrap();

    assert!(db.get(&key).unwrap_err().is_closed());
    assert!(db.append_to_store("blocks", b"x").unwrap_err().is_closed());
    assert!(db.begin().err().unwrap().is_closed());
    assert!(db.close().unwrap_err().is_closed());
}

#[test]
fn concurrent_readers_during_appends() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(open_with(dir.path(), small_files(256)));
    let seeded: Vec<_> = (0..64u32)
        .map(|i| db.append_to_store("blocks", &i.to_le_bytes()).unwrap())
        .collect();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let db = Arc::clone(&db);
            let seeded = &seeded;
            scope.spawn(move || {
                for _ in 0..10 {
                    for (i, location) in seeded.iter().enumerate() {
                        let payload = db.retrieve_from_store("blocks", location).unwrap();
                        assert_eq!(payload, (i as u32).to_le_bytes());
                    }
                }
            });
        }
        let db = Arc::clone(&db);
        scope.spawn(move || {
            for i in 0..64u32 {
                db.append_to_store("blocks", &(1000 + i).to_le_bytes()).unwrap();
            }
        });
    });

    assert!(db.verify_store("blocks").unwrap().records >= 128);
}
