//! # Key-Value Engine Seam
//!
//! The metadata store only needs a handful of things from its engine:
//! point reads, "first/last key inside these bounds" lookups for cursors,
//! and atomic durable batch application. [`KvEngine`] captures exactly that,
//! so tests can slot in an engine that fails on command instead of patching
//! library functions.
//!
//! The production engine is sled, using its default tree. Keys are full
//! bucket-qualified keys; sled's lexicographic ordering is the ordering
//! every cursor sees.

use std::io;
use std::ops::Bound;
use std::path::Path;
use std::time::Duration;

use parking_lot::RwLock;
use sled::{Batch, Db};

use super::write_set::{range_is_empty, WriteSet};
use crate::error::{DbError, DbResult};

/// A key-value pair returned by a range lookup.
pub type Entry = (Vec<u8>, Vec<u8>);

/// The sorted key-value engine behind the metadata store.
pub trait KvEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    fn contains(&self, key: &[u8]) -> DbResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Lowest entry inside the bounds.
    fn first_in(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> DbResult<Option<Entry>>;

    /// Highest entry inside the bounds.
    fn last_in(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> DbResult<Option<Entry>>;

    /// Apply every mutation in `batch` atomically, durable on return.
    fn apply(&self, batch: &WriteSet) -> DbResult<()>;

    /// Force everything written so far to stable storage.
    fn flush(&self) -> DbResult<()>;

    /// Flush and release the engine's on-disk resources. Later calls fail
    /// with `Closed`.
    fn close(&self) -> DbResult<()> {
        self.flush()
    }
}

/// Opens (and, when it reports corruption, repairs) an engine at a path.
pub trait EngineOpener: Send + Sync {
    fn open(&self, path: &Path) -> DbResult<Box<dyn KvEngine>>;

    /// One repair pass over the on-disk state at `path`. Must not discard
    /// committed data.
    fn recover(&self, path: &Path) -> DbResult<()>;
}

// ---------------------------------------------------------------------------
// sled
// ---------------------------------------------------------------------------

/// Attempts at taking sled's directory lock before giving up. A previous
/// instance's background flusher can hold it briefly after close.
const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// sled-backed engine.
pub struct SledEngine {
    db: RwLock<Option<Db>>,
}

impl SledEngine {
    pub fn open(path: &Path) -> DbResult<Self> {
        let mut attempt = 1;
        loop {
            match sled::Config::new().path(path).open() {
                Ok(db) => return Ok(Self::from_db(db)),
                Err(err) if is_lock_contention(&err) && attempt < LOCK_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// In-memory instance that disappears when dropped.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: Db) -> Self {
        Self {
            db: RwLock::new(Some(db)),
        }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Db) -> DbResult<T>) -> DbResult<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(DbError::Closed("metadata engine"))?;
        f(db)
    }
}

impl std::fmt::Debug for SledEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledEngine")
            .field("closed", &self.db.read().is_none())
            .finish()
    }
}

/// sled reports a held directory lock as a plain I/O error.
fn is_lock_contention(err: &sled::Error) -> bool {
    match err {
        sled::Error::Io(e) => {
            e.kind() == io::ErrorKind::WouldBlock || e.to_string().contains("could not acquire lock")
        }
        _ => false,
    }
}

impl KvEngine for SledEngine {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.with_db(|db| Ok(db.get(key)?.map(|v| v.to_vec())))
    }

    fn contains(&self, key: &[u8]) -> DbResult<bool> {
        self.with_db(|db| Ok(db.contains_key(key)?))
    }

    fn first_in(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> DbResult<Option<Entry>> {
        if range_is_empty(lower, upper) {
            return Ok(None);
        }
        self.with_db(|db| match db.range::<&[u8], _>((lower, upper)).next() {
            Some(entry) => {
                let (k, v) = entry?;
                Ok(Some((k.to_vec(), v.to_vec())))
            }
            None => Ok(None),
        })
    }

    fn last_in(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> DbResult<Option<Entry>> {
        if range_is_empty(lower, upper) {
            return Ok(None);
        }
        self.with_db(|db| match db.range::<&[u8], _>((lower, upper)).next_back() {
            Some(entry) => {
                let (k, v) = entry?;
                Ok(Some((k.to_vec(), v.to_vec())))
            }
            None => Ok(None),
        })
    }

    fn apply(&self, batch: &WriteSet) -> DbResult<()> {
        let mut sled_batch = Batch::default();
        for (key, value) in batch.iter() {
            match value {
                Some(value) => sled_batch.insert(key, value),
                None => sled_batch.remove(key),
            }
        }
        self.with_db(|db| {
            db.apply_batch(sled_batch)?;
            db.flush()?;
            Ok(())
        })
    }

    fn flush(&self) -> DbResult<()> {
        self.with_db(|db| {
            db.flush()?;
            Ok(())
        })
    }

    fn close(&self) -> DbResult<()> {
        let db = self.db.write().take().ok_or(DbError::Closed("metadata engine"))?;
        db.flush()?;
        Ok(())
    }
}

/// Opens [`SledEngine`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SledOpener;

impl EngineOpener for SledOpener {
    fn open(&self, path: &Path) -> DbResult<Box<dyn KvEngine>> {
        Ok(Box::new(SledEngine::open(path)?))
    }

    /// sled snapshots are a cache of its log and are rebuilt by replaying
    /// the log when absent, so removing them forces a full log recovery
    /// without losing anything that was flushed.
    fn recover(&self, path: &Path) -> DbResult<()> {
        let entries = std::fs::read_dir(path)
            .map_err(|e| DbError::io(format!("failed to list {}", path.display()), e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| DbError::io(format!("failed to list {}", path.display()), e))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("snap.") {
                std::fs::remove_file(entry.path()).map_err(|e| {
                    DbError::io(format!("failed to remove {}", entry.path().display()), e)
                })?;
            }
        }
        Ok(())
    }
}
