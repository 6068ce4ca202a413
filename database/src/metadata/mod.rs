//! # Metadata Store
//!
//! Small keyed records (indexes, per-store write cursors, chain state) live
//! in an embedded sorted key-value engine. Every key the engine sees is a
//! bucket-qualified full key, see [`crate::bucket`].
//!
//! ```text
//! engine.rs     KvEngine / EngineOpener seam, sled implementation
//! write_set.rs  sorted pending mutations of a transaction
//! cursor.rs     bucket cursors with pending-write overlay
//! ```
//!
//! Writes outside a transaction are applied one at a time. Inside a
//! [`MetadataTransaction`] they are buffered and applied as a single atomic
//! batch on commit.

pub mod cursor;
pub mod engine;
pub mod write_set;

pub use cursor::Cursor;
pub use engine::{EngineOpener, Entry, KvEngine, SledEngine, SledOpener};
pub use write_set::WriteSet;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Span;

use crate::bucket::{Bucket, Key};
use crate::error::{DbError, DbResult};

/// The metadata half of the database.
pub struct MetadataStore {
    path: PathBuf,
    engine: Box<dyn KvEngine>,
    span: Span,
    closed: AtomicBool,
}

impl MetadataStore {
    /// Open the engine at `path`.
    ///
    /// If the engine reports corruption, the opener gets exactly one
    /// recovery pass followed by a second open attempt. When that fails as
    /// well, both the original and the recovery error are returned.
    pub fn open(path: &Path, opener: &dyn EngineOpener, parent: &Span) -> DbResult<Self> {
        let span = tracing::info_span!(parent: parent, "metadata");
        let engine = match opener.open(path) {
            Ok(engine) => engine,
            Err(original) if original.is_corruption() => {
                tracing::warn!(
                    parent: &span,
                    path = %path.display(),
                    error = %original,
                    "metadata engine reported corruption, attempting recovery"
                );
                match opener.recover(path).and_then(|()| opener.open(path)) {
                    Ok(engine) => {
                        tracing::info!(parent: &span, "metadata engine recovered");
                        engine
                    }
                    Err(recovery) => {
                        tracing::error!(parent: &span, error = %recovery, "metadata engine recovery failed");
                        return Err(DbError::RecoveryFailed {
                            original: Box::new(original),
                            recovery: Box::new(recovery),
                        });
                    }
                }
            }
            Err(err) => return Err(err),
        };

        tracing::debug!(parent: &span, path = %path.display(), "metadata store opened");
        Ok(Self {
            path: path.to_path_buf(),
            engine,
            span,
            closed: AtomicBool::new(false),
        })
    }

    /// Wrap an already-open engine.
    pub fn with_engine(engine: Box<dyn KvEngine>, parent: &Span) -> Self {
        Self {
            path: PathBuf::new(),
            engine,
            span: tracing::info_span!(parent: parent, "metadata"),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn put(&self, key: &Key, value: &[u8]) -> DbResult<()> {
        self.ensure_open()?;
        let mut batch = WriteSet::new();
        batch.put(key.full_key(), value.to_vec());
        self.engine.apply(&batch)
    }

    /// Value stored under `key`, or `NotFound`.
    pub fn get(&self, key: &Key) -> DbResult<Vec<u8>> {
        self.ensure_open()?;
        self.engine
            .get(&key.full_key())?
            .ok_or_else(|| DbError::not_found(format!("key {key}")))
    }

    pub fn has(&self, key: &Key) -> DbResult<bool> {
        self.ensure_open()?;
        self.engine.contains(&key.full_key())
    }

    /// Remove `key`. Removing a missing key is not an error.
    pub fn delete(&self, key: &Key) -> DbResult<()> {
        self.ensure_open()?;
        let mut batch = WriteSet::new();
        batch.delete(key.full_key());
        self.engine.apply(&batch)
    }

    pub fn cursor(&self, bucket: &Bucket) -> DbResult<Cursor<'_>> {
        self.ensure_open()?;
        Ok(Cursor::new(self.engine.as_ref(), None, bucket))
    }

    pub fn begin(&self) -> DbResult<MetadataTransaction<'_>> {
        self.ensure_open()?;
        Ok(MetadataTransaction {
            store: self,
            writes: WriteSet::new(),
            closed: false,
        })
    }

    pub fn flush(&self) -> DbResult<()> {
        self.ensure_open()?;
        self.engine.flush()
    }

    /// Flush and release the engine. Closing twice is an error.
    pub fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DbError::Closed("metadata store"));
        }
        self.engine.close()?;
        tracing::info!(parent: &self.span, "metadata store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::Closed("metadata store"));
        }
        Ok(())
    }
}

impl fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Buffered metadata writes, applied atomically on [`commit`].
///
/// Reads see the transaction's own pending writes first.
///
/// [`commit`]: MetadataTransaction::commit
pub struct MetadataTransaction<'a> {
    store: &'a MetadataStore,
    writes: WriteSet,
    closed: bool,
}

impl<'a> MetadataTransaction<'a> {
    pub fn put(&mut self, key: &Key, value: &[u8]) -> DbResult<()> {
        self.ensure_open()?;
        self.writes.put(key.full_key(), value.to_vec());
        Ok(())
    }

    pub fn get(&self, key: &Key) -> DbResult<Vec<u8>> {
        self.ensure_open()?;
        let full = key.full_key();
        match self.writes.get(&full) {
            Some(Some(value)) => Ok(value.to_vec()),
            Some(None) => Err(DbError::not_found(format!("key {key}"))),
            None => self.store.get(key),
        }
    }

    pub fn has(&self, key: &Key) -> DbResult<bool> {
        self.ensure_open()?;
        match self.writes.get(&key.full_key()) {
            Some(pending) => Ok(pending.is_some()),
            None => self.store.has(key),
        }
    }

    pub fn delete(&mut self, key: &Key) -> DbResult<()> {
        self.ensure_open()?;
        self.writes.delete(key.full_key());
        Ok(())
    }

    /// Cursor over `bucket` that sees this transaction's pending writes.
    pub fn cursor(&self, bucket: &Bucket) -> DbResult<Cursor<'_>> {
        self.ensure_open()?;
        self.store.ensure_open()?;
        Ok(Cursor::new(self.store.engine.as_ref(), Some(&self.writes), bucket))
    }

    /// Number of keys touched so far.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }

    /// Apply every pending write atomically. The transaction is closed
    /// afterwards whether or not the apply succeeded.
    pub fn commit(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.closed = true;
        self.store.ensure_open()?;
        if self.writes.is_empty() {
            return Ok(());
        }
        let result = self.store.engine.apply(&self.writes);
        self.writes.clear();
        result
    }

    /// Discard every pending write.
    pub fn rollback(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.closed = true;
        self.writes.clear();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::Closed("transaction"));
        }
        Ok(())
    }
}
