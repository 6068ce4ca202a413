//! # Transactions
//!
//! A [`Transaction`] spans both halves of the database. Metadata writes are
//! buffered and applied atomically on commit. Flat-file appends cannot wait
//! for that: they hit disk immediately, and the transaction instead
//! remembers where each touched store stood before its first append so
//! that a rollback can cut the files back.
//!
//! ## Appending
//!
//! Every append, transactional or not, runs the same protocol:
//!
//! ```text
//! 1. previous = store.current_location()
//! 2. location = store.write(data)
//! 3. current  = store.current_location()
//! 4. record current under "flat-files/<store>" in the metadata write set
//! on failure of 2..4: store.rollback(previous), immediately
//! ```
//!
//! Step 4 is what reconciliation trusts on the next open. If the metadata
//! commit never happens, the appended tail is cut off at startup.

use std::collections::HashMap;

use parking_lot::MutexGuard;
use tracing::Span;

use crate::bucket::{flat_files_bucket, Bucket, Key};
use crate::error::{DbError, DbResult};
use crate::flatfile::{FlatFileDb, FlatFileLocation, SerializedLocation};
use crate::metadata::{Cursor, MetadataTransaction};

/// Read/write surface shared by [`crate::Database`] and [`Transaction`].
pub trait DataAccessor {
    fn put(&mut self, key: &Key, value: &[u8]) -> DbResult<()>;

    /// Value stored under `key`, or `NotFound`.
    fn get(&self, key: &Key) -> DbResult<Vec<u8>>;

    fn has(&self, key: &Key) -> DbResult<bool>;

    /// Remove `key`; a missing key is not an error.
    fn delete(&mut self, key: &Key) -> DbResult<()>;

    /// Append `data` to the named flat-file store and return its serialized
    /// location.
    fn append_to_store(&mut self, store_name: &str, data: &[u8]) -> DbResult<SerializedLocation>;

    /// Read back a record using a location returned by `append_to_store`.
    fn retrieve_from_store(&self, store_name: &str, location: &[u8]) -> DbResult<Vec<u8>>;

    fn cursor(&self, bucket: &Bucket) -> DbResult<Cursor<'_>>;
}

/// Append `data` and hand the store's new write cursor to `record`.
///
/// On any failure after the store's location was captured, the store is
/// rolled back to it before the error is returned.
pub(crate) fn append_and_record<F>(
    flat_files: &FlatFileDb,
    store_name: &str,
    data: &[u8],
    record: F,
    span: &Span,
) -> DbResult<FlatFileLocation>
where
    F: FnOnce(&Key, &[u8]) -> DbResult<()>,
{
    let previous = flat_files.current_location(store_name)?;

    let result = flat_files.write(store_name, data).and_then(|location| {
        let current = flat_files.current_location(store_name)?;
        record(&flat_files_bucket().key(store_name), &current.serialize())?;
        Ok(location)
    });

    if let Err(err) = &result {
        tracing::warn!(parent: span, store = store_name, to = %previous, error = %err, "append failed, rolling store back");
        if let Err(rollback_err) = flat_files.rollback(store_name, previous) {
            tracing::error!(
                parent: span,
                store = store_name,
                to = %previous,
                error = %rollback_err,
                "failed to roll back flat-file store after failed append"
            );
        }
    }
    result
}

pub(crate) fn retrieve(flat_files: &FlatFileDb, store_name: &str, location: &[u8]) -> DbResult<Vec<u8>> {
    let location = FlatFileLocation::deserialize(location)?;
    flat_files.read(store_name, location)
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A write transaction over the whole database.
///
/// Only one exists at a time; [`crate::Database::begin`] blocks until the
/// previous one is committed, rolled back, or dropped. Dropping an open
/// transaction rolls it back.
pub struct Transaction<'a> {
    metadata: MetadataTransaction<'a>,
    flat_files: &'a FlatFileDb,
    /// Location of each appended-to store before this transaction's first
    /// append to it.
    rollback_points: HashMap<String, FlatFileLocation>,
    span: Span,
    /// Held until commit or rollback, then released.
    writer: Option<MutexGuard<'a, ()>>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        metadata: MetadataTransaction<'a>,
        flat_files: &'a FlatFileDb,
        writer: MutexGuard<'a, ()>,
        parent: &Span,
    ) -> Self {
        Self {
            metadata,
            flat_files,
            rollback_points: HashMap::new(),
            span: tracing::debug_span!(parent: parent, "transaction"),
            writer: Some(writer),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.metadata.is_closed()
    }

    /// Make every buffered metadata write durable in one batch.
    ///
    /// The transaction is closed afterwards even if the commit fails. Records
    /// already appended to flat files stay on disk in that case; they are
    /// unreferenced and get cut off by reconciliation on the next open.
    pub fn commit(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        let touched: Vec<String> = self.rollback_points.drain().map(|(name, _)| name).collect();
        let result = self.metadata.commit();
        match &result {
            Ok(()) => tracing::debug!(parent: &self.span, stores = touched.len(), "transaction committed"),
            Err(err) if !touched.is_empty() => tracing::warn!(
                parent: &self.span,
                stores = ?touched,
                error = %err,
                "commit failed, flat-file appends left orphaned"
            ),
            Err(err) => tracing::debug!(parent: &self.span, error = %err, "commit failed"),
        }
        self.writer = None;
        result
    }

    /// Discard buffered metadata writes and cut every appended-to store back
    /// to where it stood before this transaction touched it.
    ///
    /// Every store is rolled back even if one fails; the first failure is
    /// returned.
    pub fn rollback(&mut self) -> DbResult<()> {
        self.metadata.rollback()?;

        let mut first_err = None;
        for (store, point) in std::mem::take(&mut self.rollback_points) {
            if let Err(err) = self.flat_files.rollback(&store, point) {
                tracing::error!(parent: &self.span, store = %store, to = %point, error = %err, "failed to roll back flat-file store");
                first_err.get_or_insert(err);
            }
        }
        self.writer = None;
        tracing::debug!(parent: &self.span, "transaction rolled back");
        first_err.map_or(Ok(()), Err)
    }

    /// Roll back if still open; a no-op on a finished transaction.
    pub fn rollback_unless_closed(&mut self) -> DbResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.rollback()
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::Closed("transaction"));
        }
        Ok(())
    }
}

impl DataAccessor for Transaction<'_> {
    fn put(&mut self, key: &Key, value: &[u8]) -> DbResult<()> {
        self.metadata.put(key, value)
    }

    fn get(&self, key: &Key) -> DbResult<Vec<u8>> {
        self.metadata.get(key)
    }

    fn has(&self, key: &Key) -> DbResult<bool> {
        self.metadata.has(key)
    }

    fn delete(&mut self, key: &Key) -> DbResult<()> {
        self.metadata.delete(key)
    }

    fn append_to_store(&mut self, store_name: &str, data: &[u8]) -> DbResult<SerializedLocation> {
        self.ensure_open()?;
        if !self.rollback_points.contains_key(store_name) {
            let before = self.flat_files.current_location(store_name)?;
            self.rollback_points.insert(store_name.to_string(), before);
        }

        let metadata = &mut self.metadata;
        let location = append_and_record(
            self.flat_files,
            store_name,
            data,
            |key, value| metadata.put(key, value),
            &self.span,
        )?;
        tracing::trace!(parent: &self.span, store = store_name, %location, "appended");
        Ok(location.serialize())
    }

    fn retrieve_from_store(&self, store_name: &str, location: &[u8]) -> DbResult<Vec<u8>> {
        self.ensure_open()?;
        retrieve(self.flat_files, store_name, location)
    }

    fn cursor(&self, bucket: &Bucket) -> DbResult<Cursor<'_>> {
        self.metadata.cursor(bucket)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.rollback_unless_closed() {
            tracing::error!(parent: &self.span, error = %err, "rollback of dropped transaction failed");
        }
    }
}
