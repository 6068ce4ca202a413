//! # Database Facade
//!
//! [`Database`] ties the metadata store and the flat-file stores together
//! and owns the single writer lock.
//!
//! ## Directory Layout
//!
//! ```text
//! <path>/
//! ├── metadata/                 sled engine
//! ├── blocks-000000000.fdb      flat-file store "blocks"
//! ├── blocks-000000001.fdb
//! └── headers-000000000.fdb     flat-file store "headers"
//! ```
//!
//! ## Reconciliation
//!
//! The metadata bucket `flat-files/` holds, for every store, the write
//! cursor as of the last committed transaction. On open each recorded store
//! is compared with what is physically on disk:
//!
//! | persisted vs. physical | action                                       |
//! |------------------------|----------------------------------------------|
//! | equal                  | nothing                                      |
//! | behind                 | roll the store back to the persisted cursor  |
//! | ahead                  | fail with `UnrecoverableCorruption`          |
//!
//! "Behind" is the normal leftover of a crash between a flat-file append and
//! its metadata commit. "Ahead" means committed data is missing.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Span;

use crate::bucket::{flat_files_bucket, Bucket, Key};
use crate::config::{DatabaseConfig, METADATA_DIR};
use crate::error::{DbError, DbResult};
use crate::flatfile::{FileSystem, FlatFileDb, FlatFileLocation, OsFileSystem, SerializedLocation, StoreReport};
use crate::metadata::{Cursor, EngineOpener, MetadataStore, SledOpener};
use crate::transaction::{retrieve, DataAccessor, Transaction};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and opens a [`Database`].
pub struct DatabaseBuilder {
    path: PathBuf,
    config: DatabaseConfig,
    fs: Arc<dyn FileSystem>,
    opener: Box<dyn EngineOpener>,
    span: Option<Span>,
}

impl DatabaseBuilder {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            config: DatabaseConfig::default(),
            fs: Arc::new(OsFileSystem),
            opener: Box::new(SledOpener),
            span: None,
        }
    }

    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    /// File system used by the flat-file stores.
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Opener for the metadata engine.
    pub fn engine_opener(mut self, opener: impl EngineOpener + 'static) -> Self {
        self.opener = Box::new(opener);
        self
    }

    /// Span every log line of this database is emitted under. Defaults to
    /// a root `database` span.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Open both stores and reconcile them.
    pub fn open(self) -> DbResult<Database> {
        self.config.validate()?;
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("database", path = %self.path.display()));

        self.fs
            .create_dir_all(&self.path)
            .map_err(|e| DbError::io(format!("failed to create {}", self.path.display()), e))?;

        let metadata = MetadataStore::open(&self.path.join(METADATA_DIR), self.opener.as_ref(), &span)?;
        let flat_files = FlatFileDb::new(&self.path, self.config.clone(), Arc::clone(&self.fs), &span);

        let db = Database {
            path: self.path,
            config: self.config,
            metadata,
            flat_files,
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
            span,
        };
        let stores = db.reconcile()?;
        tracing::info!(parent: &db.span, stores, "database opened");
        Ok(db)
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// The storage engine: metadata store plus named flat-file stores.
///
/// Share it across threads behind an `Arc`. Reads run concurrently; write
/// transactions are serialized.
pub struct Database {
    path: PathBuf,
    config: DatabaseConfig,
    metadata: MetadataStore,
    flat_files: FlatFileDb,
    writer: Mutex<()>,
    closed: AtomicBool,
    span: Span,
}

impl Database {
    /// Open (creating if needed) the database at `path` with defaults.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::builder(path).open()
    }

    pub fn builder(path: impl AsRef<Path>) -> DatabaseBuilder {
        DatabaseBuilder::new(path.as_ref())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    // -- Metadata -----------------------------------------------------------

    pub fn put(&self, key: &Key, value: &[u8]) -> DbResult<()> {
        self.ensure_open()?;
        self.metadata.put(key, value)
    }

    pub fn get(&self, key: &Key) -> DbResult<Vec<u8>> {
        self.ensure_open()?;
        self.metadata.get(key)
    }

    pub fn has(&self, key: &Key) -> DbResult<bool> {
        self.ensure_open()?;
        self.metadata.has(key)
    }

    pub fn delete(&self, key: &Key) -> DbResult<()> {
        self.ensure_open()?;
        self.metadata.delete(key)
    }

    /// Cursor over the committed keys of `bucket`.
    ///
    /// Every step reads the engine afresh rather than a snapshot taken at
    /// creation. A cursor that is iterating while another thread commits
    /// can see some of that commit's writes and miss others. Order is
    /// always ascending, and a key is never yielded twice.
    pub fn cursor(&self, bucket: &Bucket) -> DbResult<Cursor<'_>> {
        self.ensure_open()?;
        self.metadata.cursor(bucket)
    }

    /// Start a write transaction, waiting for the current one to finish.
    ///
    /// Calling this while the same thread still holds an open transaction
    /// deadlocks.
    pub fn begin(&self) -> DbResult<Transaction<'_>> {
        self.ensure_open()?;
        let writer = self.writer.lock();
        // Closed while we waited for the lock.
        self.ensure_open()?;
        let metadata = self.metadata.begin()?;
        Ok(Transaction::new(metadata, &self.flat_files, writer, &self.span))
    }

    // -- Flat files ---------------------------------------------------------

    /// Append `data` to a store in a transaction of its own.
    pub fn append_to_store(&self, store_name: &str, data: &[u8]) -> DbResult<SerializedLocation> {
        let mut tx = self.begin()?;
        let location = tx.append_to_store(store_name, data)?;
        tx.commit()?;
        Ok(location)
    }

    pub fn retrieve_from_store(&self, store_name: &str, location: &[u8]) -> DbResult<Vec<u8>> {
        self.ensure_open()?;
        retrieve(&self.flat_files, store_name, location)
    }

    /// The store's in-memory write cursor.
    pub fn current_location(&self, store_name: &str) -> DbResult<FlatFileLocation> {
        self.ensure_open()?;
        self.flat_files.current_location(store_name)
    }

    /// Names of every store with a committed write cursor, sorted.
    pub fn store_names(&self) -> DbResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.persisted_locations()?.into_iter().map(|(name, _)| name).collect())
    }

    /// Prune whole files below `min_file_to_keep`, except `preserved` ones.
    pub fn delete_store_files_up_to(
        &self,
        store_name: &str,
        min_file_to_keep: u32,
        preserved: &HashSet<u32>,
    ) -> DbResult<()> {
        self.ensure_open()?;
        self.flat_files
            .delete_up_to_file(store_name, min_file_to_keep, preserved)
    }

    /// Walk every record of a store and check its framing and checksum.
    pub fn verify_store(&self, store_name: &str) -> DbResult<StoreReport> {
        self.ensure_open()?;
        self.flat_files.verify(store_name)
    }

    /// Close both stores. Waits for an in-flight transaction to finish.
    /// Closing twice is an error.
    pub fn close(&self) -> DbResult<()> {
        let _writer = self.writer.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DbError::Closed("database"));
        }
        let flat_result = self.flat_files.close();
        let metadata_result = self.metadata.close();
        tracing::info!(parent: &self.span, "database closed");
        flat_result.and(metadata_result)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -- Internals ----------------------------------------------------------

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::Closed("database"));
        }
        Ok(())
    }

    /// Every store name and write cursor recorded in the `flat-files/`
    /// bucket, in name order.
    fn persisted_locations(&self) -> DbResult<Vec<(String, FlatFileLocation)>> {
        let mut cursor = self.metadata.cursor(&flat_files_bucket())?;
        let mut out = Vec::new();
        while cursor.next()? {
            let key = cursor.key()?;
            let name = String::from_utf8(key.suffix().to_vec()).map_err(|_| {
                DbError::UnrecoverableCorruption(format!("store name {key} in metadata is not UTF-8"))
            })?;
            let location = FlatFileLocation::deserialize(cursor.value()?)?;
            out.push((name, location));
        }
        Ok(out)
    }

    /// Bring every recorded store in line with its persisted cursor.
    fn reconcile(&self) -> DbResult<usize> {
        let persisted = self.persisted_locations()?;
        let count = persisted.len();

        for (name, persisted) in persisted {
            let store = self.flat_files.store(&name)?;
            let physical = store.scan_physical_end()?;
            match persisted.cmp_position(&physical) {
                CmpOrdering::Equal => {
                    tracing::debug!(parent: &self.span, store = %name, location = %persisted, "store consistent");
                }
                CmpOrdering::Less => {
                    tracing::info!(
                        parent: &self.span,
                        store = %name,
                        persisted = %persisted,
                        physical = %physical,
                        "discarding uncommitted flat-file tail"
                    );
                    store.rollback(persisted)?;
                }
                CmpOrdering::Greater => {
                    tracing::error!(
                        parent: &self.span,
                        store = %name,
                        persisted = %persisted,
                        physical = %physical,
                        "persisted write cursor is past the end of the store's files"
                    );
                    return Err(DbError::UnrecoverableCorruption(format!(
                        "store '{name}': persisted location {persisted} is past physical end {physical}"
                    )));
                }
            }
        }
        Ok(count)
    }
}

impl DataAccessor for Database {
    fn put(&mut self, key: &Key, value: &[u8]) -> DbResult<()> {
        Database::put(self, key, value)
    }

    fn get(&self, key: &Key) -> DbResult<Vec<u8>> {
        Database::get(self, key)
    }

    fn has(&self, key: &Key) -> DbResult<bool> {
        Database::has(self, key)
    }

    fn delete(&mut self, key: &Key) -> DbResult<()> {
        Database::delete(self, key)
    }

    fn append_to_store(&mut self, store_name: &str, data: &[u8]) -> DbResult<SerializedLocation> {
        Database::append_to_store(self, store_name, data)
    }

    fn retrieve_from_store(&self, store_name: &str, location: &[u8]) -> DbResult<Vec<u8>> {
        Database::retrieve_from_store(self, store_name, location)
    }

    fn cursor(&self, bucket: &Bucket) -> DbResult<Cursor<'_>> {
        Database::cursor(self, bucket)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
