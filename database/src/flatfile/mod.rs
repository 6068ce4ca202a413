//! # Flat Files
//!
//! Large immutable records (block bodies and the like) live in append-only
//! flat files rather than in the metadata engine. This module holds the
//! registry of named stores; each store owns its own numbered file sequence
//! and write cursor.
//!
//! ```text
//! fs.rs        file-system seam (OS implementation + trait for tests)
//! cache.rs     LRU cache of read-only handles
//! location.rs  record locations and their 12-byte serialized form
//! store.rs     a single named store: write, read, rollback, prune
//! ```

pub mod cache;
pub mod fs;
pub mod location;
pub mod store;

pub use fs::{FileSystem, OsFileSystem, StoreFile};
pub use location::{FlatFileLocation, SerializedLocation};
pub use store::{FlatFileStore, StoreReport};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Span;

use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};

/// Store names become part of file names, so they must be a single plain
/// path component.
pub fn validate_store_name(name: &str) -> DbResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(DbError::InvalidStoreName(name.to_string()));
    }
    Ok(())
}

#[derive(Default)]
struct Registry {
    stores: HashMap<String, Arc<FlatFileStore>>,
    closed: bool,
}

/// Every flat-file store under one directory, opened on first use.
pub struct FlatFileDb {
    directory: PathBuf,
    config: DatabaseConfig,
    fs: Arc<dyn FileSystem>,
    span: Span,
    registry: RwLock<Registry>,
}

impl FlatFileDb {
    pub fn new(
        directory: &Path,
        config: DatabaseConfig,
        fs: Arc<dyn FileSystem>,
        parent: &Span,
    ) -> Self {
        Self {
            directory: directory.to_path_buf(),
            config,
            fs,
            span: tracing::debug_span!(parent: parent, "flat_files"),
            registry: RwLock::new(Registry::default()),
        }
    }

    /// The store named `name`, opening it (and creating its directory) the
    /// first time it is asked for.
    pub fn store(&self, name: &str) -> DbResult<Arc<FlatFileStore>> {
        {
            let registry = self.registry.read();
            if registry.closed {
                return Err(DbError::Closed("flat-file database"));
            }
            if let Some(store) = registry.stores.get(name) {
                return Ok(Arc::clone(store));
            }
        }

        let mut registry = self.registry.write();
        if registry.closed {
            return Err(DbError::Closed("flat-file database"));
        }
        if let Some(store) = registry.stores.get(name) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(FlatFileStore::open(
            &self.directory,
            name,
            &self.config,
            Arc::clone(&self.fs),
            &self.span,
        )?);
        registry.stores.insert(name.to_string(), Arc::clone(&store));
        tracing::debug!(parent: &self.span, store = name, "opened flat-file store");
        Ok(store)
    }

    pub fn write(&self, store_name: &str, data: &[u8]) -> DbResult<FlatFileLocation> {
        self.store(store_name)?.write(data)
    }

    pub fn read(&self, store_name: &str, location: FlatFileLocation) -> DbResult<Vec<u8>> {
        self.store(store_name)?.read(location)
    }

    pub fn current_location(&self, store_name: &str) -> DbResult<FlatFileLocation> {
        self.store(store_name)?.current_location()
    }

    pub fn rollback(&self, store_name: &str, target: FlatFileLocation) -> DbResult<()> {
        self.store(store_name)?.rollback(target)
    }

    pub fn delete_up_to_file(
        &self,
        store_name: &str,
        min_file_to_keep: u32,
        preserved: &HashSet<u32>,
    ) -> DbResult<()> {
        self.store(store_name)?
            .delete_up_to_file(min_file_to_keep, preserved)
    }

    pub fn verify(&self, store_name: &str) -> DbResult<StoreReport> {
        self.store(store_name)?.verify()
    }

    /// Names of the stores opened so far, sorted.
    pub fn open_store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every open store. All stores are closed even if one fails;
    /// the first failure is returned.
    pub fn close(&self) -> DbResult<()> {
        let stores = {
            let mut registry = self.registry.write();
            if registry.closed {
                return Err(DbError::Closed("flat-file database"));
            }
            registry.closed = true;
            std::mem::take(&mut registry.stores)
        };

        let mut first_err = None;
        for (name, store) in stores {
            if let Err(err) = store.close() {
                tracing::error!(parent: &self.span, store = %name, error = %err, "failed to close flat-file store");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
