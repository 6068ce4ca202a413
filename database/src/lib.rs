// Copyright (c) 2026 Lattice Contributors. MIT License.
// See LICENSE for details.

//! # Lattice DB: Node Storage Engine
//!
//! Storage for a DAG blockchain node, split along the only line that
//! matters for performance: big immutable blobs versus small mutable
//! records.
//!
//! - **flatfile**: Append-only, checksummed, numbered files per named
//!   store. Block bodies go here. Records are addressed by a 12-byte
//!   location and never change once written.
//! - **metadata**: An embedded sorted key-value engine (sled) for indexes
//!   and state, namespaced by buckets.
//! - **transaction**: Atomic metadata batches that also cover flat-file
//!   appends by rolling the files back on abort.
//! - **db**: The facade. Opens both halves and reconciles them after an
//!   unclean shutdown.
//!
//! ## Crash Safety
//!
//! Nothing is acknowledged before it is fsynced. Every append records the
//! store's new write cursor in the metadata batch of the same transaction,
//! so the metadata always knows where the last committed record ends.
//! Anything on disk past that point is cut off the next time the database
//! opens.
//!
//! ## Example
//!
//! ```no_run
//! use lattice_db::{Bucket, DataAccessor, Database};
//!
//! # fn main() -> lattice_db::DbResult<()> {
//! let db = Database::open("/var/lib/lattice")?;
//! let index = Bucket::new(["block-index"]);
//!
//! let mut tx = db.begin()?;
//! let location = tx.append_to_store("blocks", b"block body")?;
//! tx.put(&index.key("block-hash"), &location)?;
//! tx.commit()?;
//!
//! let location = db.get(&index.key("block-hash"))?;
//! assert_eq!(db.retrieve_from_store("blocks", &location)?, b"block body");
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod config;
pub mod db;
pub mod error;
pub mod flatfile;
pub mod metadata;
pub mod transaction;

pub use bucket::{flat_files_bucket, Bucket, Key};
pub use config::DatabaseConfig;
pub use db::{Database, DatabaseBuilder};
pub use error::{DbError, DbResult};
pub use flatfile::{FileSystem, FlatFileLocation, OsFileSystem, SerializedLocation, StoreFile, StoreReport};
pub use metadata::{Cursor, EngineOpener, KvEngine, SledEngine, SledOpener, WriteSet};
pub use transaction::{DataAccessor, Transaction};
