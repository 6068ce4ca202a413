//! # Database Errors
//!
//! A single error type for every layer of the storage engine. Callers
//! mostly ask whether something was missing, closed or corrupt, so those
//! questions get predicate helpers instead of a `match` at every call site.
//!
//! Disk-full has no variant: it never reaches a caller. See
//! [`crate::flatfile::store`] for how it is handled.

use std::io;

use crate::flatfile::FlatFileLocation;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A key, cursor position, or flat-file location does not exist (or is
    /// not yet visible behind the write cursor).
    #[error("not found: {0}")]
    NotFound(String),

    /// A flat-file record failed its CRC check or its length framing.
    #[error("checksum mismatch in store '{store}' at {location}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        store: String,
        location: FlatFileLocation,
        expected: u32,
        actual: u32,
    },

    /// Operation on a cursor, transaction, store, or database that has
    /// already been closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// OS-level failure, with a human-readable description of what we were
    /// doing when it happened.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The persisted write cursor of a store points past the physical end of
    /// its files. Nothing can safely be done about this automatically.
    #[error("unrecoverable corruption: {0}")]
    UnrecoverableCorruption(String),

    /// The embedded key-value engine reported an error.
    #[error("sled error: {0}")]
    Engine(#[from] sled::Error),

    /// Opening the metadata engine failed, one recovery pass was attempted,
    /// and that failed too. Both errors are kept.
    #[error("{original} (recovery failed: {recovery})")]
    RecoveryFailed {
        original: Box<DbError>,
        recovery: Box<DbError>,
    },

    /// A serialized flat-file location had the wrong width.
    #[error("invalid flat-file location: expected {expected} bytes, got {actual}")]
    InvalidLocation { expected: usize, actual: usize },

    /// Rollback target is ahead of the current write cursor.
    #[error("cannot roll store '{store}' back to {target}: write cursor is at {current}")]
    InvalidRollback {
        store: String,
        target: FlatFileLocation,
        current: FlatFileLocation,
    },

    #[error("invalid store name: {0:?}")]
    InvalidStoreName(String),

    /// A single record can never fit in one flat file.
    #[error("record of {size} bytes exceeds the maximum flat-file size of {max} bytes")]
    RecordTooLarge { size: u64, max: u32 },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// Wrap an I/O error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        DbError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        DbError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DbError::Closed(_))
    }

    /// True for any error that means on-disk data can no longer be trusted,
    /// including corruption reported by the metadata engine itself.
    pub fn is_corruption(&self) -> bool {
        match self {
            DbError::ChecksumMismatch { .. } | DbError::UnrecoverableCorruption(_) => true,
            DbError::Engine(sled::Error::Corruption { .. }) => true,
            DbError::RecoveryFailed { original, .. } => original.is_corruption(),
            _ => false,
        }
    }
}
