//! # Storage Configuration & Constants
//!
//! On-disk naming, size limits, and the tunables a node operator may
//! override. Anything that ends up baked into file names or metadata keys
//! lives here, because changing it after data exists means a migration.

use std::path::Path;

use serde::Deserialize;

use crate::error::{DbError, DbResult};

// ---------------------------------------------------------------------------
// On-disk Layout
// ---------------------------------------------------------------------------

/// Extension of every flat file: `<store>-<9 digit number>.fdb`.
pub const FLAT_FILE_EXTENSION: &str = "fdb";

/// Width of the zero-padded file number in flat-file names.
pub const FILE_NUMBER_WIDTH: usize = 9;

/// Sub-directory of the database path holding the metadata engine.
pub const METADATA_DIR: &str = "metadata";

/// Reserved metadata bucket holding one write-cursor record per store.
pub const FLAT_FILES_BUCKET: &[u8] = b"flat-files";

/// Separator appended after every bucket segment.
pub const BUCKET_SEPARATOR: &[u8] = b"/";

/// Serialized width of a flat-file location (three big-endian u32s).
pub const LOCATION_SIZE: usize = 12;

/// Bytes of framing around every record: u32 length prefix + u32 CRC.
pub const RECORD_OVERHEAD: u32 = 8;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Read handles kept open per store before the least recently used one
/// is closed.
pub const DEFAULT_MAX_OPEN_FILES: usize = 25;

/// Maximum size of a single flat file. 512 MiB keeps the file count low
/// without making any single file unwieldy to copy or prune.
pub const DEFAULT_MAX_FILE_SIZE: u32 = 512 * 1024 * 1024;

// ---------------------------------------------------------------------------
// DatabaseConfig
// ---------------------------------------------------------------------------

/// Tunables for a [`crate::Database`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Read handles cached per flat-file store.
    pub max_open_files: usize,
    /// Size cap of each flat file; records never straddle two files.
    pub max_file_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl DatabaseConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> DbResult<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| DbError::io(format!("failed to read config {}", path.display()), e))?;
        let config: DatabaseConfig = serde_json::from_slice(&raw)
            .map_err(|e| DbError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> DbResult<()> {
        if self.max_open_files == 0 {
            return Err(DbError::Config("max_open_files must be at least 1".into()));
        }
        if self.max_file_size <= RECORD_OVERHEAD {
            return Err(DbError::Config(format!(
                "max_file_size must exceed the {RECORD_OVERHEAD}-byte record framing"
            )));
        }
        Ok(())
    }
}
