//! Flat-file locations: where a record lives, and the fixed 12-byte form
//! handed to callers.
//!
//! ```text
//! ┌────────────────┬────────────────┬────────────────┐
//! │ file no. (4B)  │ offset (4B)    │ length (4B)    │   all big-endian
//! └────────────────┴────────────────┴────────────────┘
//! ```
//!
//! Big-endian so that serialized locations of one store sort in write order.
//! The length is the full on-disk record length, framing included. A write
//! cursor is a location with a length of zero.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::config::LOCATION_SIZE;
use crate::error::{DbError, DbResult};

/// Opaque serialized location as returned by `append_to_store`.
pub type SerializedLocation = [u8; LOCATION_SIZE];

/// Position of a record (or of a write cursor) inside a flat-file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct FlatFileLocation {
    pub file_number: u32,
    pub file_offset: u32,
    pub data_length: u32,
}

impl FlatFileLocation {
    pub fn new(file_number: u32, file_offset: u32, data_length: u32) -> Self {
        Self {
            file_number,
            file_offset,
            data_length,
        }
    }

    /// A write-cursor position: file and offset, no length.
    pub fn cursor(file_number: u32, file_offset: u32) -> Self {
        Self::new(file_number, file_offset, 0)
    }

    pub fn serialize(&self) -> SerializedLocation {
        let mut out = [0u8; LOCATION_SIZE];
        out[0..4].copy_from_slice(&self.file_number.to_be_bytes());
        out[4..8].copy_from_slice(&self.file_offset.to_be_bytes());
        out[8..12].copy_from_slice(&self.data_length.to_be_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> DbResult<Self> {
        let bytes: &SerializedLocation =
            bytes.try_into().map_err(|_| DbError::InvalidLocation {
                expected: LOCATION_SIZE,
                actual: bytes.len(),
            })?;
        let word = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self::new(word(0), word(4), word(8)))
    }

    /// Compare only the (file, offset) position, ignoring the length.
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        (self.file_number, self.file_offset).cmp(&(other.file_number, other.file_offset))
    }

    /// Offset one past the last byte of the record.
    pub fn end_offset(&self) -> u64 {
        u64::from(self.file_offset) + u64::from(self.data_length)
    }
}

impl fmt::Display for FlatFileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}+{}",
            self.file_number, self.file_offset, self.data_length
        )
    }
}
