//! # Flat-File Store
//!
//! One named, append-only sequence of record files:
//!
//! ```text
//! <base>/<store>-000000000.fdb
//! <base>/<store>-000000001.fdb
//! ...
//! ```
//!
//! Every record is framed as
//!
//! ```text
//! ┌──────────────┬──────────────────────┬──────────────┐
//! │ len (4B, LE) │ payload (len bytes)  │ CRC32C (4B)  │
//! └──────────────┴──────────────────────┴──────────────┘
//! ```
//!
//! with the checksum covering the length prefix and the payload. A record
//! never straddles two files: if it would push the current file past
//! `max_file_size`, the store rolls to the next file number first.
//!
//! ## Locking
//!
//! All mutable state (the write cursor with its open write handle, plus the
//! cache of read handles) sits in one `StoreState` behind one mutex, so
//! there is no lock ordering to get wrong. Readers hold that mutex only long
//! enough to check visibility and fetch a handle; the read itself happens
//! under the handle's own shared lock. Writers hold the mutex for the whole
//! append including the fsync, which also makes them the single writer.
//!
//! ## Disk full
//!
//! Running out of space mid-append leaves the store in a state that the
//! metadata layer has not been told about. Rather than limp on, the process
//! is aborted; reconciliation on the next start cleans up.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::Span;

use super::cache::{OpenFileCache, SharedFile};
use super::fs::{FileSystem, StoreFile};
use super::location::FlatFileLocation;
use crate::config::{DatabaseConfig, FILE_NUMBER_WIDTH, FLAT_FILE_EXTENSION, RECORD_OVERHEAD};
use crate::error::{DbError, DbResult};

const LENGTH_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where the next record goes, plus the handle it will be appended through.
struct WriteCursor {
    file_number: u32,
    offset: u32,
    file: Option<Box<dyn StoreFile>>,
}

impl WriteCursor {
    fn location(&self) -> FlatFileLocation {
        FlatFileLocation::cursor(self.file_number, self.offset)
    }
}

struct StoreState {
    open_files: OpenFileCache,
    cursor: WriteCursor,
    closed: bool,
}

/// Outcome of a full scrub of one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreReport {
    pub store: String,
    pub files: usize,
    pub records: u64,
    pub bytes: u64,
    /// First record that failed verification; scanning stops there.
    pub first_corrupt: Option<FlatFileLocation>,
}

// ---------------------------------------------------------------------------
// FlatFileStore
// ---------------------------------------------------------------------------

/// An append-only, checksummed record store spread over numbered files.
pub struct FlatFileStore {
    base_path: PathBuf,
    store_name: String,
    max_file_size: u32,
    fs: Arc<dyn FileSystem>,
    span: Span,
    state: Mutex<StoreState>,
}

impl FlatFileStore {
    /// Open (or create) the store named `store_name` under `base_path`.
    ///
    /// The write cursor is placed at the end of the highest-numbered file
    /// found on disk, or at `0:0` for a brand new store.
    pub fn open(
        base_path: &Path,
        store_name: &str,
        config: &DatabaseConfig,
        fs: Arc<dyn FileSystem>,
        parent: &Span,
    ) -> DbResult<Self> {
        super::validate_store_name(store_name)?;
        config.validate()?;

        fs.create_dir_all(base_path).map_err(|e| {
            DbError::io(format!("failed to create {}", base_path.display()), e)
        })?;

        let span = tracing::debug_span!(parent: parent, "flat_file_store", store = %store_name);
        let store = Self {
            base_path: base_path.to_path_buf(),
            store_name: store_name.to_string(),
            max_file_size: config.max_file_size,
            fs,
            span,
            state: Mutex::new(StoreState {
                open_files: OpenFileCache::new(config.max_open_files),
                cursor: WriteCursor {
                    file_number: 0,
                    offset: 0,
                    file: None,
                },
                closed: false,
            }),
        };

        let physical_end = store.scan_physical_end()?;
        {
            let mut state = store.state.lock();
            state.cursor.file_number = physical_end.file_number;
            state.cursor.offset = physical_end.file_offset;
        }

        tracing::debug!(parent: &store.span, cursor = %physical_end, "flat-file store opened");
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.store_name
    }

    /// Append `data` as one record and return where it landed.
    ///
    /// Durable on return: the file is fsynced before the cursor advances.
    pub fn write(&self, data: &[u8]) -> DbResult<FlatFileLocation> {
        let full_len = u64::from(RECORD_OVERHEAD) + data.len() as u64;
        if full_len > u64::from(self.max_file_size) {
            return Err(DbError::RecordTooLarge {
                size: full_len,
                max: self.max_file_size,
            });
        }
        let full_len = full_len as u32;

        let mut state = self.state.lock();
        if state.closed {
            return Err(DbError::Closed("flat-file store"));
        }
        let cursor = &mut state.cursor;

        if u64::from(cursor.offset) + u64::from(full_len) > u64::from(self.max_file_size) {
            self.roll_write_file(cursor)?;
        }

        let location = FlatFileLocation::new(cursor.file_number, cursor.offset, full_len);
        let record = encode_record(data);
        let path = self.file_path(location.file_number);

        self.ensure_write_file(cursor)?;
        let Some(file) = cursor.file.as_mut() else {
            return Err(DbError::Closed("flat-file write handle"));
        };

        let appended = file.append(&record).and_then(|()| file.sync());
        if let Err(err) = appended {
            // The handle may now sit past the cursor; reopening it trims the
            // tail back before the next append.
            cursor.file = None;
            return Err(self.io_failure(format!("failed to append to {}", path.display()), err));
        }

        cursor.offset += full_len;
        tracing::trace!(parent: &self.span, %location, "record appended");
        Ok(location)
    }

    /// Read the payload of the record at `location`.
    pub fn read(&self, location: FlatFileLocation) -> DbResult<Vec<u8>> {
        if location.data_length < RECORD_OVERHEAD {
            return Err(DbError::not_found(format!(
                "{location} in store '{}' does not describe a record",
                self.store_name
            )));
        }

        let handle = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DbError::Closed("flat-file store"));
            }
            let cursor = &state.cursor;
            let visible = match location.file_number.cmp(&cursor.file_number) {
                Ordering::Less => true,
                Ordering::Equal => location.end_offset() <= u64::from(cursor.offset),
                Ordering::Greater => false,
            };
            if !visible {
                return Err(DbError::not_found(format!(
                    "{location} is beyond the write cursor of store '{}'",
                    self.store_name
                )));
            }
            self.read_handle(&mut state, location.file_number)?
        };

        let mut buf = vec![0u8; location.data_length as usize];
        self.read_at(&handle, location, &mut buf)?;

        let payload = decode_record(&buf).map_err(|(expected, actual)| DbError::ChecksumMismatch {
            store: self.store_name.clone(),
            location,
            expected,
            actual,
        })?;
        tracing::trace!(parent: &self.span, %location, "record read");
        Ok(payload.to_vec())
    }

    /// Move the write cursor back to `target`, deleting every later file
    /// and truncating the target file to `target.file_offset`.
    ///
    /// Nothing is deleted if the target file is shorter than
    /// `target.file_offset`; that fails with `UnrecoverableCorruption`.
    pub fn rollback(&self, target: FlatFileLocation) -> DbResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DbError::Closed("flat-file store"));
        }
        let StoreState {
            open_files, cursor, ..
        } = &mut *state;

        let current = cursor.location();
        if target.cmp_position(&current) == Ordering::Greater {
            return Err(DbError::InvalidRollback {
                store: self.store_name.clone(),
                target,
                current,
            });
        }

        let target_path = self.file_path(target.file_number);
        let target_len = match self.fs.file_len(&target_path) {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(DbError::io(format!("failed to stat {}", target_path.display()), e));
            }
        };
        if target_len < u64::from(target.file_offset) {
            tracing::error!(
                parent: &self.span,
                file = %target_path.display(),
                len = target_len,
                %target,
                "rollback target is past the end of its file"
            );
            return Err(DbError::UnrecoverableCorruption(format!(
                "{} is {target_len} bytes, short of rollback target {target}",
                target_path.display()
            )));
        }

        // Dropping the write handle makes `ensure_write_file` reopen the
        // target file and cut it down to the new cursor offset.
        cursor.file = None;
        for number in (target.file_number + 1..=cursor.file_number).rev() {
            open_files.close(number);
            self.remove_file(number)?;
        }

        cursor.file_number = target.file_number;
        cursor.offset = target.file_offset;
        self.ensure_write_file(cursor)?;

        let rolled_to = cursor.location();
        tracing::info!(parent: &self.span, from = %current, to = %rolled_to, "flat-file store rolled back");
        Ok(())
    }

    /// Delete whole files numbered below `min_file_to_keep`, except those in
    /// `preserved`. The current write file is never deleted.
    pub fn delete_up_to_file(&self, min_file_to_keep: u32, preserved: &HashSet<u32>) -> DbResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DbError::Closed("flat-file store"));
        }
        let limit = min_file_to_keep.min(state.cursor.file_number);
        if limit < min_file_to_keep {
            tracing::warn!(
                parent: &self.span,
                requested = min_file_to_keep,
                write_file = state.cursor.file_number,
                "refusing to delete the current write file"
            );
        }

        let mut deleted = 0usize;
        for number in self.scan_file_numbers()? {
            if number >= limit || preserved.contains(&number) {
                continue;
            }
            state.open_files.close(number);
            self.remove_file(number)?;
            deleted += 1;
        }

        tracing::info!(parent: &self.span, deleted, below = limit, "pruned flat files");
        Ok(())
    }

    /// The next free position: where the next record will be written.
    pub fn current_location(&self) -> DbResult<FlatFileLocation> {
        let state = self.state.lock();
        if state.closed {
            return Err(DbError::Closed("flat-file store"));
        }
        Ok(state.cursor.location())
    }

    /// True end of the store on disk: the highest-numbered file and its
    /// length. Independent of the in-memory write cursor.
    pub fn scan_physical_end(&self) -> DbResult<FlatFileLocation> {
        let Some(&last) = self.scan_file_numbers()?.last() else {
            return Ok(FlatFileLocation::cursor(0, 0));
        };
        let path = self.file_path(last);
        let len = self
            .fs
            .file_len(&path)
            .map_err(|e| DbError::io(format!("failed to stat {}", path.display()), e))?;
        let offset = u32::try_from(len).map_err(|_| {
            DbError::UnrecoverableCorruption(format!(
                "{} is {len} bytes, larger than any flat file can be",
                path.display()
            ))
        })?;
        Ok(FlatFileLocation::cursor(last, offset))
    }

    /// Walk every record from the lowest file up to the write cursor,
    /// checking framing and checksums.
    pub fn verify(&self) -> DbResult<StoreReport> {
        let (numbers, cursor) = {
            let state = self.state.lock();
            if state.closed {
                return Err(DbError::Closed("flat-file store"));
            }
            (self.scan_file_numbers()?, state.cursor.location())
        };

        let mut report = StoreReport {
            store: self.store_name.clone(),
            ..Default::default()
        };

        for number in numbers.into_iter().filter(|n| *n <= cursor.file_number) {
            report.files += 1;
            let end = if number == cursor.file_number {
                u64::from(cursor.file_offset)
            } else {
                let path = self.file_path(number);
                self.fs
                    .file_len(&path)
                    .map_err(|e| DbError::io(format!("failed to stat {}", path.display()), e))?
            };

            let mut offset = 0u64;
            while offset < end {
                if offset + LENGTH_SIZE as u64 > end {
                    report.first_corrupt =
                        Some(FlatFileLocation::new(number, offset as u32, (end - offset) as u32));
                    return Ok(report);
                }
                let header = self.read_raw(number, offset, LENGTH_SIZE)?;
                let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                let full_len = u64::from(payload_len) + u64::from(RECORD_OVERHEAD);
                let location = FlatFileLocation::new(number, offset as u32, full_len as u32);

                if offset + full_len > end {
                    report.first_corrupt = Some(location);
                    return Ok(report);
                }
                match self.read(location) {
                    Ok(payload) => {
                        report.records += 1;
                        report.bytes += payload.len() as u64;
                    }
                    Err(DbError::ChecksumMismatch { .. }) => {
                        report.first_corrupt = Some(location);
                        return Ok(report);
                    }
                    Err(err) => return Err(err),
                }
                offset += full_len;
            }
        }

        tracing::debug!(parent: &self.span, records = report.records, "store verified");
        Ok(report)
    }

    /// Close the write handle and every cached read handle.
    pub fn close(&self) -> DbResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DbError::Closed("flat-file store"));
        }
        state.closed = true;
        state.open_files.close_all();
        if let Some(file) = state.cursor.file.take() {
            file.sync().map_err(|e| DbError::io("failed to sync write file on close", e))?;
        }
        tracing::debug!(parent: &self.span, "flat-file store closed");
        Ok(())
    }

    pub fn file_path(&self, file_number: u32) -> PathBuf {
        self.base_path.join(format!(
            "{}-{:0width$}.{}",
            self.store_name,
            file_number,
            FLAT_FILE_EXTENSION,
            width = FILE_NUMBER_WIDTH
        ))
    }

    // -- Internals ----------------------------------------------------------

    /// Sync and drop the current write file and move the cursor to the
    /// start of the next one.
    fn roll_write_file(&self, cursor: &mut WriteCursor) -> DbResult<()> {
        if let Some(file) = cursor.file.take() {
            file.sync().map_err(|e| {
                self.io_failure(format!("failed to sync {}", self.file_path(cursor.file_number).display()), e)
            })?;
        }
        cursor.file_number = cursor.file_number.checked_add(1).ok_or_else(|| {
            DbError::UnrecoverableCorruption(format!("store '{}' ran out of file numbers", self.store_name))
        })?;
        cursor.offset = 0;
        tracing::debug!(parent: &self.span, file = cursor.file_number, "rolled to new flat file");
        Ok(())
    }

    /// Make sure the cursor holds an append handle whose physical end is
    /// exactly the cursor offset. Bytes past the cursor belong to a write
    /// that never completed and are cut off.
    fn ensure_write_file(&self, cursor: &mut WriteCursor) -> DbResult<()> {
        if cursor.file.is_some() {
            return Ok(());
        }
        let path = self.file_path(cursor.file_number);
        let mut file = self
            .fs
            .open_append(&path)
            .map_err(|e| self.io_failure(format!("failed to open {}", path.display()), e))?;
        let len = file
            .len()
            .map_err(|e| DbError::io(format!("failed to stat {}", path.display()), e))?;

        match len.cmp(&u64::from(cursor.offset)) {
            Ordering::Equal => {}
            Ordering::Greater => {
                tracing::debug!(parent: &self.span, file = %path.display(), len, cursor = cursor.offset, "trimming unacknowledged tail");
                file.truncate(u64::from(cursor.offset))
                    .and_then(|()| file.sync())
                    .map_err(|e| self.io_failure(format!("failed to truncate {}", path.display()), e))?;
            }
            Ordering::Less => {
                return Err(DbError::UnrecoverableCorruption(format!(
                    "{} is {len} bytes but the write cursor is at {}",
                    path.display(),
                    cursor.offset
                )));
            }
        }

        cursor.file = Some(file);
        Ok(())
    }

    /// Cached read handle for `file_number`, opening it if needed.
    fn read_handle(&self, state: &mut StoreState, file_number: u32) -> DbResult<SharedFile> {
        if let Some(handle) = state.open_files.get(file_number) {
            return Ok(handle);
        }
        let path = self.file_path(file_number);
        let file = self.fs.open_read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                DbError::not_found(format!("flat file {} does not exist", path.display()))
            }
            _ => DbError::io(format!("failed to open {}", path.display()), e),
        })?;
        let (handle, evicted) = state.open_files.insert(file_number, file);
        if let Some(evicted) = evicted {
            tracing::debug!(parent: &self.span, evicted, open = state.open_files.len(), "evicted read handle");
        }
        Ok(handle)
    }

    fn read_raw(&self, file_number: u32, offset: u64, len: usize) -> DbResult<Vec<u8>> {
        let handle = {
            let mut state = self.state.lock();
            self.read_handle(&mut state, file_number)?
        };
        let mut buf = vec![0u8; len];
        let location = FlatFileLocation::new(file_number, offset as u32, len as u32);
        self.read_at(&handle, location, &mut buf)?;
        Ok(buf)
    }

    fn read_at(&self, handle: &SharedFile, location: FlatFileLocation, buf: &mut [u8]) -> DbResult<()> {
        handle
            .read()
            .read_exact_at(buf, u64::from(location.file_offset))
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => DbError::not_found(format!(
                    "{location} runs past the end of its file in store '{}'",
                    self.store_name
                )),
                _ => DbError::io(
                    format!("failed to read {location} from store '{}'", self.store_name),
                    e,
                ),
            })
    }

    fn remove_file(&self, file_number: u32) -> DbResult<()> {
        let path = self.file_path(file_number);
        match self.fs.remove(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::io(format!("failed to delete {}", path.display()), e)),
        }
    }

    /// File numbers of this store present on disk, ascending.
    fn scan_file_numbers(&self) -> DbResult<Vec<u32>> {
        let entries = self
            .fs
            .list(&self.base_path)
            .map_err(|e| DbError::io(format!("failed to list {}", self.base_path.display()), e))?;
        let mut numbers: Vec<u32> = entries
            .iter()
            .filter_map(|path| path.file_name()?.to_str())
            .filter_map(|name| parse_file_number(&self.store_name, name))
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Turn an I/O error from a write path into a `DbError`, aborting the
    /// process if the disk is full.
    fn io_failure(&self, context: String, err: io::Error) -> DbError {
        if is_disk_full(&err) {
            tracing::error!(parent: &self.span, error = %err, "{context}: disk is full, aborting");
            std::process::abort();
        }
        DbError::io(context, err)
    }
}

impl std::fmt::Debug for FlatFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatFileStore")
            .field("base_path", &self.base_path)
            .field("store_name", &self.store_name)
            .field("max_file_size", &self.max_file_size)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Record framing
// ---------------------------------------------------------------------------

fn encode_record(data: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(data.len() + RECORD_OVERHEAD as usize);
    record.extend_from_slice(&(data.len() as u32).to_le_bytes());
    record.extend_from_slice(data);
    let checksum = crc32c::crc32c(&record);
    record.extend_from_slice(&checksum.to_le_bytes());
    record
}

/// Payload of a framed record, or `(expected, actual)` checksums when the
/// record does not verify.
fn decode_record(record: &[u8]) -> Result<&[u8], (u32, u32)> {
    if record.len() < RECORD_OVERHEAD as usize {
        return Err((0, 0));
    }
    let (body, tail) = record.split_at(record.len() - CHECKSUM_SIZE);
    let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = crc32c::crc32c(body);
    if expected != actual {
        return Err((expected, actual));
    }

    // Framing must agree with the location we were handed.
    let stored_len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let payload = &body[LENGTH_SIZE..];
    if stored_len != payload.len() {
        return Err((expected, actual));
    }
    Ok(payload)
}

fn parse_file_number(store_name: &str, file_name: &str) -> Option<u32> {
    let digits = file_name
        .strip_prefix(store_name)?
        .strip_prefix('-')?
        .strip_suffix(FLAT_FILE_EXTENSION)?
        .strip_suffix('.')?;
    if digits.len() != FILE_NUMBER_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub(crate) fn is_disk_full(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::StorageFull
}
