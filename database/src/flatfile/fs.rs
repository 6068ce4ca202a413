//! File-system seam for the flat-file store.
//!
//! The store never touches `std::fs` directly; it goes through a
//! [`FileSystem`] so tests can inject failures (a write that errors halfway
//! through an append, a sync that never succeeds) without patching globals.
//! [`OsFileSystem`] is the only production implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// An open flat file.
///
/// Reads are positional so that several readers can share one handle
/// behind a read lock without fighting over a seek position.
pub trait StoreFile: Send + Sync {
    /// Fill `buf` from `offset`. Short files are an `UnexpectedEof` error.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Append `data` at the current end of the file.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush file contents and metadata to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Cut the file down to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn len(&self) -> io::Result<u64>;
}

/// Directory and file operations used by the flat-file store.
pub trait FileSystem: Send + Sync {
    /// Open an existing file read-only.
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StoreFile>>;

    /// Open a file for appending, creating it if it does not exist.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn StoreFile>>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Every entry in `dir`.
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    fn file_len(&self, path: &Path) -> io::Result<u64>;

    fn remove(&self, path: &Path) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// OS implementation
// ---------------------------------------------------------------------------

/// The real file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn StoreFile>> {
        let file = File::open(path)?;
        Ok(Box::new(OsFile { file }))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn StoreFile>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        Ok(Box::new(OsFile { file }))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

struct OsFile {
    file: File,
}

impl StoreFile for OsFile {
    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
