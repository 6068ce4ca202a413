//! Bounded cache of read-only flat-file handles.
//!
//! Each handle sits behind its own `RwLock`: readers hold it shared for the
//! duration of a positional read, and anything that wants to close a handle
//! (eviction, rollback, pruning) takes it exclusively first, which waits for
//! in-flight reads on that file to drain. Recency is tracked with a logical
//! clock; with a few dozen entries a linear scan for the oldest is cheaper
//! than maintaining a linked list.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::fs::StoreFile;

/// A shareable read handle.
pub type SharedFile = Arc<RwLock<Box<dyn StoreFile>>>;

struct CachedFile {
    handle: SharedFile,
    last_access: u64,
}

pub(crate) struct OpenFileCache {
    files: HashMap<u32, CachedFile>,
    capacity: usize,
    clock: u64,
}

impl OpenFileCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            files: HashMap::with_capacity(capacity),
            capacity,
            clock: 0,
        }
    }

    /// Handle for `file_number`, bumped to most recently used.
    pub(crate) fn get(&mut self, file_number: u32) -> Option<SharedFile> {
        self.clock += 1;
        let clock = self.clock;
        self.files.get_mut(&file_number).map(|entry| {
            entry.last_access = clock;
            Arc::clone(&entry.handle)
        })
    }

    /// Cache a freshly opened handle. Returns the file number evicted to
    /// make room, if any.
    pub(crate) fn insert(
        &mut self,
        file_number: u32,
        file: Box<dyn StoreFile>,
    ) -> (SharedFile, Option<u32>) {
        let full = self.files.len() >= self.capacity;
        let evicted = if full && !self.files.contains_key(&file_number) {
            self.evict_oldest()
        } else {
            None
        };

        self.clock += 1;
        let handle: SharedFile = Arc::new(RwLock::new(file));
        self.files.insert(
            file_number,
            CachedFile {
                handle: Arc::clone(&handle),
                last_access: self.clock,
            },
        );
        (handle, evicted)
    }

    /// Close the handle for `file_number`, waiting for active readers.
    pub(crate) fn close(&mut self, file_number: u32) {
        if let Some(entry) = self.files.remove(&file_number) {
            let _exclusive = entry.handle.write();
        }
    }

    pub(crate) fn close_all(&mut self) {
        for (_, entry) in self.files.drain() {
            let _exclusive = entry.handle.write();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.files.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, file_number: u32) -> bool {
        self.files.contains_key(&file_number)
    }

    fn evict_oldest(&mut self) -> Option<u32> {
        let oldest = self
            .files
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(number, _)| *number)?;
        self.close(oldest);
        Some(oldest)
    }
}
