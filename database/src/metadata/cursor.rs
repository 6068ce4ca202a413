//! # Bucket Cursors
//!
//! A cursor walks the keys of one bucket in ascending byte order. Opened
//! from inside a write transaction, it also sees that transaction's pending
//! writes: every step merges the engine's next entry with the write set's
//! next entry, letting a pending put shadow (or splice in before) the
//! engine's entry and letting a pending delete hide it.
//!
//! Each step is a fresh bounded lookup relative to the current key rather
//! than a long-lived engine iterator, which keeps forward and backward
//! movement symmetric and means a cursor never pins engine resources.
//!
//! ## Closed cursors
//!
//! Movement (`first`, `last`, `next`, `prev`) on a closed cursor reports
//! "no more entries". Everything that must hand back data or act on a
//! position (`seek`, `key`, `value`) is an error, and so is closing twice.

use std::ops::Bound;

use super::engine::{Entry, KvEngine};
use super::write_set::WriteSet;
use crate::bucket::{Bucket, Key};
use crate::error::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorState {
    /// Created, not moved yet.
    Unpositioned,
    Positioned { key: Vec<u8>, value: Vec<u8> },
    /// Moved past either end of the bucket.
    Exhausted,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Iterator over the keys of a single bucket.
pub struct Cursor<'a> {
    engine: &'a dyn KvEngine,
    pending: Option<&'a WriteSet>,
    bucket: Bucket,
    prefix: Vec<u8>,
    /// First key past the bucket, `None` when the bucket runs to the end of
    /// the keyspace.
    upper: Option<Vec<u8>>,
    state: CursorState,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(engine: &'a dyn KvEngine, pending: Option<&'a WriteSet>, bucket: &Bucket) -> Self {
        let prefix = bucket.path().to_vec();
        let upper = prefix_successor(&prefix);
        Self {
            engine,
            pending,
            bucket: bucket.clone(),
            prefix,
            upper,
            state: CursorState::Unpositioned,
        }
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// Move to the first key of the bucket. `false` if the bucket is empty
    /// or the cursor is closed.
    pub fn first(&mut self) -> DbResult<bool> {
        if self.state == CursorState::Closed {
            return Ok(false);
        }
        let found = self.step(Bound::Included(self.prefix.clone()), self.upper_bound(), Direction::Forward)?;
        Ok(self.settle(found))
    }

    /// Move to the last key of the bucket.
    pub fn last(&mut self) -> DbResult<bool> {
        if self.state == CursorState::Closed {
            return Ok(false);
        }
        let found = self.step(Bound::Included(self.prefix.clone()), self.upper_bound(), Direction::Backward)?;
        Ok(self.settle(found))
    }

    /// Advance to the next key. An unpositioned cursor moves to the first
    /// key; an exhausted or closed one stays put and returns `false`.
    pub fn next(&mut self) -> DbResult<bool> {
        let current = match &self.state {
            CursorState::Closed | CursorState::Exhausted => return Ok(false),
            CursorState::Unpositioned => return self.first(),
            CursorState::Positioned { key, .. } => key.clone(),
        };
        let found = self.step(Bound::Excluded(current), self.upper_bound(), Direction::Forward)?;
        Ok(self.settle(found))
    }

    /// Step back to the previous key. An unpositioned cursor moves to the
    /// last key.
    pub fn prev(&mut self) -> DbResult<bool> {
        let current = match &self.state {
            CursorState::Closed | CursorState::Exhausted => return Ok(false),
            CursorState::Unpositioned => return self.last(),
            CursorState::Positioned { key, .. } => key.clone(),
        };
        let found = self.step(Bound::Included(self.prefix.clone()), Bound::Excluded(current), Direction::Backward)?;
        Ok(self.settle(found))
    }

    /// Position on exactly `key`.
    ///
    /// The cursor still moves to the first key at or after `key` when there
    /// is no exact match, but the call reports `NotFound`: a seek is a
    /// lookup, not a lower-bound search.
    pub fn seek(&mut self, key: &Key) -> DbResult<()> {
        if self.state == CursorState::Closed {
            return Err(DbError::Closed("cursor"));
        }
        let target = key.full_key();
        let lower = if target < self.prefix {
            self.prefix.clone()
        } else {
            target.clone()
        };
        let found = self.step(Bound::Included(lower), self.upper_bound(), Direction::Forward)?;
        let exact = matches!(&found, Some((k, _)) if *k == target);
        self.settle(found);
        if exact {
            Ok(())
        } else {
            Err(DbError::not_found(format!("key {key} not found by cursor seek")))
        }
    }

    /// Key at the current position, relative to the cursor's bucket.
    pub fn key(&self) -> DbResult<Key> {
        match &self.state {
            CursorState::Positioned { key, .. } => Ok(self.bucket.key(&key[self.prefix.len()..])),
            CursorState::Closed => Err(DbError::Closed("cursor")),
            _ => Err(DbError::not_found("cursor is not positioned on a key")),
        }
    }

    /// Value at the current position.
    pub fn value(&self) -> DbResult<&[u8]> {
        match &self.state {
            CursorState::Positioned { value, .. } => Ok(value),
            CursorState::Closed => Err(DbError::Closed("cursor")),
            _ => Err(DbError::not_found("cursor is not positioned on a key")),
        }
    }

    pub fn close(&mut self) -> DbResult<()> {
        if self.state == CursorState::Closed {
            return Err(DbError::Closed("cursor"));
        }
        self.state = CursorState::Closed;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    // -- Internals ----------------------------------------------------------

    fn upper_bound(&self) -> Bound<Vec<u8>> {
        match &self.upper {
            Some(upper) => Bound::Excluded(upper.clone()),
            None => Bound::Unbounded,
        }
    }

    fn settle(&mut self, found: Option<Entry>) -> bool {
        match found {
            Some((key, value)) => {
                self.state = CursorState::Positioned { key, value };
                true
            }
            None => {
                self.state = CursorState::Exhausted;
                false
            }
        }
    }

    /// The nearest visible entry inside the bounds in `direction`, merging
    /// the engine with the pending write set.
    fn step(&self, mut lower: Bound<Vec<u8>>, mut upper: Bound<Vec<u8>>, direction: Direction) -> DbResult<Option<Entry>> {
        loop {
            let (lo, hi) = (borrowed(&lower), borrowed(&upper));
            let base = match direction {
                Direction::Forward => self.engine.first_in(lo, hi)?,
                Direction::Backward => self.engine.last_in(lo, hi)?,
            };
            let overlay = self.pending.and_then(|pending| match direction {
                Direction::Forward => pending.first_in(lo, hi),
                Direction::Backward => pending.last_in(lo, hi),
            });

            let (key, value) = match (base, overlay) {
                (None, None) => return Ok(None),
                (Some(base), None) => return Ok(Some(base)),
                (None, Some((key, value))) => (key.to_vec(), value.map(<[u8]>::to_vec)),
                (Some(base), Some((key, value))) => {
                    // On a tie the pending write shadows the engine's entry.
                    let overlay_wins = match direction {
                        Direction::Forward => key <= base.0.as_slice(),
                        Direction::Backward => key >= base.0.as_slice(),
                    };
                    if !overlay_wins {
                        return Ok(Some(base));
                    }
                    (key.to_vec(), value.map(<[u8]>::to_vec))
                }
            };

            match value {
                Some(value) => return Ok(Some((key, value))),
                // Pending delete: skip past the key and look again.
                None => match direction {
                    Direction::Forward => lower = Bound::Excluded(key),
                    Direction::Backward => upper = Bound::Excluded(key),
                },
            }
        }
    }
}

fn borrowed(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Smallest byte string greater than every string starting with `prefix`,
/// or `None` if there is none (empty or all-`0xFF` prefix).
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xFF {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::engine::SledEngine;

    fn engine_with(keys: &[&str]) -> SledEngine {
        let engine = SledEngine::open_temporary().unwrap();
        let mut batch = WriteSet::new();
        for key in keys {
            batch.put(key.as_bytes().to_vec(), format!("v:{key}").into_bytes());
        }
        engine.apply(&batch).unwrap();
        engine
    }

    fn collect_forward(cursor: &mut Cursor<'_>) -> Vec<String> {
        let mut keys = Vec::new();
        while cursor.next().unwrap() {
            keys.push(String::from_utf8(cursor.key().unwrap().suffix().to_vec()).unwrap());
        }
        keys
    }

    fn collect_backward(cursor: &mut Cursor<'_>) -> Vec<String> {
        let mut keys = Vec::new();
        let mut more = cursor.last().unwrap();
        while more {
            keys.push(String::from_utf8(cursor.key().unwrap().suffix().to_vec()).unwrap());
            more = cursor.prev().unwrap();
        }
        keys
    }

    #[test]
    fn prefix_successor_cases() {
        assert_eq!(prefix_successor(b"a/"), Some(b"a0".to_vec()));
        assert_eq!(prefix_successor(&[0x61, 0xFF]), Some(vec![0x62]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn iterates_only_its_bucket_in_order() {
        let engine = engine_with(&["a/3", "a/1", "a/2", "a0", "b/1", "a"]);
        let bucket = Bucket::new(["a"]);
        let mut cursor = Cursor::new(&engine, None, &bucket);
        assert_eq!(collect_forward(&mut cursor), ["1", "2", "3"]);
    }

    #[test]
    fn nested_bucket_keys_belong_to_parent_too() {
        let engine = engine_with(&["a/x", "a/b/y"]);
        let mut parent = Cursor::new(&engine, None, &Bucket::new(["a"]));
        assert_eq!(collect_forward(&mut parent), ["b/y", "x"]);

        let mut child = Cursor::new(&engine, None, &Bucket::new(["a", "b"]));
        assert_eq!(collect_forward(&mut child), ["y"]);
    }

    #[test]
    fn value_follows_key() {
        let engine = engine_with(&["a/1"]);
        let mut cursor = Cursor::new(&engine, None, &Bucket::new(["a"]));
        assert!(cursor.first().unwrap());
        assert_eq!(cursor.value().unwrap(), b"v:a/1");
        assert_eq!(cursor.key().unwrap(), Bucket::new(["a"]).key("1"));
    }

    #[test]
    fn empty_bucket() {
        let engine = engine_with(&["b/1"]);
        let mut cursor = Cursor::new(&engine, None, &Bucket::new(["a"]));
        assert!(!cursor.first().unwrap());
        assert!(!cursor.next().unwrap());
        assert!(cursor.key().unwrap_err().is_not_found());
    }

    #[test]
    fn seek_requires_exact_match() {
        let engine = engine_with(&["a/1", "a/3"]);
        let bucket = Bucket::new(["a"]);
        let mut cursor = Cursor::new(&engine, None, &bucket);

        cursor.seek(&bucket.key("3")).unwrap();
        assert_eq!(cursor.value().unwrap(), b"v:a/3");

        // No exact match: NotFound, but the cursor moved to the next key.
        let err = cursor.seek(&bucket.key("2")).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cursor.key().unwrap().suffix(), b"3");

        // Past the end: NotFound and exhausted.
        assert!(cursor.seek(&bucket.key("9")).unwrap_err().is_not_found());
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn closed_cursor_asymmetry() {
        let engine = engine_with(&["a/1"]);
        let bucket = Bucket::new(["a"]);
        let mut cursor = Cursor::new(&engine, None, &bucket);
        assert!(cursor.first().unwrap());
        cursor.close().unwrap();

        assert!(!cursor.first().unwrap());
        assert!(!cursor.next().unwrap());
        assert!(!cursor.last().unwrap());
        assert!(!cursor.prev().unwrap());
        assert!(cursor.key().unwrap_err().is_closed());
        assert!(cursor.value().unwrap_err().is_closed());
        assert!(cursor.seek(&bucket.key("1")).unwrap_err().is_closed());
        assert!(cursor.close().unwrap_err().is_closed());
    }

    #[test]
    fn overlay_splices_puts_and_hides_deletes() {
        let engine = engine_with(&["a/1", "a/3", "a/5"]);
        let mut pending = WriteSet::new();
        pending.put(b"a/2".to_vec(), b"new".to_vec());
        pending.delete(b"a/3".to_vec());
        pending.put(b"a/5".to_vec(), b"replaced".to_vec());
        pending.put(b"a/6".to_vec(), b"tail".to_vec());
        pending.put(b"b/1".to_vec(), b"other bucket".to_vec());

        let bucket = Bucket::new(["a"]);
        let mut cursor = Cursor::new(&engine, Some(&pending), &bucket);
        assert_eq!(collect_forward(&mut cursor), ["1", "2", "5", "6"]);

        let mut cursor = Cursor::new(&engine, Some(&pending), &bucket);
        assert_eq!(collect_backward(&mut cursor), ["6", "5", "2", "1"]);

        let mut cursor = Cursor::new(&engine, Some(&pending), &bucket);
        cursor.seek(&bucket.key("5")).unwrap();
        assert_eq!(cursor.value().unwrap(), b"replaced");
        assert!(cursor.seek(&bucket.key("3")).unwrap_err().is_not_found());
        assert_eq!(cursor.key().unwrap().suffix(), b"5");
    }

    #[test]
    fn overlay_with_consecutive_deletes_at_both_ends() {
        let engine = engine_with(&["a/1", "a/2", "a/3", "a/4"]);
        let mut pending = WriteSet::new();
        pending.delete(b"a/1".to_vec());
        pending.delete(b"a/2".to_vec());
        pending.delete(b"a/4".to_vec());
        pending.delete(b"a/9".to_vec());

        let bucket = Bucket::new(["a"]);
        let mut cursor = Cursor::new(&engine, Some(&pending), &bucket);
        assert_eq!(collect_forward(&mut cursor), ["3"]);
        let mut cursor = Cursor::new(&engine, Some(&pending), &bucket);
        assert_eq!(collect_backward(&mut cursor), ["3"]);
    }

    #[test]
    fn overlay_only_bucket() {
        let engine = engine_with(&[]);
        let mut pending = WriteSet::new();
        pending.put(b"a/x".to_vec(), b"1".to_vec());
        pending.put(b"a/y".to_vec(), b"2".to_vec());

        let mut cursor = Cursor::new(&engine, Some(&pending), &Bucket::new(["a"]));
        assert_eq!(collect_forward(&mut cursor), ["x", "y"]);
    }

    #[test]
    fn direction_changes_mid_iteration() {
        let engine = engine_with(&["a/1", "a/2", "a/3"]);
        let mut pending = WriteSet::new();
        pending.delete(b"a/2".to_vec());

        let mut cursor = Cursor::new(&engine, Some(&pending), &Bucket::new(["a"]));
        assert!(cursor.first().unwrap());
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.key().unwrap().suffix(), b"3");
        assert!(cursor.prev().unwrap());
        assert_eq!(cursor.key().unwrap().suffix(), b"1");
        assert!(!cursor.prev().unwrap());
    }
}
