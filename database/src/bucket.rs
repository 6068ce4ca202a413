//! # Buckets & Keys
//!
//! A flat byte keyspace carved into a hierarchy of namespaces. A [`Bucket`]
//! is a path of segments; its [`Bucket::path`] is every segment followed by
//! the separator, so `["a", "b"]` becomes `a/b/`. A [`Key`] pairs that path
//! with a key inside the bucket, and only [`Key::full_key`] (prefix then
//! key) is ever written to the metadata engine.
//!
//! Full keys cannot be split back into bucket and key: segments may contain
//! the separator byte themselves. Always build keys through
//! [`Bucket::key`], never by slicing a raw key.

use std::fmt;

use crate::config::{BUCKET_SEPARATOR, FLAT_FILES_BUCKET};

/// An immutable namespace path in the metadata keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bucket {
    segments: Vec<Vec<u8>>,
    path: Vec<u8>,
}

impl Bucket {
    /// Build a bucket from its segments, outermost first.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let segments: Vec<Vec<u8>> = segments
            .into_iter()
            .map(|s| s.as_ref().to_vec())
            .collect();
        let path = Self::compose(&segments);
        Self { segments, path }
    }

    /// A new bucket nested one level below this one.
    pub fn sub(&self, segment: impl AsRef<[u8]>) -> Bucket {
        let mut segments = self.segments.clone();
        segments.push(segment.as_ref().to_vec());
        let mut path = self.path.clone();
        path.extend_from_slice(segment.as_ref());
        path.extend_from_slice(BUCKET_SEPARATOR);
        Bucket { segments, path }
    }

    /// A key inside this bucket.
    pub fn key(&self, key: impl AsRef<[u8]>) -> Key {
        Key {
            prefix: self.path.clone(),
            suffix: key.as_ref().to_vec(),
        }
    }

    /// Segments joined by the separator, with a trailing separator.
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    fn compose(segments: &[Vec<u8>]) -> Vec<u8> {
        let len = segments
            .iter()
            .map(|s| s.len() + BUCKET_SEPARATOR.len())
            .sum();
        let mut path = Vec::with_capacity(len);
        for segment in segments {
            path.extend_from_slice(segment);
            path.extend_from_slice(BUCKET_SEPARATOR);
        }
        path
    }
}

/// The reserved bucket holding each flat-file store's persisted write cursor.
pub fn flat_files_bucket() -> Bucket {
    Bucket::new([FLAT_FILES_BUCKET])
}

/// A key qualified by the path of the bucket it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl Key {
    /// Bucket path followed by the key: the bytes actually stored.
    pub fn full_key(&self) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + self.suffix.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(&self.suffix);
        full
    }

    /// The path of the bucket this key lives in.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// The key relative to its bucket.
    pub fn suffix(&self) -> &[u8] {
        &self.suffix
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            String::from_utf8_lossy(&self.prefix),
            String::from_utf8_lossy(&self.suffix)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_joins_segments_with_trailing_separator() {
        assert_eq!(Bucket::new(["a", "b"]).path(), b"a/b/");
    }

    #[test]
    fn sub_bucket_matches_direct_construction() {
        let nested = Bucket::new(["a"]).sub("b");
        assert_eq!(nested.path(), b"a/b/");
        assert_eq!(nested, Bucket::new(["a", "b"]));
    }

    #[test]
    fn full_key_is_path_then_key() {
        let key = Bucket::new(["a", "b"]).key("k");
        assert_eq!(key.full_key(), b"a/b/k");
        assert_eq!(key.prefix(), b"a/b/");
        assert_eq!(key.suffix(), b"k");
    }

    #[test]
    fn empty_bucket_has_empty_path() {
        let bucket = Bucket::new(Vec::<&[u8]>::new());
        assert!(bucket.path().is_empty());
        assert_eq!(bucket.key("top").full_key(), b"top");
    }

    #[test]
    fn equal_segments_give_identical_paths() {
        let a = Bucket::new([b"blocks".as_slice(), &[0x00, 0xFF]]);
        let b = Bucket::new(["blocks"]).sub([0x00u8, 0xFF]);
        assert_eq!(a.path(), b.path());
    }

    #[test]
    fn flat_files_bucket_path() {
        assert_eq!(flat_files_bucket().path(), b"flat-files/");
        assert_eq!(
            flat_files_bucket().key("blocks").full_key(),
            b"flat-files/blocks"
        );
    }

    #[test]
    fn display_is_lossy_utf8() {
        let key = Bucket::new(["utxo"]).key("abc");
        assert_eq!(key.to_string(), "utxo/abc");
    }
}
