//! Pending metadata mutations, kept sorted so cursors can merge them with
//! the engine's own ordering.

use std::collections::BTreeMap;
use std::ops::Bound;

/// Puts (`Some`) and deletes (`None`) keyed by full key. A later mutation
/// of the same key replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.entries.insert(key, None);
    }

    /// `None` if the key was never touched, `Some(None)` if it is pending
    /// deletion, `Some(Some(v))` if it is pending a put.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.entries.get(key).map(|v| v.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    /// Lowest pending entry inside the bounds.
    pub fn first_in(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(&[u8], Option<&[u8]>)> {
        if range_is_empty(lower, upper) {
            return None;
        }
        self.entries
            .range::<[u8], _>((lower, upper))
            .next()
            .map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    /// Highest pending entry inside the bounds.
    pub fn last_in(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Option<(&[u8], Option<&[u8]>)> {
        if range_is_empty(lower, upper) {
            return None;
        }
        self.entries
            .range::<[u8], _>((lower, upper))
            .next_back()
            .map(|(k, v)| (k.as_slice(), v.as_deref()))
    }
}

/// True when no key can satisfy both bounds. Ordered-map range lookups
/// panic on inverted bounds, so callers check this first.
pub(crate) fn range_is_empty(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_mutation_wins() {
        let mut set = WriteSet::new();
        set.put(b"k".to_vec(), b"v1".to_vec());
        set.delete(b"k".to_vec());
        assert_eq!(set.get(b"k"), Some(None));
        set.put(b"k".to_vec(), b"v2".to_vec());
        assert_eq!(set.get(b"k"), Some(Some(b"v2".as_slice())));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn untouched_key_is_none() {
        let set = WriteSet::new();
        assert_eq!(set.get(b"missing"), None);
        assert!(set.is_empty());
    }

    #[test]
    fn bounded_first_and_last() {
        let mut set = WriteSet::new();
        for key in [b"a/1", b"a/2", b"b/1"] {
            set.put(key.to_vec(), vec![]);
        }
        let lower = Bound::Included(b"a/".as_slice());
        let upper = Bound::Excluded(b"a0".as_slice());
        assert_eq!(set.first_in(lower, upper).unwrap().0, b"a/1");
        assert_eq!(set.last_in(lower, upper).unwrap().0, b"a/2");
        assert!(set
            .first_in(Bound::Excluded(b"a/2".as_slice()), upper)
            .is_none());
    }

    #[test]
    fn inverted_bounds_are_empty_not_a_panic() {
        let mut set = WriteSet::new();
        set.put(b"m".to_vec(), vec![]);
        let lo = Bound::Excluded(b"z".as_slice());
        let hi = Bound::Excluded(b"a".as_slice());
        assert!(range_is_empty(lo, hi));
        assert!(set.first_in(lo, hi).is_none());
        assert!(set.last_in(Bound::Excluded(b"m".as_slice()), Bound::Excluded(b"m".as_slice())).is_none());
    }
}
