//! Old-to-new offset maps for rewrite passes.
//!
//! A pass that inserts or removes instructions never edits offsets in place.
//! It builds a fresh instruction list together with an [`OffsetMap`], and
//! every offset-valued operand is then rewritten through the map.

use rustc_hash::FxHashMap;

/// Mapping from offsets of an old instruction list to the new one.
///
/// An instruction expanded into several maps to the first of them; an
/// instruction that was removed maps to whatever replaced its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap {
    map: FxHashMap<u32, u32>,
}

impl OffsetMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity map over the given offsets.
    pub fn identity(offsets: impl IntoIterator<Item = u32>) -> Self {
        OffsetMap {
            map: offsets.into_iter().map(|o| (o, o)).collect(),
        }
    }

    /// Record that `old` now lives at `new`.
    #[inline]
    pub fn insert(&mut self, old: u32, new: u32) {
        self.map.insert(old, new);
    }

    /// New offset of `old`.
    #[inline]
    pub fn get(&self, old: u32) -> Option<u32> {
        self.map.get(&old).copied()
    }

    /// Number of mapped offsets.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing is mapped.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Chain two maps: `self` then `next`.
    ///
    /// Offsets whose image is missing from `next` are dropped.
    pub fn then(&self, next: &OffsetMap) -> OffsetMap {
        OffsetMap {
            map: self
                .map
                .iter()
                .filter_map(|(&old, &mid)| next.get(mid).map(|new| (old, new)))
                .collect(),
        }
    }

    /// Iterate `(old, new)` pairs in old-offset order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = (u32, u32)> {
        let mut pairs: Vec<(u32, u32)> = self.map.iter().map(|(&a, &b)| (a, b)).collect();
        pairs.sort_unstable();
        pairs.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose() {
        let mut first = OffsetMap::new();
        first.insert(0, 0);
        first.insert(1, 3);
        first.insert(2, 4);

        let mut second = OffsetMap::new();
        second.insert(0, 1);
        second.insert(3, 5);

        let chained = first.then(&second);
        assert_eq!(chained.get(0), Some(1));
        assert_eq!(chained.get(1), Some(5));
        assert_eq!(chained.get(2), None);
        assert_eq!(chained.len(), 2);
    }

    #[test]
    fn test_identity_sorted() {
        let map = OffsetMap::identity([3, 1, 2]);
        let pairs: Vec<_> = map.iter_sorted().collect();
        assert_eq!(pairs, vec![(1, 1), (2, 2), (3, 3)]);
    }
}
