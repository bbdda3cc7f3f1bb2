//! A persisted set of disjoint, half-open byte ranges, tracking which parts
//! of a key range an online index build or scrub has already covered.
//!
//! Grounded in the same `BTreeMap`-of-ordered-keys discipline as
//! `kv::memory`: ranges are stored as `start -> end` entries in a
//! `BTreeMap<Vec<u8>, Vec<u8>>`, keyed by their start so adjacent/
//! overlapping ranges can be found and merged in one neighbor lookup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A disjoint, half-open `[start, end)` byte range set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    // Invariant: entries are disjoint and non-adjacent (no entry's `end`
    // equals the next entry's `start`); maintained by `insert_range`.
    ranges: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self { ranges: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.ranges.iter().map(|(s, e)| (s.as_slice(), e.as_slice()))
    }

    /// Mark `[start, end)` as covered, merging with any overlapping or
    /// adjacent existing ranges. No-op if `start >= end`.
    pub fn insert_range(&mut self, start: &[u8], end: &[u8]) {
        if start >= end {
            return;
        }
        let mut new_start = start.to_vec();
        let mut new_end = end.to_vec();

        // Any range starting at or before new_start that reaches into it.
        if let Some((s, e)) = self
            .ranges
            .range(..=new_start.clone())
            .next_back()
            .map(|(s, e)| (s.clone(), e.clone()))
        {
            if e >= new_start {
                new_start = s;
                if e > new_end {
                    new_end = e;
                }
            }
        }

        // Absorb every range whose start falls within [new_start, new_end].
        let to_remove: Vec<Vec<u8>> = self
            .ranges
            .range(new_start.clone()..)
            .take_while(|(s, _)| **s <= new_end)
            .map(|(s, _)| s.clone())
            .collect();
        for key in &to_remove {
            if let Some(e) = self.ranges.remove(key) {
                if e > new_end {
                    new_end = e;
                }
            }
        }

        self.ranges.insert(new_start, new_end);
    }

    /// The portions of `[start, end)` not yet covered, in ascending order.
    pub fn missing_ranges(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        if start >= end {
            return Vec::new();
        }
        let mut missing = Vec::new();
        let mut cursor = start.to_vec();

        let overlapping: Vec<(Vec<u8>, Vec<u8>)> = self
            .ranges
            .range(..end.to_vec())
            .filter(|(_, e)| **e > cursor)
            .map(|(s, e)| (s.clone(), e.clone()))
            .collect();

        for (rs, re) in overlapping {
            if rs > cursor {
                missing.push((cursor.clone(), rs.clone().min(end.to_vec())));
            }
            if re > cursor {
                cursor = re.min(end.to_vec());
            }
            if cursor >= end.to_vec() {
                break;
            }
        }
        if cursor < end.to_vec() {
            missing.push((cursor, end.to_vec()));
        }
        missing.retain(|(s, e)| s < e);
        missing
    }

    /// True if `[start, end)` is entirely covered.
    pub fn contains_range(&self, start: &[u8], end: &[u8]) -> bool {
        self.missing_ranges(start, end).is_empty()
    }

    pub fn to_bytes(&self) -> crate::error::RlResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| crate::error::RecordLayerError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::RlResult<Self> {
        bincode::deserialize(bytes).map_err(|e| crate::error::RecordLayerError::RangeSetCorruption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn empty_set_has_whole_range_missing() {
        let set = RangeSet::new();
        let missing = set.missing_ranges(&k("a"), &k("z"));
        assert_eq!(missing, vec![(k("a"), k("z"))]);
    }

    #[test]
    fn insert_then_fully_covered() {
        let mut set = RangeSet::new();
        set.insert_range(&k("a"), &k("z"));
        assert!(set.contains_range(&k("a"), &k("z")));
        assert!(set.contains_range(&k("c"), &k("m")));
    }

    #[test]
    fn partial_coverage_leaves_a_gap() {
        let mut set = RangeSet::new();
        set.insert_range(&k("a"), &k("c"));
        set.insert_range(&k("m"), &k("z"));
        let missing = set.missing_ranges(&k("a"), &k("z"));
        assert_eq!(missing, vec![(k("c"), k("m"))]);
    }

    #[test]
    fn adjacent_inserts_merge_into_one_range() {
        let mut set = RangeSet::new();
        set.insert_range(&k("a"), &k("c"));
        set.insert_range(&k("c"), &k("e"));
        assert_eq!(set.ranges.len(), 1);
        assert!(set.contains_range(&k("a"), &k("e")));
    }

    #[test]
    fn overlapping_inserts_merge() {
        let mut set = RangeSet::new();
        set.insert_range(&k("a"), &k("f"));
        set.insert_range(&k("c"), &k("z"));
        assert_eq!(set.ranges.len(), 1);
        assert!(set.contains_range(&k("a"), &k("z")));
    }

    #[test]
    fn repeated_progress_converges_to_fully_covered() {
        let mut set = RangeSet::new();
        let whole = (k("a"), k("z"));
        let mut cursor = whole.0.clone();
        let mut guard = 0;
        while !set.contains_range(&whole.0, &whole.1) {
            guard += 1;
            assert!(guard < 1000, "did not converge");
            let missing = set.missing_ranges(&whole.0, &whole.1);
            let (s, e) = missing.first().cloned().unwrap();
            let mut step_end = s.clone();
            step_end.push(b'_');
            let step_end = step_end.min(e.clone());
            set.insert_range(&s, &step_end);
            cursor = step_end;
        }
        let _ = cursor;
    }
}
