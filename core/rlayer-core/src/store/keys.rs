//! Key-space layout for one record store.
//!
//! Everything lives under a single root [`Subspace`], split into fixed
//! byte-string child subspaces so a raw key's first segment alone says what
//! it is: `H` the store header, `R` records, `I` index entries, `G` index
//! build/scrub progress ranges, `A` aggregate index accumulators (and their
//! Min/Max member multisets), `V` Version index per-primary-key history.

use crate::error::RlResult;
use crate::tuple::{Subspace, Tuple};

/// Key-layout helper bound to one store's root subspace.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    root: Subspace,
}

impl StoreKeys {
    pub fn new(root: Subspace) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Subspace {
        &self.root
    }

    /// The single key holding the serialized `StoreHeader`.
    pub fn header_key(&self) -> Vec<u8> {
        self.root.child_bytes(b"H").prefix().to_vec()
    }

    /// Subspace for one record type's primary-keyed records.
    pub fn records_subspace(&self, record_type: &str) -> Subspace {
        self.root.child_bytes(b"R").child_bytes(record_type.as_bytes())
    }

    pub fn record_key(&self, record_type: &str, primary_key: &Tuple) -> RlResult<Vec<u8>> {
        self.records_subspace(record_type).pack(primary_key)
    }

    /// Subspace for one index's entries.
    pub fn index_subspace(&self, index_name: &str) -> Subspace {
        self.root.child_bytes(b"I").child_bytes(index_name.as_bytes())
    }

    pub fn index_entry_key(&self, index_name: &str, entry: &Tuple) -> RlResult<Vec<u8>> {
        self.index_subspace(index_name).pack(entry)
    }

    /// Subspace holding the `RangeSet` progress for an online build or scrub
    /// of the named index.
    pub fn progress_subspace(&self, index_name: &str) -> Subspace {
        self.root.child_bytes(b"G").child_bytes(index_name.as_bytes())
    }

    /// Subspace holding one aggregate index's running accumulators, one key
    /// per group-by value (an empty tuple's packed bytes for an ungrouped
    /// aggregate).
    pub fn aggregate_subspace(&self, index_name: &str) -> Subspace {
        self.root.child_bytes(b"A").child_bytes(index_name.as_bytes())
    }

    pub fn aggregate_key(&self, index_name: &str, group_key: &Tuple) -> RlResult<Vec<u8>> {
        self.aggregate_subspace(index_name).pack(group_key)
    }

    /// Subspace holding a Min/Max aggregate's per-group multiset of
    /// contributing `(value, primary_key)` members, keyed under the
    /// aggregate's own subspace so it shares the `A` segment rather than
    /// needing one of its own.
    pub fn aggregate_member_subspace(&self, index_name: &str) -> Subspace {
        self.aggregate_subspace(index_name).child_bytes(b"/m/")
    }

    /// Subspace holding a Version index's per-primary-key history, ordered
    /// by commit version-stamp — distinct from `index_subspace`'s per-group
    /// entries (`group ++ versionstamp ++ pk`), this one is keyed
    /// `pk ++ versionstamp` so the current version for one primary key is a
    /// short, self-contained range scan regardless of index size.
    pub fn version_history_subspace(&self, index_name: &str) -> Subspace {
        self.root.child_bytes(b"V").child_bytes(index_name.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Element;

    fn keys() -> StoreKeys {
        StoreKeys::new(Subspace::new(b"store1".to_vec()))
    }

    #[test]
    fn distinct_sections_have_disjoint_prefixes() {
        let k = keys();
        assert_ne!(k.header_key(), k.records_subspace("User").prefix().to_vec());
        let pk = Tuple::from_elements(vec![Element::Int(1)]);
        assert!(k
            .record_key("User", &pk)
            .unwrap()
            .starts_with(k.records_subspace("User").prefix()));
    }

    #[test]
    fn record_keys_for_different_types_do_not_collide() {
        let k = keys();
        let pk = Tuple::from_elements(vec![Element::Int(1)]);
        let a = k.record_key("User", &pk).unwrap();
        let b = k.record_key("Order", &pk).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn index_entry_key_is_prefixed_by_its_index_subspace() {
        let k = keys();
        let entry = Tuple::from_elements(vec![Element::String("tokyo".into())]);
        let key = k.index_entry_key("by_city", &entry).unwrap();
        assert!(key.starts_with(k.index_subspace("by_city").prefix()));
    }
}
