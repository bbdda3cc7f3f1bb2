//! Count/Sum/Min/Max/Average index maintenance.
//!
//! An aggregate index's root expression produces, per entry, a group-by
//! prefix followed by a single numeric value element; the accumulator lives
//! at one key per distinct group (the empty tuple for an ungrouped
//! aggregate). Count and Sum ride the KV's blind `Add` atomic op on raw
//! little-endian `i64` bytes, so concurrent updates to the same group never
//! conflict.
//!
//! Min/Max cannot use a blind atomic op alone — removing the current
//! extreme value needs to "pop" to the next one, which a one-way `Min`/`Max`
//! op can't do. Instead each group keeps a multiset of its contributing
//! `(value, primary_key)` members (keyed so they sort by value), and the
//! accumulator is a cache of the first/last member in that multiset,
//! refreshed after every insert/remove.

use super::IndexUpdate;
use crate::error::{RecordLayerError, RlResult};
use crate::kv::{AtomicOp, KvTransaction};
use crate::record::{IndexDescriptor, IndexKind};
use crate::store::keys::StoreKeys;
use crate::tuple::{Element, Tuple};
use std::collections::HashMap;

fn split_group_and_value(entry: &Tuple) -> RlResult<(Tuple, i64)> {
    let mut elements = entry.elements.clone();
    let value = elements.pop().ok_or_else(|| {
        RecordLayerError::MalformedRecord("aggregate index entry has no value element".into())
    })?;
    let numeric = match value {
        Element::Int(i) => i,
        Element::Double(d) => d as i64,
        other => {
            return Err(RecordLayerError::UnsupportedElement(format!(
                "aggregate index value must be numeric, got {other:?}"
            )))
        }
    };
    Ok((Tuple::from_elements(elements), numeric))
}

fn min_max_element(entry: &Tuple) -> RlResult<(Tuple, Element)> {
    let mut elements = entry.elements.clone();
    let value = elements.pop().ok_or_else(|| {
        RecordLayerError::MalformedRecord("aggregate index entry has no value element".into())
    })?;
    Ok((Tuple::from_elements(elements), value))
}

fn min_max_member_key(
    keys: &StoreKeys,
    accumulator_name: &str,
    group: &Tuple,
    value: &Element,
    primary_key: &Tuple,
) -> RlResult<Vec<u8>> {
    let member = group.clone().push(value.clone()).concat(primary_key.clone());
    keys.aggregate_member_subspace(accumulator_name).pack(&member)
}

fn insert_min_max_member<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    accumulator_name: &str,
    group: &Tuple,
    value: &Element,
    primary_key: &Tuple,
) -> RlResult<()> {
    let key = min_max_member_key(keys, accumulator_name, group, value, primary_key)?;
    tx.set(&key, &[]);
    Ok(())
}

fn remove_min_max_member<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    accumulator_name: &str,
    group: &Tuple,
    value: &Element,
    primary_key: &Tuple,
) -> RlResult<()> {
    let key = min_max_member_key(keys, accumulator_name, group, value, primary_key)?;
    tx.clear(&key);
    Ok(())
}

/// Recompute a group's cached Min/Max accumulator from its member multiset —
/// the first member for Min, the last for Max — clearing the accumulator if
/// the group has no members left.
fn refresh_min_max<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    accumulator_name: &str,
    group: &Tuple,
    is_min: bool,
) -> RlResult<()> {
    let member_subspace = keys.aggregate_member_subspace(accumulator_name);
    let group_scope = member_subspace.child(group)?;
    let (begin, end) = group_scope.range();
    let mut entries = tx.get_range(&begin, &end)?;
    let accumulator_key = keys.aggregate_key(accumulator_name, group)?;

    if entries.is_empty() {
        tx.clear(&accumulator_key);
        return Ok(());
    }
    if !is_min {
        entries.reverse();
    }
    let (key, _) = &entries[0];
    let member = member_subspace.unpack(key)?;
    let value = member.elements.get(group.elements.len()).cloned().ok_or_else(|| {
        RecordLayerError::MalformedRecord("aggregate member key missing value element".into())
    })?;
    tx.set(&accumulator_key, &Tuple::from_elements(vec![value]).pack_bytes()?);
    Ok(())
}

/// True if `(group, value, primary_key)` extracted from `entry` is currently
/// a member of a Min/Max accumulator's multiset — used by the scrubber's
/// missing-entry detection.
pub fn min_max_entry_is_present<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    primary_key: &Tuple,
    entry: &Tuple,
) -> RlResult<bool> {
    let (group, value) = min_max_element(entry)?;
    let key = min_max_member_key(keys, &descriptor.name, &group, &value, primary_key)?;
    Ok(tx.get(&key)?.is_some())
}

pub fn maintain<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    update: &IndexUpdate,
) -> RlResult<()> {
    match &descriptor.kind {
        IndexKind::Count => {
            for entry in update.old_entries {
                let (group, _) = split_group_and_value(entry)?;
                apply_delta(tx, keys, &descriptor.name, &group, -1)?;
            }
            for entry in update.new_entries {
                let (group, _) = split_group_and_value(entry)?;
                apply_delta(tx, keys, &descriptor.name, &group, 1)?;
            }
        }
        IndexKind::Sum => {
            for entry in update.old_entries {
                let (group, v) = split_group_and_value(entry)?;
                apply_delta(tx, keys, &descriptor.name, &group, -v)?;
            }
            for entry in update.new_entries {
                let (group, v) = split_group_and_value(entry)?;
                apply_delta(tx, keys, &descriptor.name, &group, v)?;
            }
        }
        IndexKind::Average => {
            for entry in update.old_entries {
                let (group, v) = split_group_and_value(entry)?;
                apply_delta(tx, keys, &format!("{}.count", descriptor.name), &group, -1)?;
                apply_delta(tx, keys, &format!("{}.sum", descriptor.name), &group, -v)?;
            }
            for entry in update.new_entries {
                let (group, v) = split_group_and_value(entry)?;
                apply_delta(tx, keys, &format!("{}.count", descriptor.name), &group, 1)?;
                apply_delta(tx, keys, &format!("{}.sum", descriptor.name), &group, v)?;
            }
        }
        IndexKind::Min | IndexKind::Max => {
            let is_min = matches!(descriptor.kind, IndexKind::Min);
            let mut touched_groups: HashMap<Vec<u8>, Tuple> = HashMap::new();

            for entry in update.old_entries {
                if update.new_entries.contains(entry) {
                    continue;
                }
                let (group, value) = min_max_element(entry)?;
                remove_min_max_member(tx, keys, &descriptor.name, &group, &value, update.primary_key)?;
                touched_groups.insert(group.pack_bytes()?, group);
            }
            for entry in update.new_entries {
                if update.old_entries.contains(entry) {
                    continue;
                }
                let (group, value) = min_max_element(entry)?;
                insert_min_max_member(tx, keys, &descriptor.name, &group, &value, update.primary_key)?;
                touched_groups.insert(group.pack_bytes()?, group);
            }

            for group in touched_groups.into_values() {
                refresh_min_max(tx, keys, &descriptor.name, &group, is_min)?;
            }
        }
        other => {
            return Err(RecordLayerError::UnsupportedElement(format!(
                "{other:?} is not an aggregate index kind"
            )))
        }
    }
    Ok(())
}

fn apply_delta<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    accumulator_name: &str,
    group: &Tuple,
    delta: i64,
) -> RlResult<()> {
    if delta == 0 {
        return Ok(());
    }
    let key = keys.aggregate_key(accumulator_name, group)?;
    tx.atomic_op(&key, &delta.to_le_bytes(), AtomicOp::Add);
    Ok(())
}

/// Read an accumulator's current value (0 if never written).
pub fn read_i64<Tx: KvTransaction>(tx: &mut Tx, keys: &StoreKeys, accumulator_name: &str, group: &Tuple) -> RlResult<i64> {
    let key = keys.aggregate_key(accumulator_name, group)?;
    match tx.get(&key)? {
        Some(bytes) if bytes.len() == 8 => {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&bytes);
            Ok(i64::from_le_bytes(arr))
        }
        _ => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryDatabase;
    use crate::kv::KvDatabase;
    use crate::record::Expression;
    use crate::tuple::Subspace;

    fn descriptor(kind: IndexKind) -> IndexDescriptor {
        IndexDescriptor {
            name: "agg".to_string(),
            kind,
            root_expression: Expression::field("amount"),
            applies_to_types: vec!["Order".into()],
            covering_fields: vec![],
        }
    }

    #[test]
    fn count_increments_and_decrements() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor(IndexKind::Count);
        let mut tx = db.begin();
        let group = Tuple::new();
        let pk = Tuple::from_elements(vec![Element::Int(1)]);

        let entry = Tuple::from_elements(vec![Element::Int(42)]);
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk, old_entries: &[], new_entries: &[entry.clone()], old_covering: None, new_covering: None }).unwrap();
        assert_eq!(read_i64(&mut tx, &keys, "agg", &group).unwrap(), 1);

        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk, old_entries: &[entry], new_entries: &[], old_covering: None, new_covering: None }).unwrap();
        assert_eq!(read_i64(&mut tx, &keys, "agg", &group).unwrap(), 0);
    }

    #[test]
    fn sum_tracks_total() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor(IndexKind::Sum);
        let mut tx = db.begin();
        let group = Tuple::new();
        let pk1 = Tuple::from_elements(vec![Element::Int(1)]);
        let pk2 = Tuple::from_elements(vec![Element::Int(2)]);

        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk1, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(10)])], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk2, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(32)])], old_covering: None, new_covering: None }).unwrap();
        assert_eq!(read_i64(&mut tx, &keys, "agg", &group).unwrap(), 42);
    }

    #[test]
    fn average_derives_from_sum_and_count() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor(IndexKind::Average);
        let mut tx = db.begin();
        let group = Tuple::new();
        let pk1 = Tuple::from_elements(vec![Element::Int(1)]);
        let pk2 = Tuple::from_elements(vec![Element::Int(2)]);

        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk1, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(10)])], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk2, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(20)])], old_covering: None, new_covering: None }).unwrap();

        let sum = read_i64(&mut tx, &keys, "agg.sum", &group).unwrap();
        let count = read_i64(&mut tx, &keys, "agg.count", &group).unwrap();
        assert_eq!(sum, 30);
        assert_eq!(count, 2);
    }

    #[test]
    fn min_tracks_smallest_seen_value() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor(IndexKind::Min);
        let mut tx = db.begin();
        let pk1 = Tuple::from_elements(vec![Element::Int(1)]);
        let pk2 = Tuple::from_elements(vec![Element::Int(2)]);

        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk1, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(50)])], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk2, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(10)])], old_covering: None, new_covering: None }).unwrap();

        let key = keys.aggregate_key("agg", &Tuple::new()).unwrap();
        let bytes = tx.get(&key).unwrap().unwrap();
        let tuple = Tuple::unpack(&bytes).unwrap();
        assert_eq!(tuple, Tuple::from_elements(vec![Element::Int(10)]));
    }

    #[test]
    fn min_pops_to_next_smallest_after_the_smallest_is_removed() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor(IndexKind::Min);
        let mut tx = db.begin();
        let pk1 = Tuple::from_elements(vec![Element::Int(1)]);
        let pk2 = Tuple::from_elements(vec![Element::Int(2)]);
        let pk3 = Tuple::from_elements(vec![Element::Int(3)]);

        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk1, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(50)])], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk2, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(10)])], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk3, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(30)])], old_covering: None, new_covering: None }).unwrap();

        // Deleting the current minimum (pk2's 10) should pop to the next
        // smallest (pk3's 30), not leave the accumulator stuck at 10.
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk2, old_entries: &[Tuple::from_elements(vec![Element::Int(10)])], new_entries: &[], old_covering: None, new_covering: None }).unwrap();

        let key = keys.aggregate_key("agg", &Tuple::new()).unwrap();
        let bytes = tx.get(&key).unwrap().unwrap();
        let tuple = Tuple::unpack(&bytes).unwrap();
        assert_eq!(tuple, Tuple::from_elements(vec![Element::Int(30)]));
    }

    #[test]
    fn min_clears_the_accumulator_once_the_group_is_empty() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor(IndexKind::Min);
        let mut tx = db.begin();
        let pk1 = Tuple::from_elements(vec![Element::Int(1)]);
        let value = Tuple::from_elements(vec![Element::Int(50)]);

        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk1, old_entries: &[], new_entries: &[value.clone()], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk1, old_entries: &[value], new_entries: &[], old_covering: None, new_covering: None }).unwrap();

        let key = keys.aggregate_key("agg", &Tuple::new()).unwrap();
        assert!(tx.get(&key).unwrap().is_none());
    }

    #[test]
    fn max_pops_down_after_the_largest_is_removed() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor(IndexKind::Max);
        let mut tx = db.begin();
        let pk1 = Tuple::from_elements(vec![Element::Int(1)]);
        let pk2 = Tuple::from_elements(vec![Element::Int(2)]);

        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk1, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(90)])], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk2, old_entries: &[], new_entries: &[Tuple::from_elements(vec![Element::Int(20)])], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk1, old_entries: &[Tuple::from_elements(vec![Element::Int(90)])], new_entries: &[], old_covering: None, new_covering: None }).unwrap();

        let key = keys.aggregate_key("agg", &Tuple::new()).unwrap();
        let bytes = tx.get(&key).unwrap().unwrap();
        let tuple = Tuple::unpack(&bytes).unwrap();
        assert_eq!(tuple, Tuple::from_elements(vec![Element::Int(20)]));
    }
}
