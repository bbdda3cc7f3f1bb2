//! Permuted index maintenance: reorders a base expression's elements before
//! storing, so the same underlying values can be range-scanned in a
//! different leading-column order without a second independent maintainer
//! recomputing them from the record.

use super::{entry_with_primary_key, IndexUpdate};
use crate::error::{RecordLayerError, RlResult};
use crate::kv::KvTransaction;
use crate::record::{IndexDescriptor, IndexKind};
use crate::store::keys::StoreKeys;
use crate::tuple::Tuple;

fn permute(entry: &Tuple, permutation: &[usize]) -> RlResult<Tuple> {
    let mut out = Vec::with_capacity(permutation.len());
    for &idx in permutation {
        let el = entry.elements.get(idx).ok_or_else(|| {
            RecordLayerError::MalformedRecord(format!(
                "permutation index {idx} out of range for entry with {} elements",
                entry.elements.len()
            ))
        })?;
        out.push(el.clone());
    }
    Ok(Tuple::from_elements(out))
}

pub fn maintain<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    update: &IndexUpdate,
) -> RlResult<()> {
    let permutation = match &descriptor.kind {
        IndexKind::Permuted { permutation, .. } => permutation,
        other => {
            return Err(RecordLayerError::UnsupportedElement(format!(
                "{other:?} is not a permuted index"
            )))
        }
    };
    let subspace = keys.index_subspace(&descriptor.name);

    for old in update.old_entries {
        if !update.new_entries.contains(old) {
            let permuted = permute(old, permutation)?;
            let key = subspace.pack(&entry_with_primary_key(&permuted, update.primary_key))?;
            tx.clear(&key);
        }
    }
    for new in update.new_entries {
        if !update.old_entries.contains(new) {
            let permuted = permute(new, permutation)?;
            let key = subspace.pack(&entry_with_primary_key(&permuted, update.primary_key))?;
            tx.set(&key, &[]);
        }
    }
    Ok(())
}

/// True if `entry`'s permuted index entry for `primary_key` is currently
/// stored — used by the scrubber's missing-entry detection.
pub fn entry_is_present<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    primary_key: &Tuple,
    entry: &Tuple,
) -> RlResult<bool> {
    let permutation = match &descriptor.kind {
        IndexKind::Permuted { permutation, .. } => permutation,
        other => {
            return Err(RecordLayerError::UnsupportedElement(format!(
                "{other:?} is not a permuted index"
            )))
        }
    };
    let permuted = permute(entry, permutation)?;
    let subspace = keys.index_subspace(&descriptor.name);
    let key = subspace.pack(&entry_with_primary_key(&permuted, primary_key))?;
    Ok(tx.get(&key)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryDatabase;
    use crate::kv::KvDatabase;
    use crate::record::Expression;
    use crate::tuple::{Element, Subspace};

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor {
            name: "by_city_then_name".to_string(),
            kind: IndexKind::Permuted { base_index: "by_name_then_city".into(), permutation: vec![1, 0] },
            root_expression: Expression::Concat(vec![Expression::field("name"), Expression::field("city")]),
            applies_to_types: vec!["User".into()],
            covering_fields: vec![],
        }
    }

    #[test]
    fn permutation_swaps_element_order() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor();
        let mut tx = db.begin();
        let pk = Tuple::from_elements(vec![Element::Int(1)]);
        let entry = Tuple::from_elements(vec![Element::String("alice".into()), Element::String("tokyo".into())]);

        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk, old_entries: &[], new_entries: &[entry], old_covering: None, new_covering: None }).unwrap();

        let subspace = keys.index_subspace(&desc.name);
        let (begin, end) = subspace.range();
        let entries = tx.get_range(&begin, &end).unwrap();
        assert_eq!(entries.len(), 1);
        let unpacked = subspace.unpack(&entries[0].0).unwrap();
        assert_eq!(
            unpacked,
            Tuple::from_elements(vec![Element::String("tokyo".into()), Element::String("alice".into()), Element::Int(1)])
        );
    }
}
