//! Value and unique index maintenance: one entry per (expression value,
//! primary key), optionally rejecting a write whose value collides with
//! another record's.

use super::{entry_with_primary_key, IndexUpdate};
use crate::error::{RecordLayerError, RlResult};
use crate::kv::KvTransaction;
use crate::record::IndexDescriptor;
use crate::store::keys::StoreKeys;
use crate::tuple::{Subspace, Tuple};

pub fn maintain<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    update: &IndexUpdate,
    unique: bool,
) -> RlResult<()> {
    let subspace = keys.index_subspace(&descriptor.name);

    for old in update.old_entries {
        if !update.new_entries.contains(old) {
            let key = subspace.pack(&entry_with_primary_key(old, update.primary_key))?;
            tx.clear(&key);
        }
    }

    for new in update.new_entries {
        if update.old_entries.contains(new) {
            continue;
        }
        if unique {
            check_uniqueness(tx, &subspace, descriptor, new, update.primary_key)?;
        }
        let key = subspace.pack(&entry_with_primary_key(new, update.primary_key))?;
        let value = match update.new_covering {
            Some(covering) => covering.pack_bytes()?,
            None => Vec::new(),
        };
        tx.set(&key, &value);
    }
    Ok(())
}

fn check_uniqueness<Tx: KvTransaction>(
    tx: &mut Tx,
    subspace: &Subspace,
    descriptor: &IndexDescriptor,
    entry: &Tuple,
    primary_key: &Tuple,
) -> RlResult<()> {
    let value_prefix = subspace.pack(entry)?;
    let (begin, end) = Subspace::new(value_prefix).range();
    for (key, _) in tx.get_range(&begin, &end)? {
        let full = subspace.unpack(&key)?;
        let existing_pk = Tuple::from_elements(full.elements.iter().skip(entry.len()).cloned());
        if &existing_pk != primary_key {
            return Err(RecordLayerError::UniquenessViolation {
                index: descriptor.name.clone(),
                conflicting_key: key,
            });
        }
    }
    Ok(())
}
