//! Index maintainers: the per-kind logic that turns a record's before/after
//! index-expression values into index-subspace mutations.
//!
//! Every maintainer is given the primary key of the record being
//! saved/deleted plus the entries its root expression produced before and
//! after the change (empty on insert/delete respectively) and mutates the
//! index's subspace through the active `KvTransaction`. Maintainers never
//! read the record itself — only the already-evaluated expression output —
//! so a maintainer has no dependency on the record's serializer or shape.

pub mod aggregate;
pub mod permuted;
pub mod rank;
pub mod spatial;
pub mod value;
pub mod vector;

use crate::error::RlResult;
use crate::kv::KvTransaction;
use crate::record::{IndexDescriptor, IndexKind};
use crate::store::keys::StoreKeys;
use crate::tuple::Tuple;

/// A single update to apply to one index, computed by the store from a
/// record's old and new field values.
pub struct IndexUpdate<'a> {
    pub primary_key: &'a Tuple,
    pub old_entries: &'a [Tuple],
    pub new_entries: &'a [Tuple],
    /// Covering-field values (single-valued, one tuple shared by every entry
    /// produced for this record), present only if the index declares
    /// `covering_fields`.
    pub old_covering: Option<&'a Tuple>,
    pub new_covering: Option<&'a Tuple>,
}

/// Dispatch one index's update to its kind-specific maintainer.
pub fn maintain<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    update: &IndexUpdate,
) -> RlResult<()> {
    match &descriptor.kind {
        IndexKind::Value => value::maintain(tx, keys, descriptor, update, false),
        IndexKind::Unique => value::maintain(tx, keys, descriptor, update, true),
        IndexKind::Count | IndexKind::Sum | IndexKind::Min | IndexKind::Max | IndexKind::Average => {
            aggregate::maintain(tx, keys, descriptor, update)
        }
        IndexKind::Rank { .. } => rank::maintain(tx, keys, descriptor, update),
        IndexKind::Version { .. } => Ok(()), // maintained explicitly by the store with a fresh version-stamp, not from plain entries
        IndexKind::Permuted { .. } => permuted::maintain(tx, keys, descriptor, update),
        IndexKind::Vector(_) => vector::maintain(tx, keys, descriptor, update),
        IndexKind::Spatial(_) => spatial::maintain(tx, keys, descriptor, update),
    }
}

/// Append the primary key to an index entry so distinct records that
/// produce the same expression value get distinct, ordered index keys.
pub(crate) fn entry_with_primary_key(entry: &Tuple, primary_key: &Tuple) -> Tuple {
    entry.clone().concat(primary_key.clone())
}

/// Whether `entry` (one value `root_expression` produced for `primary_key`)
/// is currently represented in `descriptor`'s index — `None` for kinds with
/// no per-entry membership to check: `Count`/`Sum`/`Average` fold straight
/// into a shared accumulator with no per-record key, and `Version` is
/// maintained by the store directly from a fresh version-stamp on every
/// save, never from `maintain`.
pub fn entry_is_present<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    primary_key: &Tuple,
    entry: &Tuple,
) -> RlResult<Option<bool>> {
    match &descriptor.kind {
        IndexKind::Value | IndexKind::Unique => {
            let subspace = keys.index_subspace(&descriptor.name);
            let key = subspace.pack(&entry_with_primary_key(entry, primary_key))?;
            Ok(Some(tx.get(&key)?.is_some()))
        }
        IndexKind::Permuted { .. } => Ok(Some(permuted::entry_is_present(tx, keys, descriptor, primary_key, entry)?)),
        IndexKind::Spatial(_) => Ok(Some(spatial::entry_is_present(tx, keys, descriptor, primary_key, entry)?)),
        IndexKind::Vector(_) => Ok(Some(vector::entry_is_present(tx, keys, descriptor, primary_key)?)),
        IndexKind::Min | IndexKind::Max => {
            Ok(Some(aggregate::min_max_entry_is_present(tx, keys, descriptor, primary_key, entry)?))
        }
        IndexKind::Rank { .. } => {
            let member = entry_with_primary_key(entry, primary_key);
            Ok(Some(rank::rank(tx, keys, &descriptor.name, &member)?.is_some()))
        }
        IndexKind::Count | IndexKind::Sum | IndexKind::Average | IndexKind::Version { .. } => Ok(None),
    }
}
