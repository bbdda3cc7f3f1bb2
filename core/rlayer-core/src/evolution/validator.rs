//! Schema evolution checks: what a new [`Schema`] is allowed to change
//! relative to the one a store was last opened with.

use crate::error::{RecordLayerError, RlResult};
use crate::record::Schema;
use crate::store::StoreKeys;

/// Reject a schema change that would break an already-stored record type or
/// silently reuse a removed index's subspace bytes.
///
/// Allowed: adding record types, adding optional fields, adding indexes,
/// removing an index (provided it leaves behind a `FormerIndex` tombstone).
/// Blocked: changing a surviving record type's primary key fields, dropping
/// a required field a stored record may still carry, and removing an index
/// without a tombstone (a later index reusing its subspace bytes would read
/// stale entries as if they were its own).
pub fn validate_evolution(old: &Schema, new: &Schema, keys: &StoreKeys) -> RlResult<()> {
    for old_type in &old.record_types {
        let Some(new_type) = new.record_type(&old_type.name) else { continue };
        if new_type.primary_key_fields != old_type.primary_key_fields {
            return Err(RecordLayerError::SchemaEvolutionBlocked(format!(
                "record type '{}' changed its primary key fields",
                new_type.name
            )));
        }
        for old_field in &old_type.fields {
            let still_present = new_type.fields.iter().any(|f| f.name == old_field.name);
            if !old_field.optional && !still_present {
                return Err(RecordLayerError::SchemaEvolutionBlocked(format!(
                    "record type '{}' dropped required field '{}'",
                    new_type.name, old_field.name
                )));
            }
        }
    }

    for old_index in &old.indexes {
        let still_defined = new.index(&old_index.name).is_some();
        let tombstoned = new.former_indexes.iter().any(|f| f.name == old_index.name);
        if !still_defined && !tombstoned {
            return Err(RecordLayerError::SchemaEvolutionBlocked(format!(
                "index '{}' was removed without a FormerIndex tombstone",
                old_index.name
            )));
        }
    }

    for new_index in &new.indexes {
        let key = keys.index_subspace(&new_index.name).prefix().to_vec();
        if let Some(reason) = new.validate_no_former_index_reuse(new_index, &key) {
            return Err(RecordLayerError::SchemaEvolutionBlocked(reason));
        }
    }

    Ok(())
}
