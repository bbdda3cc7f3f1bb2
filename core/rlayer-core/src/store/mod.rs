//! `RecordStore` — the transactional façade over one record type: save,
//! load, delete, and scan, with every maintained index kept in lockstep
//! inside the same `KvTransaction` the record write happens in.

pub mod header;
pub mod keys;

use crate::config::VersionRetention;
use crate::error::{RecordLayerError, RlResult};
use crate::index::{self, IndexUpdate};
use crate::kv::KvTransaction;
use crate::record::{Expression, IndexDescriptor, IndexKind, IndexState, RecordSerializer, RecordType};
use crate::tuple::{Element, Subspace, Tuple, Versionstamp};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn millis_from_value(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    let n = bytes.len().min(8);
    arr[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(arr)
}

pub use header::StoreHeader;
pub use keys::StoreKeys;

/// One open record store, bound to a single transaction for the duration of
/// its calls — mirrors how a `KvTransaction` is used for one unit of work.
pub struct RecordStore<'tx, Tx, R, S> {
    tx: &'tx mut Tx,
    keys: StoreKeys,
    record_type: RecordType,
    indexes: Vec<IndexDescriptor>,
    serializer: S,
    header: StoreHeader,
    _marker: std::marker::PhantomData<R>,
}

impl<'tx, Tx, R, S> RecordStore<'tx, Tx, R, S>
where
    Tx: KvTransaction,
    S: RecordSerializer<R>,
{
    /// Open a store for `record_type` at `root`, loading (or initializing)
    /// its header. `indexes` should be every index applying to this type,
    /// regardless of state — maintenance is gated per-call on `IndexState`.
    pub fn open(
        tx: &'tx mut Tx,
        root: Subspace,
        record_type: RecordType,
        indexes: Vec<IndexDescriptor>,
        serializer: S,
        schema_version: u64,
        schema_digest: String,
    ) -> RlResult<Self> {
        let keys = StoreKeys::new(root);
        let header = match tx.get(&keys.header_key())? {
            Some(bytes) => {
                let header = StoreHeader::from_bytes(&bytes)?;
                if header.schema_digest != schema_digest {
                    return Err(RecordLayerError::SchemaEvolutionBlocked(format!(
                        "store was opened with schema digest '{}' but header has '{}'",
                        schema_digest, header.schema_digest
                    )));
                }
                header
            }
            None => {
                let mut header = StoreHeader::new(schema_version, schema_digest);
                for index in &indexes {
                    header.set_index_state(&index.name, IndexState::Readable);
                }
                tx.set(&keys.header_key(), &header.to_bytes()?);
                header
            }
        };

        Ok(Self {
            tx,
            keys,
            record_type,
            indexes,
            serializer,
            header,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    fn persist_header(&mut self) -> RlResult<()> {
        let bytes = self.header.to_bytes()?;
        self.tx.set(&self.keys.header_key(), &bytes);
        Ok(())
    }

    /// Directly transition an index's lifecycle state (used by the online
    /// indexer/scrubber and schema evolution, not by ordinary record writes).
    pub fn set_index_state(&mut self, index_name: &str, state: IndexState) -> RlResult<()> {
        self.header.set_index_state(index_name, state);
        self.persist_header()
    }

    fn maintained_indexes(&self) -> Vec<&IndexDescriptor> {
        self.indexes
            .iter()
            .filter(|idx| idx.applies_to(&self.record_type.name) && self.header.index_state(&idx.name).is_maintained())
            .collect()
    }

    fn extract_entries(&self, record: &R, expression: &Expression) -> RlResult<Vec<Tuple>> {
        let get_field = |path: &str| self.serializer.extract_field(record, path);
        expression.evaluate(&get_field)
    }

    fn extract_covering(&self, record: &R, descriptor: &IndexDescriptor) -> RlResult<Option<Tuple>> {
        if descriptor.covering_fields.is_empty() {
            return Ok(None);
        }
        let mut elements = Vec::with_capacity(descriptor.covering_fields.len());
        for field in &descriptor.covering_fields {
            let mut values = self.serializer.extract_field(record, field)?;
            if values.len() != 1 {
                return Err(RecordLayerError::MalformedRecord(format!(
                    "covering field '{field}' must be single-valued, got {} values",
                    values.len()
                )));
            }
            elements.push(values.remove(0));
        }
        Ok(Some(Tuple::from_elements(elements)))
    }

    /// Insert or overwrite the record identified by its own primary key.
    pub fn save(&mut self, record: &R) -> RlResult<()> {
        self.save_impl(record, None)
    }

    /// Like `save`, but first compares `expected_version` against the named
    /// Version index's current version for this record's primary key
    /// (`None` meaning "no version recorded yet"). Fails with
    /// `RecordLayerError::VersionMismatch` and mutates nothing if they
    /// don't match.
    pub fn save_expecting_version(
        &mut self,
        record: &R,
        index_name: &str,
        expected_version: Option<&[u8]>,
    ) -> RlResult<()> {
        self.save_impl(record, Some((index_name, expected_version)))
    }

    /// Read the current version for a primary key under a Version index —
    /// the version-stamp of its most recent `save`, or `None` if it has
    /// never been saved (or was deleted) since the index existed.
    pub fn current_version(&mut self, index_name: &str, primary_key: &Tuple) -> RlResult<Option<Vec<u8>>> {
        let history_subspace = self.keys.version_history_subspace(index_name);
        let pk_scope = history_subspace.child(primary_key)?;
        let (begin, end) = pk_scope.range();
        let entries = self.tx.get_range(&begin, &end)?;
        match entries.last() {
            Some((key, _)) => {
                if key.len() < 12 {
                    return Err(RecordLayerError::MalformedRecord(
                        "version history key shorter than a versionstamp".into(),
                    ));
                }
                Ok(Some(key[key.len() - 12..].to_vec()))
            }
            None => Ok(None),
        }
    }

    fn save_impl(&mut self, record: &R, expected: Option<(&str, Option<&[u8]>)>) -> RlResult<()> {
        let primary_key = self.serializer.primary_key(record)?;

        if let Some((index_name, expected_version)) = expected {
            let actual = self.current_version(index_name, &primary_key)?;
            if actual.as_deref() != expected_version {
                return Err(RecordLayerError::VersionMismatch {
                    expected: expected_version.map(|v| v.to_vec()).unwrap_or_default(),
                    actual,
                });
            }
        }

        let record_key = self.keys.record_key(&self.record_type.name, &primary_key)?;

        let old_bytes = self.tx.get(&record_key)?;
        let old_record = old_bytes.as_deref().map(|b| self.serializer.deserialize(b)).transpose()?;

        let new_bytes = self.serializer.serialize(record)?;

        let indexes: Vec<IndexDescriptor> = self.maintained_indexes().into_iter().cloned().collect();
        for descriptor in &indexes {
            let old_entries = match &old_record {
                Some(old) => self.extract_entries(old, &descriptor.root_expression)?,
                None => Vec::new(),
            };
            let new_entries = self.extract_entries(record, &descriptor.root_expression)?;
            let old_covering = match &old_record {
                Some(old) => self.extract_covering(old, descriptor)?,
                None => None,
            };
            let new_covering = self.extract_covering(record, descriptor)?;

            if let IndexKind::Version { .. } = &descriptor.kind {
                self.maintain_version_index(descriptor, &primary_key, &old_entries, &new_entries)?;
                continue;
            }

            let update = IndexUpdate {
                primary_key: &primary_key,
                old_entries: &old_entries,
                new_entries: &new_entries,
                old_covering: old_covering.as_ref(),
                new_covering: new_covering.as_ref(),
            };
            index::maintain(self.tx, &self.keys, descriptor, &update)?;
        }

        self.tx.set(&record_key, &new_bytes);
        Ok(())
    }

    fn maintain_version_index(
        &mut self,
        descriptor: &IndexDescriptor,
        primary_key: &Tuple,
        _old_entries: &[Tuple],
        new_entries: &[Tuple],
    ) -> RlResult<()> {
        let retention = match &descriptor.kind {
            IndexKind::Version { retention } => *retention,
            _ => {
                return Err(RecordLayerError::UnsupportedElement(
                    "maintain_version_index called on a non-Version index".into(),
                ))
            }
        };

        let group_subspace = self.keys.index_subspace(&descriptor.name);
        let history_subspace = self.keys.version_history_subspace(&descriptor.name);
        let pk_scope = history_subspace.child(primary_key)?;

        self.prune_version_history(&pk_scope, retention)?;

        for new in new_entries {
            let group_entry = new.clone().push(Element::Versionstamp(Versionstamp::Incomplete)).concat(primary_key.clone());
            let (group_key, group_offset) = group_subspace.pack_versionstamped(&group_entry)?;
            self.tx.set_versionstamped_key(group_key, group_offset, Vec::new());

            let history_entry = primary_key.clone().push(Element::Versionstamp(Versionstamp::Incomplete));
            let (history_key, history_offset) = history_subspace.pack_versionstamped(&history_entry)?;
            self.tx.set_versionstamped_key(history_key, history_offset, now_millis().to_be_bytes().to_vec());
        }
        Ok(())
    }

    /// Drop history entries no longer allowed by `retention`, evaluated
    /// against entries already committed before this save (the one about to
    /// be written isn't resolved yet, so it can't be read back here).
    fn prune_version_history(&mut self, pk_scope: &Subspace, retention: VersionRetention) -> RlResult<()> {
        match retention {
            VersionRetention::KeepAll => Ok(()),
            VersionRetention::KeepLastN(n) => {
                let (begin, end) = pk_scope.range();
                let entries = self.tx.get_range(&begin, &end)?;
                let keep = (n as usize).saturating_sub(1); // room for the entry this save is about to add
                let drop_count = entries.len().saturating_sub(keep);
                for (key, _) in entries.into_iter().take(drop_count) {
                    self.tx.clear(&key);
                }
                Ok(())
            }
            VersionRetention::KeepForDuration(duration) => {
                let (begin, end) = pk_scope.range();
                let entries = self.tx.get_range(&begin, &end)?;
                let cutoff = now_millis().saturating_sub(duration.as_millis() as u64);
                for (key, value) in entries {
                    if millis_from_value(&value) < cutoff {
                        self.tx.clear(&key);
                    }
                }
                Ok(())
            }
        }
    }

    /// Load a record by primary key.
    pub fn load(&mut self, primary_key: &Tuple) -> RlResult<Option<R>> {
        let key = self.keys.record_key(&self.record_type.name, primary_key)?;
        match self.tx.get(&key)? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a record, removing every maintained index entry it produced.
    pub fn delete(&mut self, primary_key: &Tuple) -> RlResult<bool> {
        let record_key = self.keys.record_key(&self.record_type.name, primary_key)?;
        let Some(old_bytes) = self.tx.get(&record_key)? else {
            return Ok(false);
        };
        let old_record = self.serializer.deserialize(&old_bytes)?;

        let indexes: Vec<IndexDescriptor> = self.maintained_indexes().into_iter().cloned().collect();
        for descriptor in &indexes {
            let old_entries = self.extract_entries(&old_record, &descriptor.root_expression)?;
            if matches!(descriptor.kind, IndexKind::Version { .. }) {
                let history_subspace = self.keys.version_history_subspace(&descriptor.name);
                let pk_scope = history_subspace.child(primary_key)?;
                let (begin, end) = pk_scope.range();
                self.tx.clear_range(&begin, &end);
                continue;
            }
            let old_covering = self.extract_covering(&old_record, descriptor)?;
            let update = IndexUpdate {
                primary_key,
                old_entries: &old_entries,
                new_entries: &[],
                old_covering: old_covering.as_ref(),
                new_covering: None,
            };
            index::maintain(self.tx, &self.keys, descriptor, &update)?;
        }

        self.tx.clear(&record_key);
        Ok(true)
    }

    /// Every record of this type, in primary-key order.
    pub fn scan(&mut self) -> RlResult<Vec<R>> {
        let subspace = self.keys.records_subspace(&self.record_type.name);
        let (begin, end) = subspace.range();
        let mut out = Vec::new();
        for (_, value) in self.tx.get_range(&begin, &end)? {
            out.push(self.serializer.deserialize(&value)?);
        }
        Ok(out)
    }
}
