//! The store header: the one record that pins a store to a schema and
//! tracks each index's build lifecycle and migration history.

use crate::error::{RecordLayerError, RlResult};
use crate::record::{FormerIndex, IndexState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CURRENT_FORMAT_VERSION: u32 = 1;

/// Persisted once per store, read on every open to validate schema
/// compatibility and recover index build/scrub state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub format_version: u32,
    pub schema_version: u64,
    pub schema_digest: String,
    pub index_states: HashMap<String, IndexState>,
    pub former_indexes: Vec<FormerIndex>,
    /// Names of migrations already applied, in application order.
    pub applied_migrations: Vec<String>,
    /// Name of the migration plan currently running, if any. Guards against
    /// two migration runners racing on the same store; a runner holding no
    /// lock refuses to start if this is set.
    pub migration_lock: Option<String>,
}

impl StoreHeader {
    pub fn new(schema_version: u64, schema_digest: String) -> Self {
        Self {
            format_version: CURRENT_FORMAT_VERSION,
            schema_version,
            schema_digest,
            index_states: HashMap::new(),
            former_indexes: Vec::new(),
            applied_migrations: Vec::new(),
            migration_lock: None,
        }
    }

    pub fn to_bytes(&self) -> RlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> RlResult<Self> {
        let header: Self = serde_json::from_slice(bytes)?;
        if header.format_version > CURRENT_FORMAT_VERSION {
            return Err(RecordLayerError::SchemaEvolutionBlocked(format!(
                "store header format version {} is newer than this build supports ({})",
                header.format_version, CURRENT_FORMAT_VERSION
            )));
        }
        Ok(header)
    }

    pub fn index_state(&self, index_name: &str) -> IndexState {
        self.index_states.get(index_name).copied().unwrap_or(IndexState::Disabled)
    }

    pub fn set_index_state(&mut self, index_name: &str, state: IndexState) {
        self.index_states.insert(index_name.to_string(), state);
    }

    pub fn has_applied(&self, migration_name: &str) -> bool {
        self.applied_migrations.iter().any(|m| m == migration_name)
    }

    pub fn record_applied(&mut self, migration_name: &str) {
        self.applied_migrations.push(migration_name.to_string());
    }

    /// Claim the migration lock for `plan_name`, failing if another runner
    /// already holds it.
    pub fn acquire_migration_lock(&mut self, plan_name: &str) -> RlResult<()> {
        if self.migration_lock.is_some() {
            return Err(RecordLayerError::MigrationLocked);
        }
        self.migration_lock = Some(plan_name.to_string());
        Ok(())
    }

    pub fn release_migration_lock(&mut self) {
        self.migration_lock = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut header = StoreHeader::new(1, "abc".into());
        header.set_index_state("by_email", IndexState::Readable);
        let bytes = header.to_bytes().unwrap();
        let back = StoreHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, back);
    }

    #[test]
    fn missing_index_state_defaults_to_disabled() {
        let header = StoreHeader::new(1, "abc".into());
        assert_eq!(header.index_state("nonexistent"), IndexState::Disabled);
    }

    #[test]
    fn future_format_version_is_rejected() {
        let mut header = StoreHeader::new(1, "abc".into());
        header.format_version = CURRENT_FORMAT_VERSION + 1;
        let bytes = header.to_bytes().unwrap();
        assert!(StoreHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn migration_tracking() {
        let mut header = StoreHeader::new(1, "abc".into());
        assert!(!header.has_applied("m1"));
        header.record_applied("m1");
        assert!(header.has_applied("m1"));
    }

    #[test]
    fn migration_lock_rejects_a_second_holder() {
        let mut header = StoreHeader::new(1, "abc".into());
        header.acquire_migration_lock("plan-a").unwrap();
        let err = header.acquire_migration_lock("plan-b").unwrap_err();
        assert!(matches!(err, RecordLayerError::MigrationLocked));
        header.release_migration_lock();
        header.acquire_migration_lock("plan-b").unwrap();
    }
}
