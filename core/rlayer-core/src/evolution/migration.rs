//! Migrations: ordered, idempotent schema-evolution steps applied to an
//! already-open store, tracked in the [`StoreHeader`] so a retried or
//! resumed migration plan never re-applies a step.

use crate::error::{RecordLayerError, RlResult};
use crate::kv::KvTransaction;
use crate::record::{IndexDescriptor, IndexState};
use crate::store::{StoreHeader, StoreKeys};

/// One schema-evolution action a [`Migration`] performs.
#[derive(Debug, Clone)]
pub enum MigrationOp {
    /// Register a new index in `Disabled` state; building it is a separate,
    /// longer-running step handled by an `OnlineIndexer`.
    AddIndex(IndexDescriptor),
    /// Drop an index's entries and its lifecycle state entirely.
    RemoveIndex(String),
    /// Clear an index's entries and reset it to `Disabled`, so a follow-up
    /// `OnlineIndexer` rebuilds it from scratch (used when an index's
    /// definition changed in a way that isn't a safe incremental update).
    RebuildIndex(String),
    /// Record that a field was renamed. The record serializer decides how a
    /// renamed field reads old and new bytes; this op carries no KV-level
    /// mutation of its own, it exists so the rename is tracked alongside
    /// whatever index ops came bundled with it in the same migration.
    RenameField {
        record_type: String,
        old_name: String,
        new_name: String,
    },
}

/// A single named step in a schema's migration history.
#[derive(Debug, Clone)]
pub struct Migration {
    pub name: String,
    pub ops: Vec<MigrationOp>,
}

impl Migration {
    pub fn new(name: impl Into<String>, ops: Vec<MigrationOp>) -> Self {
        Self { name: name.into(), ops }
    }

    /// Apply this migration against `header`, idempotently: a no-op if
    /// `header` already recorded it as applied.
    fn apply<Tx: KvTransaction>(&self, tx: &mut Tx, keys: &StoreKeys, header: &mut StoreHeader) -> RlResult<()> {
        if header.has_applied(&self.name) {
            return Ok(());
        }
        for (i, op) in self.ops.iter().enumerate() {
            apply_op(tx, keys, header, op).map_err(|e| RecordLayerError::MigrationFailed {
                step: format!("{}[{i}]", self.name),
                reason: e.to_string(),
            })?;
        }
        header.record_applied(&self.name);
        Ok(())
    }
}

fn apply_op<Tx: KvTransaction>(tx: &mut Tx, keys: &StoreKeys, header: &mut StoreHeader, op: &MigrationOp) -> RlResult<()> {
    match op {
        MigrationOp::AddIndex(descriptor) => {
            header.set_index_state(&descriptor.name, IndexState::Disabled);
            Ok(())
        }
        MigrationOp::RemoveIndex(name) => {
            let (begin, end) = keys.index_subspace(name).range();
            tx.clear_range(&begin, &end);
            header.index_states.remove(name);
            Ok(())
        }
        MigrationOp::RebuildIndex(name) => {
            let (begin, end) = keys.index_subspace(name).range();
            tx.clear_range(&begin, &end);
            header.set_index_state(name, IndexState::Disabled);
            Ok(())
        }
        MigrationOp::RenameField { .. } => Ok(()),
    }
}

/// An ordered sequence of migrations, run as one unit against a store's
/// already-open header and transaction. Steps already recorded as applied
/// are skipped, so re-running a plan after a partial failure only executes
/// what didn't complete.
pub struct MigrationPlan {
    pub name: String,
    pub migrations: Vec<Migration>,
}

impl MigrationPlan {
    pub fn new(name: impl Into<String>, migrations: Vec<Migration>) -> Self {
        Self { name: name.into(), migrations }
    }

    /// Run every migration in order against `header`, writing the updated
    /// header back through `tx` whether the plan succeeds or fails partway,
    /// so progress already made is not lost. Fails immediately if another
    /// plan holds the migration lock.
    pub fn run<Tx: KvTransaction>(&self, tx: &mut Tx, keys: &StoreKeys, header: &mut StoreHeader) -> RlResult<()> {
        header.acquire_migration_lock(&self.name)?;
        let result = (|| {
            for migration in &self.migrations {
                migration.apply(tx, keys, header)?;
            }
            Ok(())
        })();
        header.release_migration_lock();
        tx.set(&keys.header_key(), &header.to_bytes()?);
        result
    }
}
