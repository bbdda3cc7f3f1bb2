//! Schema & metadata.
//!
//! The reflective macro/annotation layer that would generate these
//! descriptors from application-facing record types is out of scope; this
//! module is the descriptor contract such a layer, or a hand-written
//! caller, produces.

use crate::config::VersionRetention;
use crate::record::expr::Expression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-index lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Disabled,
    WriteOnly,
    Readable,
}

impl IndexState {
    /// `readable` ⇒ maintained AND query-visible; `writeOnly` ⇒ maintained
    /// only; `disabled` ⇒ neither.
    pub fn is_maintained(self) -> bool {
        matches!(self, IndexState::WriteOnly | IndexState::Readable)
    }

    pub fn is_queryable(self) -> bool {
        matches!(self, IndexState::Readable)
    }
}

/// Tie-break rule for a rank index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    PrimaryKey,
    InsertionTimestamp,
    Field(String),
}

/// Distance metric for a vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorMetric {
    Cosine,
    L2,
    InnerProduct,
}

/// Whether a vector index builds/searches an HNSW graph or falls back to a
/// linear scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorStrategy {
    Auto,
    Hnsw,
    Flat,
}

/// HNSW/flat-scan configuration for a vector index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VectorOptions {
    pub dimensions: usize,
    pub metric: VectorMetric,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub strategy: VectorStrategy,
    /// Below this record count a flat scan is used even if `strategy` is `Auto`.
    pub flat_scan_threshold: usize,
}

impl Default for VectorOptions {
    fn default() -> Self {
        Self {
            dimensions: 0,
            metric: VectorMetric::Cosine,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            strategy: VectorStrategy::Auto,
            flat_scan_threshold: 1000,
        }
    }
}

/// Coordinate system for a spatial index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpatialCoordinateSystem {
    Geographic,
    Cartesian,
}

/// The source fields a spatial index reads coordinates from, so a post-filter
/// distance check can read them back from a candidate record without
/// guessing field names by convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialIndexMetadata {
    pub coordinate_system: SpatialCoordinateSystem,
    pub latitude_field: String,
    pub longitude_field: String,
}

/// The kind-specific rule and options for one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexKind {
    Value,
    Unique,
    Count,
    Sum,
    Min,
    Max,
    Average,
    Rank { tie_break: TieBreak },
    Version { retention: VersionRetention },
    Permuted { base_index: String, permutation: Vec<usize> },
    Vector(VectorOptions),
    Spatial(SpatialIndexMetadata),
}

/// One named, typed index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub kind: IndexKind,
    pub root_expression: Expression,
    pub applies_to_types: Vec<String>,
    /// Fields materialized into the entry's value so queries need no record
    /// fetch.
    pub covering_fields: Vec<String>,
}

impl IndexDescriptor {
    pub fn applies_to(&self, type_name: &str) -> bool {
        self.applies_to_types.iter().any(|t| t == type_name)
    }

    pub fn is_covering(&self) -> bool {
        !self.covering_fields.is_empty()
    }
}

/// A tombstone for a removed index: its name and former subspace key, kept
/// so a later schema cannot silently reuse its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormerIndex {
    pub name: String,
    pub subspace_key: Vec<u8>,
    pub root_expression: Expression,
}

/// A field in a record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub optional: bool,
    pub repeated: bool,
}

/// One record type descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordType {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub primary_key_fields: Vec<String>,
    /// Fields a `CoveringIndexScan` may reconstruct a record from, if an
    /// index covers them all.
    pub supports_covering_reconstruction: bool,
}

/// A full schema: record types, their indexes, and schema evolution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u64,
    pub record_types: Vec<RecordType>,
    pub indexes: Vec<IndexDescriptor>,
    pub former_indexes: Vec<FormerIndex>,
}

impl Schema {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            record_types: Vec::new(),
            indexes: Vec::new(),
            former_indexes: Vec::new(),
        }
    }

    pub fn record_type(&self, name: &str) -> Option<&RecordType> {
        self.record_types.iter().find(|t| t.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn indexes_for_type(&self, type_name: &str) -> Vec<&IndexDescriptor> {
        self.indexes.iter().filter(|i| i.applies_to(type_name)).collect()
    }

    /// A deterministic digest of this schema's shape, stored in the header
    /// so a store can detect it was opened against a different schema.
    pub fn digest(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = ahash::AHasher::default();
        use std::hash::{Hash, Hasher};
        json.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// A new index must not reuse a `FormerIndex`'s subspace key unless its
    /// root expression is identical.
    pub fn validate_no_former_index_reuse(&self, candidate: &IndexDescriptor, candidate_key: &[u8]) -> Option<String> {
        for former in &self.former_indexes {
            if former.subspace_key == candidate_key && former.root_expression != candidate.root_expression {
                return Some(format!(
                    "index '{}' would reuse former index '{}' subspace bytes with a different expression",
                    candidate.name, former.name
                ));
            }
        }
        None
    }
}

/// Per-index lifecycle state, persisted in the store header, keyed by index name.
pub type IndexStateMap = HashMap<String, IndexState>;
