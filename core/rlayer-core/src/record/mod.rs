//! Record model: serialization, index root expressions, and schema descriptors.

pub mod expr;
pub mod schema;
pub mod serializer;

pub use expr::Expression;
pub use schema::{
    FieldDescriptor, FormerIndex, IndexDescriptor, IndexKind, IndexState, IndexStateMap,
    RecordType, Schema, SpatialCoordinateSystem, SpatialIndexMetadata, TieBreak, VectorMetric,
    VectorOptions, VectorStrategy,
};
pub use serializer::{JsonRecordSerializer, RecordSerializer};
