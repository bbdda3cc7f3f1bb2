//! # rlayer-core
//!
//! A record-oriented storage layer over an ordered, transactional
//! key-value store: typed records, secondary indexes maintained inline with
//! every write, online (non-blocking) index construction and consistency
//! scrubbing, a declarative query planner/cursor, and schema evolution.
//!
//! ## Layering
//!
//! - [`kv`] — the dependency contract a backing KV store must satisfy
//!   ([`kv::KvDatabase`] / [`kv::KvTransaction`]), plus [`kv::memory`], an
//!   in-process reference implementation the test suite runs against.
//! - [`tuple`] — the ordered binary tuple codec ([`tuple::Tuple`]) and
//!   [`tuple::Subspace`], every key's byte-prefix scoping.
//! - [`record`] — [`record::Schema`]/[`record::RecordType`]/
//!   [`record::IndexDescriptor`] metadata, index root [`record::Expression`]s,
//!   and the [`record::RecordSerializer`] contract records round-trip
//!   through.
//! - [`store`] — [`store::RecordStore`], the transactional façade that keeps
//!   a record write and every maintained index update inside one
//!   [`kv::KvTransaction`].
//! - [`index`] — the per-kind index maintainers [`store::RecordStore`]
//!   dispatches to.
//! - [`online`] — [`online::OnlineIndexer`] and [`online::OnlineIndexScrubber`],
//!   for building/repairing an index without a single transaction spanning
//!   every record.
//! - [`query`] — [`query::FilterExpr`], the [`query::Plan`] tree a
//!   [`query::Planner`] assembles, and the [`query::Cursor`] that executes one.
//! - [`evolution`] — validating and applying schema changes to an
//!   already-populated store.
//! - [`rangeset`] — the persisted-progress structure [`online::OnlineIndexer`]
//!   resumes builds from.
//! - [`config`] — per-subsystem configuration structs.
//! - [`error`] — [`error::RecordLayerError`] and the crate-wide
//!   [`error::RlResult`] alias.
//! - [`logging`] — `tracing` subscriber setup, feature-gated behind `logging`.
//!
//! ## Example
//!
//! ```rust
//! use rlayer_core::kv::memory::MemoryDatabase;
//! use rlayer_core::kv::KvDatabase;
//! use rlayer_core::record::{FieldDescriptor, JsonRecordSerializer, RecordType};
//! use rlayer_core::store::RecordStore;
//! use rlayer_core::tuple::{Element, Subspace, Tuple};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
//! struct User {
//!     id: i64,
//!     email: String,
//! }
//!
//! # fn main() -> rlayer_core::error::RlResult<()> {
//! let db = MemoryDatabase::new();
//! let mut tx = db.begin();
//! let record_type = RecordType {
//!     name: "User".into(),
//!     fields: vec![
//!         FieldDescriptor { name: "id".into(), optional: false, repeated: false },
//!         FieldDescriptor { name: "email".into(), optional: false, repeated: false },
//!     ],
//!     primary_key_fields: vec!["id".into()],
//!     supports_covering_reconstruction: false,
//! };
//! let mut store = RecordStore::open(
//!     &mut tx,
//!     Subspace::new(b"app".to_vec()),
//!     record_type,
//!     vec![],
//!     JsonRecordSerializer::<User>::new(["id"]),
//!     1,
//!     "digest".into(),
//! )?;
//! store.save(&User { id: 1, email: "a@x.com".into() })?;
//! let loaded = store.load(&Tuple::from_elements(vec![Element::Int(1)]))?;
//! assert_eq!(loaded.unwrap().email, "a@x.com");
//! db.commit(tx)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod evolution;
pub mod index;
pub mod kv;
pub mod logging;
pub mod online;
pub mod query;
pub mod rangeset;
pub mod record;
pub mod store;
pub mod tuple;

pub use error::{RecordLayerError, RlResult};
