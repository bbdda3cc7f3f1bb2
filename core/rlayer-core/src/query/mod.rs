//! Declarative queries: filter expressions, the physical plan tree a
//! [`Planner`] assembles from them, and the [`Cursor`] that executes a plan
//! against an open transaction.

pub mod cursor;
pub mod filter;
pub mod plan;
pub mod planner;

pub use cursor::Cursor;
pub use filter::{Comparison, FilterExpr, Literal};
pub use plan::{EntryRange, Plan};
pub use planner::{Planner, QueryRequest};
