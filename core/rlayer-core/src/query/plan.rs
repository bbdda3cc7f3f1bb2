//! Query plan tree: the physical operators a [`crate::query::planner::Planner`]
//! assembles and [`crate::query::cursor`] executes.

use crate::query::filter::FilterExpr;
use crate::tuple::Tuple;

/// A bound on an index entry's value prefix (not including the primary-key
/// suffix every stored entry carries).
///
/// `inclusive_end` covers every continuation of `end` (used for an
/// equality-prefix match, where any primary key may follow); when false,
/// `end` itself is excluded, matching a `<`/`<=` upper bound. The executor
/// packs `begin`/`end` the same way [`crate::tuple::Subspace::range`] turns a
/// prefix into a half-open byte range: appending more tuple elements after a
/// packed prefix only ever extends its bytes, never rewrites them, so a bare
/// `end` pack is already a correct exclusive bound, and `end` packed plus one
/// trailing `0xff` byte covers every entry whose value equals `end`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRange {
    pub begin: Tuple,
    pub end: Tuple,
    pub inclusive_end: bool,
}

impl EntryRange {
    /// Every entry whose value is exactly `value`, any primary key.
    pub fn prefix(value: Tuple) -> Self {
        Self { begin: value.clone(), end: value, inclusive_end: true }
    }

    /// Every entry in the index, any value, any primary key.
    pub fn all() -> Self {
        Self { begin: Tuple::new(), end: Tuple::new(), inclusive_end: true }
    }
}

#[derive(Debug, Clone)]
pub enum Plan {
    FullScan { record_type: String },
    IndexScan { index_name: String, range: EntryRange, ascending: bool },
    CoveringIndexScan { index_name: String, range: EntryRange },
    Filter { child: Box<Plan>, predicate: FilterExpr },
    Sort { child: Box<Plan>, keys: Vec<String> },
    Limit { child: Box<Plan>, n: usize },
    Distinct { child: Box<Plan>, fields: Vec<String> },
    Union { children: Vec<Plan> },
    Intersection { children: Vec<Plan> },
    InJoin { index_name: String, values: Vec<Tuple> },
}
