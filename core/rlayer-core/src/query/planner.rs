//! Planner: turns a filter/sort/limit request over one record type into a
//! [`Plan`] tree, preferring the best matching index per DNF disjunct and
//! falling back to a full scan plus residual filter otherwise.
//!
//! An index's leading run of equality-matched fields narrows an
//! `IndexScan`'s range; an `IN` literal on the field right after that run
//! becomes an `InJoin` instead, one lookup per candidate value. A second,
//! independent single-field index still carrying an unconsumed `IN`
//! literal is folded in as another `InJoin` under an `Intersection`, so a
//! conjunct like `city = 'Tokyo' AND age IN (20, 30)` over two separate
//! indexes narrows by both instead of leaving the second field to a
//! residual `Filter`. Every remaining literal in the conjunct —
//! including every inequality — stays in a residual `Filter` rather than
//! also narrowing the scanned range. Index-range narrowing by inequality
//! needs to reason about inclusive/exclusive bounds per comparison
//! operator, which buys precision the store has no statistics to justify
//! spending on yet; leaving the literal in the residual filter keeps the
//! plan correct (just over-fetches a flat prefix group) and the planner
//! simple. Caches assembled plans by request shape so repeated queries
//! over an unchanged schema skip re-planning.

use crate::query::filter::{Comparison, FilterExpr, Literal};
use crate::query::plan::{EntryRange, Plan};
use crate::record::{IndexDescriptor, IndexKind, Schema};
use crate::tuple::{Element, Tuple};
use std::collections::HashMap;
use std::sync::Mutex;

/// A query against one record type: a filter, an output ordering, and an
/// optional row cap.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub record_type: String,
    pub filter: Option<FilterExpr>,
    pub sort: Vec<String>,
    pub limit: Option<usize>,
}

pub struct Planner {
    schema: Schema,
    cache: Mutex<HashMap<String, Plan>>,
}

impl Planner {
    pub fn new(schema: Schema) -> Self {
        Self { schema, cache: Mutex::new(HashMap::new()) }
    }

    pub fn plan(&self, request: &QueryRequest) -> Plan {
        let cache_key = format!("{request:?}");
        if let Some(cached) = self.cache.lock().unwrap().get(&cache_key) {
            return cached.clone();
        }
        let plan = self.build(request);
        self.cache.lock().unwrap().insert(cache_key, plan.clone());
        plan
    }

    fn build(&self, request: &QueryRequest) -> Plan {
        let indexes = self.schema.indexes_for_type(&request.record_type);
        let disjuncts: Vec<Vec<Literal>> = match &request.filter {
            Some(expr) => expr.to_dnf(),
            None => vec![Vec::new()],
        };

        let mut branches: Vec<Plan> = disjuncts
            .into_iter()
            .map(|conjunct| self.plan_conjunct(&request.record_type, &indexes, conjunct))
            .collect();

        let mut plan = if branches.len() == 1 {
            branches.pop().unwrap()
        } else {
            Plan::Union { children: branches }
        };

        if !request.sort.is_empty() {
            plan = Plan::Sort { child: Box::new(plan), keys: request.sort.clone() };
        }
        if let Some(n) = request.limit {
            plan = Plan::Limit { child: Box::new(plan), n };
        }
        plan
    }

    fn plan_conjunct(&self, record_type: &str, indexes: &[&IndexDescriptor], conjunct: Vec<Literal>) -> Plan {
        let Some(index_match) = best_index_match(indexes, &conjunct) else {
            return match conjunct_to_filter(&conjunct) {
                Some(predicate) => Plan::Filter {
                    child: Box::new(Plan::FullScan { record_type: record_type.to_string() }),
                    predicate,
                },
                None => Plan::FullScan { record_type: record_type.to_string() },
            };
        };

        let IndexMatch { descriptor, equality_len, in_match } = index_match;
        let fields = descriptor.root_expression.field_paths();
        let mut prefix_values = Vec::with_capacity(equality_len);
        let mut consumed = Vec::with_capacity(equality_len + 1);
        for field in fields.iter().take(equality_len) {
            let (idx, value) = find_eq(&conjunct, field).expect("scored match guarantees an equality literal");
            prefix_values.push(value);
            consumed.push(idx);
        }

        let scan = if let Some((in_idx, in_values)) = in_match {
            consumed.push(in_idx);
            Plan::InJoin { index_name: descriptor.name.clone(), values: in_join_values(&prefix_values, in_values) }
        } else {
            let range = EntryRange::prefix(Tuple::from_elements(prefix_values.clone()));
            let record_type_supports_covering = self
                .schema
                .record_type(record_type)
                .map(|rt| rt.supports_covering_reconstruction)
                .unwrap_or(false);
            let fully_matched = equality_len == fields.len();
            if fully_matched && descriptor.is_covering() && record_type_supports_covering {
                Plan::CoveringIndexScan { index_name: descriptor.name.clone(), range }
            } else {
                Plan::IndexScan { index_name: descriptor.name.clone(), range, ascending: true }
            }
        };

        let branch = self.intersect_remaining_in_matches(indexes, &conjunct, &mut consumed, scan);

        let residual: Vec<Literal> = conjunct
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !consumed.contains(i))
            .map(|(_, lit)| lit)
            .collect();

        match conjunct_to_filter(&residual) {
            Some(predicate) => Plan::Filter { child: Box::new(branch), predicate },
            None => branch,
        }
    }

    /// Fold any other single-field index still carrying an unconsumed `IN`
    /// literal into the plan as another `InJoin`, intersected against what
    /// was already chosen. Leaves `primary` untouched if none apply.
    fn intersect_remaining_in_matches(
        &self,
        indexes: &[&IndexDescriptor],
        conjunct: &[Literal],
        consumed: &mut Vec<usize>,
        primary: Plan,
    ) -> Plan {
        let mut children = vec![primary];
        for idx in indexes.iter().filter(|i| matches!(i.kind, IndexKind::Value | IndexKind::Unique)) {
            let fields = idx.root_expression.field_paths();
            if fields.len() != 1 {
                continue;
            }
            let Some((lit_idx, values)) = find_in(conjunct, fields[0]) else { continue };
            if consumed.contains(&lit_idx) {
                continue;
            }
            consumed.push(lit_idx);
            children.push(Plan::InJoin { index_name: idx.name.clone(), values: in_join_values(&[], values) });
        }
        if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Plan::Intersection { children }
        }
    }
}

fn in_join_values(prefix: &[Element], in_values: Vec<Element>) -> Vec<Tuple> {
    in_values
        .into_iter()
        .map(|value| {
            let mut elements = prefix.to_vec();
            elements.push(value);
            Tuple::from_elements(elements)
        })
        .collect()
}

/// How an index's leading fields line up against one DNF conjunct: a run
/// of equality-matched fields, optionally followed by one `IN`-list match
/// on the very next field.
struct IndexMatch<'a> {
    descriptor: &'a IndexDescriptor,
    equality_len: usize,
    in_match: Option<(usize, Vec<Element>)>,
}

impl IndexMatch<'_> {
    fn matched_fields(&self) -> usize {
        self.equality_len + usize::from(self.in_match.is_some())
    }
}

/// The index (among candidates applying to this record type) whose root
/// expression's leading fields have the longest consecutive run matched by
/// an equality literal in `conjunct`, optionally extended by one more field
/// matched by an `IN` literal, ties broken toward a covering index.
fn best_index_match<'a>(indexes: &[&'a IndexDescriptor], conjunct: &[Literal]) -> Option<IndexMatch<'a>> {
    indexes
        .iter()
        .filter(|idx| matches!(idx.kind, IndexKind::Value | IndexKind::Unique))
        .filter_map(|idx| {
            let fields = idx.root_expression.field_paths();
            let mut matched = 0;
            for field in &fields {
                if find_eq(conjunct, field).is_some() {
                    matched += 1;
                } else {
                    break;
                }
            }
            let in_match = fields.get(matched).and_then(|field| find_in(conjunct, field));
            if matched == 0 && in_match.is_none() {
                None
            } else {
                Some(IndexMatch { descriptor: *idx, equality_len: matched, in_match })
            }
        })
        .max_by_key(|m| (m.matched_fields(), m.descriptor.is_covering()))
}

fn find_eq(conjunct: &[Literal], field: &str) -> Option<(usize, Element)> {
    conjunct.iter().enumerate().find_map(|(i, lit)| match lit {
        Literal::Compare { field: f, op: Comparison::Eq, value, negated: false } if f == field => {
            Some((i, value.clone()))
        }
        _ => None,
    })
}

fn find_in(conjunct: &[Literal], field: &str) -> Option<(usize, Vec<Element>)> {
    conjunct.iter().enumerate().find_map(|(i, lit)| match lit {
        Literal::In { field: f, values, negated: false } if f == field => Some((i, values.clone())),
        _ => None,
    })
}

fn conjunct_to_filter(literals: &[Literal]) -> Option<FilterExpr> {
    let parts: Vec<FilterExpr> = literals.iter().map(literal_to_filter).collect();
    match parts.len() {
        0 => None,
        1 => Some(parts.into_iter().next().unwrap()),
        _ => Some(FilterExpr::And(parts)),
    }
}

fn literal_to_filter(literal: &Literal) -> FilterExpr {
    match literal {
        Literal::Compare { field, op, value, negated } => {
            let base = FilterExpr::Compare { field: field.clone(), op: *op, value: value.clone() };
            if *negated {
                FilterExpr::Not(Box::new(base))
            } else {
                base
            }
        }
        Literal::In { field, values, negated } => {
            let base = FilterExpr::In { field: field.clone(), values: values.clone() };
            if *negated {
                FilterExpr::Not(Box::new(base))
            } else {
                base
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Expression, FieldDescriptor, RecordType};

    fn schema_with_city_and_age_index() -> Schema {
        let mut schema = Schema::new(1);
        schema.record_types.push(RecordType {
            name: "User".into(),
            fields: vec![
                FieldDescriptor { name: "id".into(), optional: false, repeated: false },
                FieldDescriptor { name: "city".into(), optional: false, repeated: false },
                FieldDescriptor { name: "age".into(), optional: false, repeated: false },
            ],
            primary_key_fields: vec!["id".into()],
            supports_covering_reconstruction: true,
        });
        schema.indexes.push(IndexDescriptor {
            name: "by_city".into(),
            kind: IndexKind::Value,
            root_expression: Expression::field("city"),
            applies_to_types: vec!["User".into()],
            covering_fields: vec![],
        });
        schema
    }

    fn schema_with_city_and_age_as_separate_indexes() -> Schema {
        let mut schema = schema_with_city_and_age_index();
        schema.indexes.push(IndexDescriptor {
            name: "by_age".into(),
            kind: IndexKind::Value,
            root_expression: Expression::field("age"),
            applies_to_types: vec!["User".into()],
            covering_fields: vec![],
        });
        schema
    }

    #[test]
    fn equality_filter_uses_matching_index() {
        let planner = Planner::new(schema_with_city_and_age_index());
        let request = QueryRequest {
            record_type: "User".into(),
            filter: Some(FilterExpr::eq("city", Element::String("Tokyo".into()))),
            sort: vec![],
            limit: None,
        };
        let plan = planner.plan(&request);
        assert!(matches!(plan, Plan::IndexScan { ref index_name, .. } if index_name == "by_city"));
    }

    #[test]
    fn unmatched_field_falls_back_to_full_scan_with_filter() {
        let planner = Planner::new(schema_with_city_and_age_index());
        let request = QueryRequest {
            record_type: "User".into(),
            filter: Some(FilterExpr::Compare {
                field: "age".into(),
                op: Comparison::Gt,
                value: Element::Int(18),
            }),
            sort: vec![],
            limit: None,
        };
        let plan = planner.plan(&request);
        match plan {
            Plan::Filter { child, .. } => assert!(matches!(*child, Plan::FullScan { .. })),
            other => panic!("expected a filtered full scan, got {other:?}"),
        }
    }

    #[test]
    fn or_of_two_matches_becomes_a_union() {
        let planner = Planner::new(schema_with_city_and_age_index());
        let request = QueryRequest {
            record_type: "User".into(),
            filter: Some(FilterExpr::Or(vec![
                FilterExpr::eq("city", Element::String("Tokyo".into())),
                FilterExpr::eq("city", Element::String("Osaka".into())),
            ])),
            sort: vec![],
            limit: None,
        };
        let plan = planner.plan(&request);
        assert!(matches!(plan, Plan::Union { ref children } if children.len() == 2));
    }

    #[test]
    fn in_list_on_an_indexed_field_becomes_an_in_join() {
        let planner = Planner::new(schema_with_city_and_age_index());
        let request = QueryRequest {
            record_type: "User".into(),
            filter: Some(FilterExpr::In {
                field: "city".into(),
                values: vec![Element::String("Tokyo".into()), Element::String("Osaka".into())],
            }),
            sort: vec![],
            limit: None,
        };
        let plan = planner.plan(&request);
        match plan {
            Plan::InJoin { index_name, values } => {
                assert_eq!(index_name, "by_city");
                assert_eq!(values.len(), 2);
            }
            other => panic!("expected an InJoin, got {other:?}"),
        }
    }

    #[test]
    fn in_list_on_an_unindexed_field_falls_back_to_full_scan_with_filter() {
        let planner = Planner::new(schema_with_city_and_age_index());
        let request = QueryRequest {
            record_type: "User".into(),
            filter: Some(FilterExpr::In { field: "age".into(), values: vec![Element::Int(20), Element::Int(30)] }),
            sort: vec![],
            limit: None,
        };
        let plan = planner.plan(&request);
        match plan {
            Plan::Filter { child, .. } => assert!(matches!(*child, Plan::FullScan { .. })),
            other => panic!("expected a filtered full scan, got {other:?}"),
        }
    }

    #[test]
    fn equality_and_in_list_across_two_indexes_intersect() {
        let planner = Planner::new(schema_with_city_and_age_as_separate_indexes());
        let request = QueryRequest {
            record_type: "User".into(),
            filter: Some(FilterExpr::And(vec![
                FilterExpr::eq("city", Element::String("Tokyo".into())),
                FilterExpr::In { field: "age".into(), values: vec![Element::Int(20), Element::Int(30)] },
            ])),
            sort: vec![],
            limit: None,
        };
        let plan = planner.plan(&request);
        match plan {
            Plan::Intersection { children } => {
                assert_eq!(children.len(), 2);
                assert!(children.iter().any(|c| matches!(c, Plan::IndexScan { index_name, .. } if index_name == "by_city")));
                assert!(children.iter().any(|c| matches!(c, Plan::InJoin { index_name, .. } if index_name == "by_age")));
            }
            other => panic!("expected an Intersection of by_city and by_age, got {other:?}"),
        }
    }

    #[test]
    fn sort_and_limit_wrap_the_chosen_plan() {
        let planner = Planner::new(schema_with_city_and_age_index());
        let request = QueryRequest {
            record_type: "User".into(),
            filter: None,
            sort: vec!["age".into()],
            limit: Some(10),
        };
        let plan = planner.plan(&request);
        match plan {
            Plan::Limit { child, n } => {
                assert_eq!(n, 10);
                assert!(matches!(*child, Plan::Sort { .. }));
            }
            other => panic!("expected Limit(Sort(..)), got {other:?}"),
        }
    }
}
