//! Query filter expressions over typed field paths, and their normalization
//! to disjunctive normal form for the planner.

use crate::error::RlResult;
use crate::tuple::Element;

/// A scalar comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A filter over field paths, evaluated against a record's extracted fields.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Compare { field: String, op: Comparison, value: Element },
    In { field: String, values: Vec<Element> },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

/// One atomic (possibly negated) test in a DNF conjunct.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Compare { field: String, op: Comparison, value: Element, negated: bool },
    In { field: String, values: Vec<Element>, negated: bool },
}

impl Literal {
    pub fn field(&self) -> &str {
        match self {
            Literal::Compare { field, .. } => field,
            Literal::In { field, .. } => field,
        }
    }

    pub fn matches(&self, values: &[Element]) -> bool {
        let positive = match self {
            Literal::Compare { op, value, .. } => values.iter().any(|v| compare_matches(*op, v, value)),
            Literal::In { values: set, .. } => values.iter().any(|v| set.contains(v)),
        };
        match self {
            Literal::Compare { negated, .. } | Literal::In { negated, .. } => positive != *negated,
        }
    }
}

fn compare_matches(op: Comparison, actual: &Element, expected: &Element) -> bool {
    match op {
        Comparison::Eq => actual == expected,
        Comparison::Lt => actual.partial_cmp(expected) == Some(std::cmp::Ordering::Less),
        Comparison::Lte => matches!(
            actual.partial_cmp(expected),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        Comparison::Gt => actual.partial_cmp(expected) == Some(std::cmp::Ordering::Greater),
        Comparison::Gte => matches!(
            actual.partial_cmp(expected),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
    }
}

impl FilterExpr {
    pub fn eq(field: impl Into<String>, value: Element) -> Self {
        FilterExpr::Compare { field: field.into(), op: Comparison::Eq, value }
    }

    /// Evaluate directly against a field lookup (used by the `Filter` plan
    /// node to apply residual predicates the chosen index didn't capture).
    pub fn matches(&self, get_field: &dyn Fn(&str) -> RlResult<Vec<Element>>) -> RlResult<bool> {
        Ok(self.to_dnf().iter().any(|conjunct| {
            conjunct.iter().all(|lit| match get_field(lit.field()) {
                Ok(values) => lit.matches(&values),
                Err(_) => false,
            })
        }))
    }

    /// Disjunctive normal form: an OR of ANDs of (possibly negated) literals.
    pub fn to_dnf(&self) -> Vec<Vec<Literal>> {
        distribute(&push_not_inward(self, false))
    }
}

/// Intermediate negation-normal-form tree: NOT pushed down to literals only.
enum Nnf {
    And(Vec<Nnf>),
    Or(Vec<Nnf>),
    Lit(Literal),
}

fn push_not_inward(expr: &FilterExpr, negate: bool) -> Nnf {
    match expr {
        FilterExpr::Compare { field, op, value } => Nnf::Lit(Literal::Compare {
            field: field.clone(),
            op: *op,
            value: value.clone(),
            negated: negate,
        }),
        FilterExpr::In { field, values } => Nnf::Lit(Literal::In {
            field: field.clone(),
            values: values.clone(),
            negated: negate,
        }),
        FilterExpr::Not(inner) => push_not_inward(inner, !negate),
        FilterExpr::And(parts) => {
            let children = parts.iter().map(|p| push_not_inward(p, negate)).collect();
            if negate {
                Nnf::Or(children)
            } else {
                Nnf::And(children)
            }
        }
        FilterExpr::Or(parts) => {
            let children = parts.iter().map(|p| push_not_inward(p, negate)).collect();
            if negate {
                Nnf::And(children)
            } else {
                Nnf::Or(children)
            }
        }
    }
}

fn distribute(node: &Nnf) -> Vec<Vec<Literal>> {
    match node {
        Nnf::Lit(l) => vec![vec![l.clone()]],
        Nnf::Or(parts) => parts.iter().flat_map(distribute).collect(),
        Nnf::And(parts) => {
            let mut acc: Vec<Vec<Literal>> = vec![Vec::new()];
            for part in parts {
                let part_dnf = distribute(part);
                let mut next = Vec::with_capacity(acc.len() * part_dnf.len());
                for prefix in &acc {
                    for suffix in &part_dnf {
                        let mut combined = prefix.clone();
                        combined.extend(suffix.clone());
                        next.push(combined);
                    }
                }
                acc = next;
            }
            acc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_comparison_is_one_conjunct() {
        let expr = FilterExpr::eq("city", Element::String("Tokyo".into()));
        let dnf = expr.to_dnf();
        assert_eq!(dnf.len(), 1);
        assert_eq!(dnf[0].len(), 1);
    }

    #[test]
    fn or_becomes_multiple_disjuncts() {
        let expr = FilterExpr::Or(vec![
            FilterExpr::eq("city", Element::String("Tokyo".into())),
            FilterExpr::eq("city", Element::String("Osaka".into())),
        ]);
        assert_eq!(expr.to_dnf().len(), 2);
    }

    #[test]
    fn and_distributes_over_or() {
        let expr = FilterExpr::And(vec![
            FilterExpr::eq("active", Element::Bool(true)),
            FilterExpr::Or(vec![
                FilterExpr::eq("city", Element::String("Tokyo".into())),
                FilterExpr::eq("city", Element::String("Osaka".into())),
            ]),
        ]);
        let dnf = expr.to_dnf();
        assert_eq!(dnf.len(), 2);
        assert!(dnf.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn not_pushes_through_and_via_de_morgan() {
        let expr = FilterExpr::Not(Box::new(FilterExpr::And(vec![
            FilterExpr::eq("a", Element::Int(1)),
            FilterExpr::eq("b", Element::Int(2)),
        ])));
        let dnf = expr.to_dnf();
        assert_eq!(dnf.len(), 2);
        assert!(dnf.iter().flatten().all(|l| matches!(l, Literal::Compare { negated: true, .. })));
    }

    #[test]
    fn matches_evaluates_against_a_field_lookup() {
        let expr = FilterExpr::eq("city", Element::String("Tokyo".into()));
        let lookup = |name: &str| -> RlResult<Vec<Element>> {
            if name == "city" {
                Ok(vec![Element::String("Tokyo".into())])
            } else {
                Ok(vec![])
            }
        };
        assert!(expr.matches(&lookup).unwrap());
    }
}
