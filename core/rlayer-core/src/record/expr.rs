//! Index root expressions: field paths, concatenations, and function
//! applications over a record's extracted fields.

use crate::error::{RecordLayerError, RlResult};
use crate::tuple::{Element, Tuple};
use serde::{Deserialize, Serialize};

/// An index's `rootExpression`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// A field path as understood by `RecordSerializer::extract_field`.
    Field(String),
    /// Concatenate the tuples produced by each sub-expression, in order. If
    /// any sub-expression is multi-valued, the result is the cartesian
    /// product (one entry per combination) — this is how a fan-out index
    /// over a repeated field produces one entry per element.
    Concat(Vec<Expression>),
    /// Apply a named, registered single-valued function to the values
    /// produced by each argument expression.
    Function(String, Vec<Expression>),
}

impl Expression {
    pub fn field(name: impl Into<String>) -> Self {
        Expression::Field(name.into())
    }

    /// Every field path this expression reads, for callers that want to
    /// extract just the fields an index needs.
    pub fn field_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_field_paths(&mut out);
        out
    }

    fn collect_field_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::Field(name) => out.push(name),
            Expression::Concat(parts) => parts.iter().for_each(|p| p.collect_field_paths(out)),
            Expression::Function(_, args) => args.iter().for_each(|a| a.collect_field_paths(out)),
        }
    }

    /// Evaluate this expression against a field-value lookup, returning one
    /// [`Tuple`] per fan-out combination.
    pub fn evaluate(&self, get_field: &dyn Fn(&str) -> RlResult<Vec<Element>>) -> RlResult<Vec<Tuple>> {
        let combinations = self.evaluate_combinations(get_field)?;
        Ok(combinations
            .into_iter()
            .map(Tuple::from_elements)
            .collect())
    }

    fn evaluate_combinations(
        &self,
        get_field: &dyn Fn(&str) -> RlResult<Vec<Element>>,
    ) -> RlResult<Vec<Vec<Element>>> {
        match self {
            Expression::Field(name) => {
                let values = get_field(name)?;
                Ok(values.into_iter().map(|v| vec![v]).collect())
            }
            Expression::Concat(parts) => {
                let mut combos: Vec<Vec<Element>> = vec![Vec::new()];
                for part in parts {
                    let part_combos = part.evaluate_combinations(get_field)?;
                    let mut next = Vec::with_capacity(combos.len() * part_combos.len());
                    for prefix in &combos {
                        for suffix in &part_combos {
                            let mut combined = prefix.clone();
                            combined.extend(suffix.clone());
                            next.push(combined);
                        }
                    }
                    combos = next;
                }
                Ok(combos)
            }
            Expression::Function(name, args) => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    let combos = arg.evaluate_combinations(get_field)?;
                    let single = combos.into_iter().next().ok_or_else(|| {
                        RecordLayerError::UnsupportedElement(format!(
                            "function '{name}' argument produced no values"
                        ))
                    })?;
                    if single.len() != 1 {
                        return Err(RecordLayerError::UnsupportedElement(format!(
                            "function '{name}' arguments must be single-valued"
                        )));
                    }
                    arg_values.push(single.into_iter().next().unwrap());
                }
                let result = apply_function(name, &arg_values)?;
                Ok(vec![vec![result]])
            }
        }
    }
}

fn apply_function(name: &str, args: &[Element]) -> RlResult<Element> {
    match name {
        "to_lower" => match args {
            [Element::String(s)] => Ok(Element::String(s.to_lowercase())),
            _ => Err(RecordLayerError::UnsupportedElement(
                "to_lower expects one string argument".into(),
            )),
        },
        "len" => match args {
            [Element::String(s)] => Ok(Element::Int(s.len() as i64)),
            [Element::Bytes(b)] => Ok(Element::Int(b.len() as i64)),
            [Element::Tuple(t)] => Ok(Element::Int(t.len() as i64)),
            _ => Err(RecordLayerError::UnsupportedElement(
                "len expects one string, bytes, or tuple argument".into(),
            )),
        },
        other => Err(RecordLayerError::UnsupportedElement(format!(
            "unknown index expression function '{other}'"
        ))),
    }
}
