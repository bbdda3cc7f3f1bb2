//! `RecordSerializer` contract.
//!
//! Design freedom: any encoding that preserves round-trip and supports field
//! extraction is acceptable — the store never inspects bytes between
//! serialize/deserialize. [`JsonRecordSerializer`] is the concrete
//! implementation this crate ships, grounded on `serde_json` (already an
//! ambient dependency for the store header); it is not the only legal
//! implementation of the trait.

use crate::error::{RecordLayerError, RlResult};
use crate::tuple::{Element, Tuple};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Serialize/deserialize one record of type `R` and extract typed field
/// values by dotted path without the store needing to know `R`'s shape.
pub trait RecordSerializer<R>: Send + Sync {
    fn serialize(&self, record: &R) -> RlResult<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> RlResult<R>;

    /// Zero or more values for `path` (multi-valued paths — e.g. an array
    /// field — yield multiple values; optional/absent paths yield zero).
    fn extract_field(&self, record: &R, path: &str) -> RlResult<Vec<Element>>;

    /// The record's primary key, built from its designated primary-key
    /// fields. Must be totally deterministic from the record's fields.
    fn primary_key(&self, record: &R) -> RlResult<Tuple>;

    /// Rebuild a record from a covering index entry's field names and values,
    /// without a record fetch. Only called when the record type declares
    /// `supports_covering_reconstruction` and the index covers every field
    /// the query needs; the default rejects reconstruction, since not every
    /// serializer can invert its own encoding from a partial field set.
    fn reconstruct_from_covering(&self, fields: &[String], values: &Tuple) -> RlResult<R> {
        let _ = (fields, values);
        Err(RecordLayerError::MalformedRecord(
            "this serializer does not support covering-index reconstruction".into(),
        ))
    }
}

/// A `serde`-based serializer: records round-trip through JSON bytes, and
/// fields are extracted by re-serializing to `serde_json::Value` and
/// walking a dotted path.
pub struct JsonRecordSerializer<R> {
    primary_key_fields: Vec<String>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> JsonRecordSerializer<R> {
    pub fn new(primary_key_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            primary_key_fields: primary_key_fields.into_iter().map(Into::into).collect(),
            _marker: PhantomData,
        }
    }
}

impl<R> RecordSerializer<R> for JsonRecordSerializer<R>
where
    R: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, record: &R) -> RlResult<Vec<u8>> {
        Ok(serde_json::to_vec(record)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> RlResult<R> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn extract_field(&self, record: &R, path: &str) -> RlResult<Vec<Element>> {
        let value = serde_json::to_value(record)
            .map_err(|e| RecordLayerError::MalformedRecord(e.to_string()))?;
        let mut out = Vec::new();
        collect_path(&value, path.split('.').collect::<Vec<_>>().as_slice(), &mut out)?;
        Ok(out)
    }

    fn primary_key(&self, record: &R) -> RlResult<Tuple> {
        let mut elements = Vec::with_capacity(self.primary_key_fields.len());
        for field in &self.primary_key_fields {
            let values = self.extract_field(record, field)?;
            if values.len() != 1 {
                return Err(RecordLayerError::MalformedRecord(format!(
                    "primary key field '{field}' must yield exactly one value, got {}",
                    values.len()
                )));
            }
            elements.push(values.into_iter().next().unwrap());
        }
        Ok(Tuple::from_elements(elements))
    }

    /// Builds a flat JSON object from `fields`/`values` and deserializes it
    /// as `R`. Only flat (non-dotted) field paths are supported; a covering
    /// index over a nested path cannot be reconstructed this way.
    fn reconstruct_from_covering(&self, fields: &[String], values: &Tuple) -> RlResult<R> {
        if fields.len() != values.elements.len() {
            return Err(RecordLayerError::MalformedRecord(
                "covering field count does not match entry arity".into(),
            ));
        }
        let mut obj = serde_json::Map::new();
        for (field, element) in fields.iter().zip(values.elements.iter()) {
            obj.insert(field.clone(), element_to_json_scalar(element));
        }
        serde_json::from_value(serde_json::Value::Object(obj)).map_err(|e| RecordLayerError::MalformedRecord(e.to_string()))
    }
}

fn collect_path(value: &serde_json::Value, path: &[&str], out: &mut Vec<Element>) -> RlResult<()> {
    match path {
        [] => {
            out.push(json_scalar_to_element(value)?);
            Ok(())
        }
        [head, rest @ ..] => match value {
            serde_json::Value::Object(map) => match map.get(*head) {
                Some(child) => collect_path(child, rest, out),
                None => Ok(()), // absent optional path yields zero values
            },
            serde_json::Value::Array(items) => {
                for item in items {
                    collect_path(item, path, out)?;
                }
                Ok(())
            }
            serde_json::Value::Null => Ok(()),
            _ => Err(RecordLayerError::MalformedRecord(format!(
                "path segment '{head}' does not resolve against a scalar value"
            ))),
        },
    }
}

fn element_to_json_scalar(element: &Element) -> serde_json::Value {
    match element {
        Element::Null => serde_json::Value::Null,
        Element::Bool(b) => serde_json::Value::Bool(*b),
        Element::Int(i) => serde_json::Value::from(*i),
        Element::Double(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
        Element::Float(f) => serde_json::Number::from_f64(*f as f64).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
        Element::String(s) => serde_json::Value::String(s.clone()),
        Element::Bytes(b) => serde_json::Value::Array(b.iter().map(|&x| serde_json::Value::from(x)).collect()),
        Element::Tuple(t) => serde_json::Value::Array(t.elements.iter().map(element_to_json_scalar).collect()),
        Element::Uuid(u) => serde_json::Value::String(u.to_string()),
        Element::Versionstamp(_) => serde_json::Value::Null,
    }
}

fn json_scalar_to_element(value: &serde_json::Value) -> RlResult<Element> {
    match value {
        serde_json::Value::Null => Ok(Element::Null),
        serde_json::Value::Bool(b) => Ok(Element::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Element::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Element::Double(f))
            } else {
                Err(RecordLayerError::MalformedRecord(format!(
                    "unsupported numeric value: {n}"
                )))
            }
        }
        serde_json::Value::String(s) => Ok(Element::String(s.clone())),
        serde_json::Value::Array(items) => {
            // A leaf array of scalars: fold to a nested Tuple element.
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                elements.push(json_scalar_to_element(item)?);
            }
            Ok(Element::Tuple(Tuple::from_elements(elements)))
        }
        serde_json::Value::Object(_) => Err(RecordLayerError::MalformedRecord(
            "cannot convert a JSON object to a single tuple element; extend the field path".into(),
        )),
    }
}
