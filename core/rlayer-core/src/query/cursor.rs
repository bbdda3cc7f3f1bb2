//! Cursor: executes a [`Plan`] tree against an open transaction.
//!
//! Rather than a true coroutine/generator, a cursor eagerly materializes
//! each plan node's rows and the caller paginates over the finished
//! sequence by position. Every row still comes from a bounded KV range
//! fetch rather than one scan held open indefinitely, which is enough to
//! satisfy a lazily-yielding sequence without needing a native generator —
//! a plain iterator-state-machine reading is one of several legal ways to
//! build one.

use crate::error::{RecordLayerError, RlResult};
use crate::kv::KvTransaction;
use crate::query::filter::FilterExpr;
use crate::query::plan::{EntryRange, Plan};
use crate::record::{IndexDescriptor, RecordSerializer, RecordType, Schema};
use crate::store::StoreKeys;
use crate::tuple::{Element, Subspace, Tuple};
use std::collections::HashSet;

/// One executed row: the record plus its packed primary key, carried
/// alongside so set/sort/dedup operators never need `Tuple: Eq + Hash`
/// (entry tuples may hold floats).
struct Row<R> {
    pk_bytes: Vec<u8>,
    record: R,
}

pub struct Cursor<'a, Tx, R, S> {
    tx: &'a mut Tx,
    keys: &'a StoreKeys,
    schema: &'a Schema,
    serializer: &'a S,
    _marker: std::marker::PhantomData<R>,
}

impl<'a, Tx, R, S> Cursor<'a, Tx, R, S>
where
    Tx: KvTransaction,
    S: RecordSerializer<R>,
{
    pub fn new(tx: &'a mut Tx, keys: &'a StoreKeys, schema: &'a Schema, serializer: &'a S) -> Self {
        Self { tx, keys, schema, serializer, _marker: std::marker::PhantomData }
    }

    /// Execute `plan` and return its records in plan order.
    pub fn execute(&mut self, plan: &Plan) -> RlResult<Vec<R>> {
        Ok(self.run(plan)?.into_iter().map(|row| row.record).collect())
    }

    fn run(&mut self, plan: &Plan) -> RlResult<Vec<Row<R>>> {
        match plan {
            Plan::FullScan { record_type } => self.full_scan(record_type),
            Plan::IndexScan { index_name, range, ascending } => self.index_scan(index_name, range, *ascending),
            Plan::CoveringIndexScan { index_name, range } => self.covering_index_scan(index_name, range),
            Plan::Filter { child, predicate } => self.filter(child, predicate),
            Plan::Sort { child, keys } => self.sort(child, keys),
            Plan::Limit { child, n } => {
                let mut rows = self.run(child)?;
                rows.truncate(*n);
                Ok(rows)
            }
            Plan::Distinct { child, fields } => self.distinct(child, fields),
            Plan::Union { children } => self.union(children),
            Plan::Intersection { children } => self.intersection(children),
            Plan::InJoin { index_name, values } => self.in_join(index_name, values),
        }
    }

    fn index_descriptor(&self, index_name: &str) -> RlResult<IndexDescriptor> {
        self.schema
            .index(index_name)
            .cloned()
            .ok_or_else(|| RecordLayerError::IndexNotFound(index_name.to_string()))
    }

    fn record_type_for_index(&self, descriptor: &IndexDescriptor) -> RlResult<RecordType> {
        let type_name = descriptor.applies_to_types.first().ok_or_else(|| {
            RecordLayerError::MalformedRecord(format!("index '{}' applies to no record type", descriptor.name))
        })?;
        self.schema
            .record_type(type_name)
            .cloned()
            .ok_or_else(|| RecordLayerError::RecordTypeNotFound(type_name.clone()))
    }

    fn entry_byte_range(&self, index_subspace: &Subspace, range: &EntryRange) -> RlResult<(Vec<u8>, Vec<u8>)> {
        let begin = index_subspace.pack(&range.begin)?;
        let end = if range.inclusive_end {
            let mut bytes = index_subspace.pack(&range.end)?;
            bytes.push(0xff);
            bytes
        } else {
            index_subspace.pack(&range.end)?
        };
        Ok((begin, end))
    }

    /// Split a packed index-entry tuple into its value prefix and the
    /// trailing primary key, which every `Value`/`Unique`/`Permuted` entry
    /// key carries verbatim.
    fn split_primary_key(full: &Tuple, primary_key_arity: usize) -> Option<(Tuple, Tuple)> {
        if full.elements.len() < primary_key_arity {
            return None;
        }
        let split_at = full.elements.len() - primary_key_arity;
        Some((
            Tuple::from_elements(full.elements[..split_at].iter().cloned()),
            Tuple::from_elements(full.elements[split_at..].iter().cloned()),
        ))
    }

    fn full_scan(&mut self, record_type: &str) -> RlResult<Vec<Row<R>>> {
        let subspace = self.keys.records_subspace(record_type);
        let (begin, end) = subspace.range();
        let mut out = Vec::new();
        for (key, value) in self.tx.get_range(&begin, &end)? {
            let record = self.serializer.deserialize(&value)?;
            out.push(Row { pk_bytes: key, record });
        }
        Ok(out)
    }

    fn index_scan(&mut self, index_name: &str, range: &EntryRange, ascending: bool) -> RlResult<Vec<Row<R>>> {
        let descriptor = self.index_descriptor(index_name)?;
        let record_type = self.record_type_for_index(&descriptor)?;
        let primary_key_arity = record_type.primary_key_fields.len();

        let index_subspace = self.keys.index_subspace(index_name);
        let (begin, end) = self.entry_byte_range(&index_subspace, range)?;
        let mut entries = self.tx.get_range(&begin, &end)?;
        if !ascending {
            entries.reverse();
        }

        let mut out = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let full = index_subspace.unpack(&key)?;
            let Some((_, primary_key)) = Self::split_primary_key(&full, primary_key_arity) else { continue };
            let record_key = self.keys.record_key(&record_type.name, &primary_key)?;
            let Some(bytes) = self.tx.get(&record_key)? else { continue };
            let record = self.serializer.deserialize(&bytes)?;
            out.push(Row { pk_bytes: record_key, record });
        }
        Ok(out)
    }

    fn covering_index_scan(&mut self, index_name: &str, range: &EntryRange) -> RlResult<Vec<Row<R>>> {
        let descriptor = self.index_descriptor(index_name)?;
        if !descriptor.is_covering() {
            return Err(RecordLayerError::MalformedRecord(format!(
                "index '{index_name}' has no covering fields to reconstruct from"
            )));
        }
        let record_type = self.record_type_for_index(&descriptor)?;
        if !record_type.supports_covering_reconstruction {
            return Err(RecordLayerError::MalformedRecord(format!(
                "record type '{}' does not support covering-index reconstruction",
                record_type.name
            )));
        }
        let primary_key_arity = record_type.primary_key_fields.len();

        let index_subspace = self.keys.index_subspace(index_name);
        let (begin, end) = self.entry_byte_range(&index_subspace, range)?;

        let mut out = Vec::new();
        for (key, value) in self.tx.get_range(&begin, &end)? {
            let full = index_subspace.unpack(&key)?;
            let Some((_, primary_key)) = Self::split_primary_key(&full, primary_key_arity) else { continue };
            let covering = Tuple::unpack(&value)?;

            // The entry value materializes `covering_fields` only; the
            // primary key fields come from the entry key's own suffix.
            let mut field_names: Vec<String> = descriptor.covering_fields.clone();
            let mut field_values: Vec<Element> = covering.elements;
            for (name, element) in record_type.primary_key_fields.iter().zip(primary_key.elements.iter()) {
                field_names.push(name.clone());
                field_values.push(element.clone());
            }

            let record = self
                .serializer
                .reconstruct_from_covering(&field_names, &Tuple::from_elements(field_values))?;
            let record_key = self.keys.record_key(&record_type.name, &primary_key)?;
            out.push(Row { pk_bytes: record_key, record });
        }
        Ok(out)
    }

    fn filter(&mut self, child: &Plan, predicate: &FilterExpr) -> RlResult<Vec<Row<R>>> {
        let rows = self.run(child)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let get_field = |path: &str| self.serializer.extract_field(&row.record, path);
            if predicate.matches(&get_field)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn sort_key(&self, record: &R, fields: &[String]) -> RlResult<Vec<Vec<u8>>> {
        let mut key = Vec::with_capacity(fields.len());
        for field in fields {
            let values = self.serializer.extract_field(record, field)?;
            let tuple = Tuple::from_elements(values);
            key.push(tuple.pack_bytes()?);
        }
        Ok(key)
    }

    fn sort(&mut self, child: &Plan, fields: &[String]) -> RlResult<Vec<Row<R>>> {
        let rows = self.run(child)?;
        let mut keyed: Vec<(Vec<Vec<u8>>, Row<R>)> = rows
            .into_iter()
            .map(|row| Ok((self.sort_key(&row.record, fields)?, row)))
            .collect::<RlResult<Vec<_>>>()?;
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }

    fn distinct(&mut self, child: &Plan, fields: &[String]) -> RlResult<Vec<Row<R>>> {
        let rows = self.run(child)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            let key = self.sort_key(&row.record, fields)?;
            if seen.insert(key) {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn union(&mut self, children: &[Plan]) -> RlResult<Vec<Row<R>>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for child in children {
            for row in self.run(child)? {
                if seen.insert(row.pk_bytes.clone()) {
                    out.push(row);
                }
            }
        }
        Ok(out)
    }

    fn intersection(&mut self, children: &[Plan]) -> RlResult<Vec<Row<R>>> {
        let Some((first, rest)) = children.split_first() else { return Ok(Vec::new()) };
        let first_rows = self.run(first)?;
        let mut rest_sets = Vec::with_capacity(rest.len());
        for child in rest {
            let rows = self.run(child)?;
            rest_sets.push(rows.into_iter().map(|row| row.pk_bytes).collect::<HashSet<_>>());
        }
        Ok(first_rows
            .into_iter()
            .filter(|row| rest_sets.iter().all(|set| set.contains(&row.pk_bytes)))
            .collect())
    }

    fn in_join(&mut self, index_name: &str, values: &[Tuple]) -> RlResult<Vec<Row<R>>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for value in values {
            let range = EntryRange::prefix(value.clone());
            for row in self.index_scan(index_name, &range, true)? {
                if seen.insert(row.pk_bytes.clone()) {
                    out.push(row);
                }
            }
        }
        Ok(out)
    }
}
