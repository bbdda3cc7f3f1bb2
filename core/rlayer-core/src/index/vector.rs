//! Vector (HNSW / flat-scan) index maintenance and k-nearest-neighbor query.
//!
//! Each vector gets a level assigned deterministically from a hash of its
//! primary key (so rebuilding the index from the same records is
//! reproducible, unlike the coin-flip level assignment HNSW normally uses).
//! Per-level adjacency lists are stored bincode-encoded, one key per
//! (level, member). Below `flat_scan_threshold` members, or when the
//! descriptor forces it, k-NN search exhaustively scores every stored
//! vector instead of walking the graph — cheaper than maintaining a graph
//! that is mostly useless at small scale.

use crate::error::{RecordLayerError, RlResult};
use crate::kv::KvTransaction;
use crate::record::{IndexDescriptor, IndexKind, VectorMetric, VectorOptions, VectorStrategy};
use crate::store::keys::StoreKeys;
use crate::tuple::{Element, Subspace, Tuple};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use super::IndexUpdate;

const MAX_LEVEL: u32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct GraphMeta {
    entry_point: Option<Vec<u8>>, // packed primary key
    entry_level: u32,
}

fn assign_level(primary_key: &Tuple) -> RlResult<u32> {
    let bytes = primary_key.pack_bytes()?;
    let mut hasher = ahash::AHasher::default();
    bytes.hash(&mut hasher);
    let h = hasher.finish();
    Ok((h.trailing_zeros()).min(MAX_LEVEL))
}

fn vector_subspace(keys: &StoreKeys, index_name: &str) -> Subspace {
    keys.index_subspace(index_name)
}

fn meta_key(sub: &Subspace) -> Vec<u8> {
    sub.child_bytes(b"meta").prefix().to_vec()
}

fn vec_key(sub: &Subspace, pk: &Tuple) -> RlResult<Vec<u8>> {
    sub.child_bytes(b"vec").pack(pk)
}

fn level_key(sub: &Subspace, pk: &Tuple) -> RlResult<Vec<u8>> {
    sub.child_bytes(b"level").pack(pk)
}

fn adj_key(sub: &Subspace, level: u32, pk: &Tuple) -> RlResult<Vec<u8>> {
    sub.child_bytes(format!("adj{level}").as_bytes()).pack(pk)
}

fn read_meta<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace) -> RlResult<GraphMeta> {
    match tx.get(&meta_key(sub))? {
        Some(bytes) => bincode::deserialize(&bytes).map_err(|e| RecordLayerError::Serialization(e.to_string())),
        None => Ok(GraphMeta::default()),
    }
}

fn write_meta<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace, meta: &GraphMeta) -> RlResult<()> {
    let bytes = bincode::serialize(meta).map_err(|e| RecordLayerError::Serialization(e.to_string()))?;
    tx.set(&meta_key(sub), &bytes);
    Ok(())
}

fn read_adjacency<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace, level: u32, pk: &Tuple) -> RlResult<Vec<Tuple>> {
    match tx.get(&adj_key(sub, level, pk)?)? {
        Some(bytes) => {
            let packed: Vec<Vec<u8>> =
                bincode::deserialize(&bytes).map_err(|e| RecordLayerError::Serialization(e.to_string()))?;
            packed.iter().map(|b| Tuple::unpack(b)).collect()
        }
        None => Ok(Vec::new()),
    }
}

fn write_adjacency<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace, level: u32, pk: &Tuple, neighbors: &[Tuple]) -> RlResult<()> {
    let packed: Vec<Vec<u8>> = neighbors.iter().map(|t| t.pack_bytes()).collect::<RlResult<_>>()?;
    let bytes = bincode::serialize(&packed).map_err(|e| RecordLayerError::Serialization(e.to_string()))?;
    tx.set(&adj_key(sub, level, pk)?, &bytes);
    Ok(())
}

fn read_vector<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace, pk: &Tuple) -> RlResult<Option<Vec<f32>>> {
    match tx.get(&vec_key(sub, pk)?)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(|e| RecordLayerError::Serialization(e.to_string()))?)),
        None => Ok(None),
    }
}

fn element_to_vector(entry: &Tuple) -> RlResult<Vec<f32>> {
    entry
        .elements
        .iter()
        .map(|e| match e {
            Element::Double(d) => Ok(*d as f32),
            Element::Float(f) => Ok(*f),
            Element::Int(i) => Ok(*i as f32),
            other => Err(RecordLayerError::UnsupportedElement(format!(
                "vector index entry element must be numeric, got {other:?}"
            ))),
        })
        .collect()
}

fn distance(metric: VectorMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        VectorMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt(),
        VectorMetric::InnerProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        VectorMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na == 0.0 || nb == 0.0 {
                1.0
            } else {
                1.0 - dot / (na * nb)
            }
        }
    }
}

fn options_of(descriptor: &IndexDescriptor) -> RlResult<&VectorOptions> {
    match &descriptor.kind {
        IndexKind::Vector(opts) => Ok(opts),
        other => Err(RecordLayerError::UnsupportedElement(format!("{other:?} is not a vector index"))),
    }
}

pub fn maintain<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    update: &IndexUpdate,
) -> RlResult<()> {
    let options = options_of(descriptor)?;
    let sub = vector_subspace(keys, &descriptor.name);

    if !update.old_entries.is_empty() {
        remove_member(tx, &sub, update.primary_key)?;
    }
    if let Some(new_entry) = update.new_entries.first() {
        let vector = element_to_vector(new_entry)?;
        if vector.len() != options.dimensions && options.dimensions != 0 {
            return Err(RecordLayerError::MalformedRecord(format!(
                "vector index '{}' expects {} dimensions, got {}",
                descriptor.name,
                options.dimensions,
                vector.len()
            )));
        }
        insert_member(tx, &sub, update.primary_key, &vector, options)?;
    }
    Ok(())
}

fn remove_member<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace, pk: &Tuple) -> RlResult<()> {
    let level = match tx.get(&level_key(sub, pk)?)? {
        Some(bytes) => u32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])),
        None => return Ok(()),
    };
    for l in 0..=level {
        let neighbors = read_adjacency(tx, sub, l, pk)?;
        for neighbor in &neighbors {
            let mut their_list = read_adjacency(tx, sub, l, neighbor)?;
            their_list.retain(|n| n != pk);
            write_adjacency(tx, sub, l, neighbor, &their_list)?;
        }
        tx.clear(&adj_key(sub, l, pk)?);
    }
    tx.clear(&vec_key(sub, pk)?);
    tx.clear(&level_key(sub, pk)?);
    Ok(())
}

fn insert_member<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace, pk: &Tuple, vector: &[f32], options: &VectorOptions) -> RlResult<()> {
    tx.set(&vec_key(sub, pk)?, &bincode::serialize(&vector.to_vec()).map_err(|e| RecordLayerError::Serialization(e.to_string()))?);
    let level = assign_level(pk)?;
    tx.set(&level_key(sub, pk)?, &level.to_le_bytes());

    let mut meta = read_meta(tx, sub)?;
    let entry_pk = match &meta.entry_point {
        Some(bytes) => Some(Tuple::unpack(bytes)?),
        None => None,
    };

    let Some(entry_pk) = entry_pk else {
        meta.entry_point = Some(pk.pack_bytes()?);
        meta.entry_level = level;
        write_meta(tx, sub, &meta)?;
        return Ok(());
    };

    for l in 0..=level {
        let candidates = search_layer(tx, sub, vector, &entry_pk, l, options.ef_construction, options.metric)?;
        let mut chosen: Vec<Tuple> = candidates.into_iter().take(options.m).map(|(_, t)| t).collect();
        chosen.retain(|c| c != pk);
        write_adjacency(tx, sub, l, pk, &chosen)?;
        for neighbor in &chosen {
            let mut their_list = read_adjacency(tx, sub, l, neighbor)?;
            if !their_list.contains(pk) {
                their_list.push(pk.clone());
            }
            if their_list.len() > options.m {
                if let Some(nv) = read_vector(tx, sub, neighbor)? {
                    their_list.sort_by(|a, b| {
                        let da = read_vector(tx, sub, a).ok().flatten().map(|v| distance(options.metric, &nv, &v)).unwrap_or(f32::MAX);
                        let db = read_vector(tx, sub, b).ok().flatten().map(|v| distance(options.metric, &nv, &v)).unwrap_or(f32::MAX);
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    their_list.truncate(options.m);
                }
            }
            write_adjacency(tx, sub, l, neighbor, &their_list)?;
        }
    }

    if level > meta.entry_level {
        meta.entry_point = Some(pk.pack_bytes()?);
        meta.entry_level = level;
    }
    write_meta(tx, sub, &meta)?;
    Ok(())
}

/// Greedy best-first search of one level's adjacency graph, returning up to
/// `ef` (distance, member) pairs sorted ascending by distance.
fn search_layer<Tx: KvTransaction>(
    tx: &mut Tx,
    sub: &Subspace,
    query: &[f32],
    entry_pk: &Tuple,
    level: u32,
    ef: usize,
    metric: VectorMetric,
) -> RlResult<Vec<(f32, Tuple)>> {
    let mut visited: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
    let mut best: Vec<(f32, Tuple)> = Vec::new();
    let mut frontier = vec![entry_pk.clone()];
    visited.insert(entry_pk.pack_bytes()?);

    while let Some(current) = frontier.pop() {
        let Some(vector) = read_vector(tx, sub, &current)? else { continue };
        let d = distance(metric, query, &vector);
        best.push((d, current.clone()));

        let neighbors = read_adjacency(tx, sub, level, &current)?;
        for neighbor in neighbors {
            let neighbor_bytes = neighbor.pack_bytes()?;
            if visited.insert(neighbor_bytes) {
                frontier.push(neighbor);
            }
        }
    }
    best.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    best.truncate(ef.max(1));
    Ok(best)
}

/// Top-`k` nearest members to `query`, by primary key, ascending distance.
pub fn knn_query<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    query: &[f32],
    k: usize,
) -> RlResult<Vec<(f32, Tuple)>> {
    let options = options_of(descriptor)?;
    let sub = vector_subspace(keys, &descriptor.name);
    let meta = read_meta(tx, &sub)?;

    let Some(entry_bytes) = meta.entry_point.clone() else { return Ok(Vec::new()) };
    let entry_pk = Tuple::unpack(&entry_bytes)?;

    let use_flat = matches!(options.strategy, VectorStrategy::Flat)
        || (matches!(options.strategy, VectorStrategy::Auto) && is_below_flat_threshold(tx, &sub, &entry_pk, options)?);

    if use_flat {
        return flat_scan(tx, &sub, query, k, options.metric);
    }

    let mut results = search_layer(tx, &sub, query, &entry_pk, 0, options.ef_search.max(k), options.metric)?;
    results.truncate(k);
    Ok(results)
}

fn is_below_flat_threshold<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace, entry_pk: &Tuple, options: &VectorOptions) -> RlResult<bool> {
    let (begin, end) = sub.child_bytes(b"vec").range();
    let _ = entry_pk;
    let count = tx.get_range(&begin, &end)?.len();
    Ok(count < options.flat_scan_threshold)
}

fn flat_scan<Tx: KvTransaction>(tx: &mut Tx, sub: &Subspace, query: &[f32], k: usize, metric: VectorMetric) -> RlResult<Vec<(f32, Tuple)>> {
    let vec_sub = sub.child_bytes(b"vec");
    let (begin, end) = vec_sub.range();
    let mut scored = Vec::new();
    for (key, value) in tx.get_range(&begin, &end)? {
        let pk = vec_sub.unpack(&key)?;
        let vector: Vec<f32> = bincode::deserialize(&value).map_err(|e| RecordLayerError::Serialization(e.to_string()))?;
        scored.push((distance(metric, query, &vector), pk));
    }
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    Ok(scored)
}

/// True if this primary key currently has a stored vector — used by the
/// scrubber's missing-entry detection. A vector index keeps at most one
/// entry per record, so there's no per-value membership to check.
pub fn entry_is_present<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    primary_key: &Tuple,
) -> RlResult<bool> {
    let sub = vector_subspace(keys, &descriptor.name);
    Ok(tx.get(&vec_key(&sub, primary_key)?)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryDatabase;
    use crate::kv::KvDatabase;
    use crate::record::Expression;

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor {
            name: "by_embedding".to_string(),
            kind: IndexKind::Vector(VectorOptions { dimensions: 2, strategy: VectorStrategy::Flat, ..Default::default() }),
            root_expression: Expression::field("embedding"),
            applies_to_types: vec!["Doc".into()],
            covering_fields: vec![],
        }
    }

    fn entry(x: f64, y: f64) -> Tuple {
        Tuple::from_elements(vec![Element::Double(x), Element::Double(y)])
    }

    #[test]
    fn flat_scan_finds_nearest_neighbor() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor();
        let mut tx = db.begin();

        for (i, (x, y)) in [(0.0, 0.0), (10.0, 10.0), (1.0, 1.0)].into_iter().enumerate() {
            let pk = Tuple::from_elements(vec![Element::Int(i as i64)]);
            maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk, old_entries: &[], new_entries: &[entry(x, y)], old_covering: None, new_covering: None }).unwrap();
        }

        let results = knn_query(&mut tx, &keys, &desc, &[0.5, 0.5], 1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, Tuple::from_elements(vec![Element::Int(2)]));
    }

    #[test]
    fn removing_a_member_drops_it_from_results() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let desc = descriptor();
        let mut tx = db.begin();
        let pk0 = Tuple::from_elements(vec![Element::Int(0)]);
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk0, old_entries: &[], new_entries: &[entry(0.0, 0.0)], old_covering: None, new_covering: None }).unwrap();
        maintain(&mut tx, &keys, &desc, &IndexUpdate { primary_key: &pk0, old_entries: &[entry(0.0, 0.0)], new_entries: &[], old_covering: None, new_covering: None }).unwrap();

        let results = knn_query(&mut tx, &keys, &desc, &[0.0, 0.0], 5).unwrap();
        assert!(results.is_empty());
    }
}
