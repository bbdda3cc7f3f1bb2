//! Spatial index maintenance and bounding-box query, keyed by a Z-order
//! (Morton) space-filling curve over normalized latitude/longitude.
//!
//! The curve turns a 2D region query into a handful of 1D key ranges: a
//! quadtree region coverer recursively subdivides the unit square, keeping
//! cells that overlap the query box as a Morton range and recursing into
//! them up to a depth bound, then stops refining once enough ranges have
//! been collected. Because Z-order ranges over-approximate a box (a range
//! can cover cells outside it near a quadrant boundary), callers must
//! post-filter candidates against the exact box — `bounding_box_query`
//! does this itself using the lat/lon stored alongside each entry.

use super::IndexUpdate;
use crate::error::{RecordLayerError, RlResult};
use crate::kv::KvTransaction;
use crate::record::{IndexDescriptor, IndexKind, SpatialIndexMetadata};
use crate::store::keys::StoreKeys;
use crate::tuple::{Element, Tuple};

const BITS_PER_AXIS: u32 = 26; // ~0.3m resolution at the equator over +/-180 degrees
const LAT_RANGE: (f64, f64) = (-90.0, 90.0);
const LON_RANGE: (f64, f64) = (-180.0, 180.0);

fn normalize(value: f64, range: (f64, f64)) -> u32 {
    let clamped = value.clamp(range.0, range.1);
    let fraction = (clamped - range.0) / (range.1 - range.0);
    (fraction * ((1u64 << BITS_PER_AXIS) - 1) as f64) as u32
}

fn interleave(lat_bits: u32, lon_bits: u32) -> u64 {
    fn spread(mut x: u64) -> u64 {
        x &= 0x3ff_ffff;
        x = (x | (x << 16)) & 0x0000ffff0000ffff;
        x = (x | (x << 8)) & 0x00ff00ff00ff00ff;
        x = (x | (x << 4)) & 0x0f0f0f0f0f0f0f0f;
        x = (x | (x << 2)) & 0x3333333333333333;
        x = (x | (x << 1)) & 0x5555555555555555;
        x
    }
    spread(lat_bits as u64) | (spread(lon_bits as u64) << 1)
}

fn morton_code(lat: f64, lon: f64) -> u64 {
    interleave(normalize(lat, LAT_RANGE), normalize(lon, LON_RANGE))
}

fn options_of(descriptor: &IndexDescriptor) -> RlResult<&SpatialIndexMetadata> {
    match &descriptor.kind {
        IndexKind::Spatial(meta) => Ok(meta),
        other => Err(RecordLayerError::UnsupportedElement(format!("{other:?} is not a spatial index"))),
    }
}

fn lat_lon(entry: &Tuple) -> RlResult<(f64, f64)> {
    let scalar = |e: &Element| -> RlResult<f64> {
        match e {
            Element::Double(d) => Ok(*d),
            Element::Int(i) => Ok(*i as f64),
            other => Err(RecordLayerError::UnsupportedElement(format!(
                "spatial index coordinate must be numeric, got {other:?}"
            ))),
        }
    };
    match entry.elements.as_slice() {
        [lat, lon] => Ok((scalar(lat)?, scalar(lon)?)),
        other => Err(RecordLayerError::MalformedRecord(format!(
            "spatial index entry must be [lat, lon], got {} elements",
            other.len()
        ))),
    }
}

pub fn maintain<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    update: &IndexUpdate,
) -> RlResult<()> {
    options_of(descriptor)?;
    let subspace = keys.index_subspace(&descriptor.name);

    for old in update.old_entries {
        if !update.new_entries.contains(old) {
            let (lat, lon) = lat_lon(old)?;
            let entry_key = Tuple::from_elements(vec![Element::Int(morton_code(lat, lon) as i64)])
                .concat(update.primary_key.clone());
            tx.clear(&subspace.pack(&entry_key)?);
        }
    }
    for new in update.new_entries {
        if !update.old_entries.contains(new) {
            let (lat, lon) = lat_lon(new)?;
            let entry_key = Tuple::from_elements(vec![Element::Int(morton_code(lat, lon) as i64)])
                .concat(update.primary_key.clone());
            let value = Tuple::from_elements(vec![Element::Double(lat), Element::Double(lon)]).pack_bytes()?;
            tx.set(&subspace.pack(&entry_key)?, &value);
        }
    }
    Ok(())
}

/// A quadtree region coverer: recursively subdivides the unit square,
/// keeping cells that overlap `box` and stopping once `max_ranges` leaf
/// ranges have been produced or `max_depth` is reached.
fn cover_ranges(query: (f64, f64, f64, f64), max_depth: u32, max_ranges: usize) -> Vec<(u64, u64)> {
    let (min_lat, min_lon, max_lat, max_lon) = query;
    let mut ranges = Vec::new();

    fn cell_bounds(depth: u32, lat_prefix: u32, lon_prefix: u32) -> (f64, f64, f64, f64) {
        let cells = 1u64 << depth;
        let lat_span = (LAT_RANGE.1 - LAT_RANGE.0) / cells as f64;
        let lon_span = (LON_RANGE.1 - LON_RANGE.0) / cells as f64;
        let lat0 = LAT_RANGE.0 + lat_prefix as f64 * lat_span;
        let lon0 = LON_RANGE.0 + lon_prefix as f64 * lon_span;
        (lat0, lon0, lat0 + lat_span, lon0 + lon_span)
    }

    fn overlaps(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> bool {
        a.0 < b.2 && b.0 < a.2 && a.1 < b.3 && b.1 < a.3
    }

    let mut work = vec![(0u32, 0u32, 0u32)];
    while let Some((depth, lat_prefix, lon_prefix)) = work.pop() {
        let bounds = cell_bounds(depth, lat_prefix, lon_prefix);
        if !overlaps(bounds, (min_lat, min_lon, max_lat, max_lon)) {
            continue;
        }
        if depth >= max_depth || ranges.len() + work.len() >= max_ranges {
            let shift = BITS_PER_AXIS - depth;
            let lat_bits = lat_prefix << shift.min(BITS_PER_AXIS);
            let lon_bits = lon_prefix << shift.min(BITS_PER_AXIS);
            let start = interleave(lat_bits, lon_bits);
            let cell_count = 1u64 << (2 * shift.min(BITS_PER_AXIS));
            ranges.push((start, start.saturating_add(cell_count)));
            continue;
        }
        for dlat in 0..2u32 {
            for dlon in 0..2u32 {
                work.push((depth + 1, (lat_prefix << 1) | dlat, (lon_prefix << 1) | dlon));
            }
        }
    }
    ranges
}

/// Candidates within `(min_lat, min_lon, max_lat, max_lon)`, exact-filtered.
pub fn bounding_box_query<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    query: (f64, f64, f64, f64),
) -> RlResult<Vec<Tuple>> {
    let subspace = keys.index_subspace(&descriptor.name);
    let ranges = cover_ranges(query, 16, 64);
    let mut results = Vec::new();

    for (start, end) in ranges {
        let begin_key = subspace.pack(&Tuple::from_elements(vec![Element::Int(start as i64)]))?;
        let end_key = subspace.pack(&Tuple::from_elements(vec![Element::Int(end as i64)]))?;
        for (key, value) in tx.get_range(&begin_key, &end_key)? {
            let entry = subspace.unpack(&key)?;
            let stored = Tuple::unpack(&value)?;
            let (lat, lon) = lat_lon(&stored)?;
            if lat >= query.0 && lat <= query.2 && lon >= query.1 && lon <= query.3 {
                let primary_key = Tuple::from_elements(entry.elements.iter().skip(1).cloned());
                results.push(primary_key);
            }
        }
    }
    Ok(results)
}

/// True if `entry`'s spatial index entry for `primary_key` is currently
/// stored — used by the scrubber's missing-entry detection.
pub fn entry_is_present<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    primary_key: &Tuple,
    entry: &Tuple,
) -> RlResult<bool> {
    options_of(descriptor)?;
    let subspace = keys.index_subspace(&descriptor.name);
    let (lat, lon) = lat_lon(entry)?;
    let entry_key =
        Tuple::from_elements(vec![Element::Int(morton_code(lat, lon) as i64)]).concat(primary_key.clone());
    Ok(tx.get(&subspace.pack(&entry_key)?)?.is_some())
}
