//! Rank index maintenance: an ordered set of scored members supporting
//! `rank(member) -> position` and `select(position) -> member` queries, e.g.
//! for a leaderboard.
//!
//! Entries are kept in a leveled skip-list (FoundationDB's `RankedSet` is
//! the model): level 0 holds every member, each higher level holds a
//! shrinking, deterministically-chosen subset, and every node above level 0
//! stores the count of level-0 members it "covers" up to the next node at
//! its level. `rank`/`select` descend from the top level down, consuming a
//! node's whole span whenever that doesn't overshoot the target and only
//! falling to the next level down at the point where it would — so both
//! touch O(log n) nodes rather than scanning every entry.
//!
//! A node's level is `trailing_zeros` of a hash of its packed entry bytes,
//! capped at `MAX_LEVEL` — the same deterministic-hash-instead-of-coin-flip
//! trick `vector.rs` uses for its graph levels, so index maintenance stays a
//! pure function of record content.

use super::{entry_with_primary_key, IndexUpdate};
use crate::error::RlResult;
use crate::kv::KvTransaction;
use crate::record::IndexDescriptor;
use crate::store::keys::StoreKeys;
use crate::tuple::{Subspace, Tuple};
use std::hash::{Hash, Hasher};

const MAX_LEVEL: u32 = 4;

fn assign_level(suffix: &[u8]) -> u32 {
    let mut hasher = ahash::AHasher::default();
    suffix.hash(&mut hasher);
    hasher.finish().trailing_zeros().min(MAX_LEVEL)
}

fn level_subspace(keys: &StoreKeys, index_name: &str, level: u32) -> Subspace {
    keys.index_subspace(index_name).child_bytes(format!("L{level}").as_bytes())
}

fn full_key(sub: &Subspace, suffix: &[u8]) -> Vec<u8> {
    let mut key = sub.prefix().to_vec();
    key.extend_from_slice(suffix);
    key
}

/// The immediate successor of `key` in byte order — the same trick
/// `Subspace::range()` uses to turn a prefix into a half-open bound.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

fn read_span(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    let n = bytes.len().min(8);
    arr[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(arr)
}

fn write_span(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

fn insert_member<Tx: KvTransaction>(tx: &mut Tx, keys: &StoreKeys, index_name: &str, entry: &Tuple) -> RlResult<()> {
    let suffix = entry.pack_bytes()?;
    let level = assign_level(&suffix);

    let base = level_subspace(keys, index_name, 0);
    tx.set(&full_key(&base, &suffix), &write_span(1));

    for l in 1..=level {
        let sub = level_subspace(keys, index_name, l);
        let target_key = full_key(&sub, &suffix);
        let (begin, end) = sub.range();

        let predecessor = tx.get_range(&begin, &target_key)?.pop();
        let successor_entry = {
            let scan_begin = successor(&target_key);
            tx.get_range(&scan_begin, &end)?.into_iter().next()
        };

        let left_count = {
            let begin0 = match &predecessor {
                Some((pred_key, _)) => {
                    let pred_suffix = &pred_key[sub.prefix().len()..];
                    successor(&full_key(&base, pred_suffix))
                }
                None => base.range().0,
            };
            let end0 = successor(&full_key(&base, &suffix));
            tx.get_range(&begin0, &end0)?.len() as u64
        };
        tx.set(&target_key, &write_span(left_count));

        if let Some((succ_key, succ_value)) = successor_entry {
            let old_span = read_span(&succ_value);
            tx.set(&succ_key, &write_span(old_span.saturating_sub(left_count)));
        }
    }
    Ok(())
}

fn remove_member<Tx: KvTransaction>(tx: &mut Tx, keys: &StoreKeys, index_name: &str, entry: &Tuple) -> RlResult<()> {
    let suffix = entry.pack_bytes()?;
    let level = assign_level(&suffix);

    for l in (1..=level).rev() {
        let sub = level_subspace(keys, index_name, l);
        let target_key = full_key(&sub, &suffix);
        let span = match tx.get(&target_key)? {
            Some(v) => read_span(&v),
            None => 0,
        };
        let (_, end) = sub.range();
        let successor_entry = {
            let scan_begin = successor(&target_key);
            tx.get_range(&scan_begin, &end)?.into_iter().next()
        };
        tx.clear(&target_key);
        if let Some((succ_key, succ_value)) = successor_entry {
            let old_span = read_span(&succ_value);
            tx.set(&succ_key, &write_span(old_span + span));
        }
    }

    let base = level_subspace(keys, index_name, 0);
    tx.clear(&full_key(&base, &suffix));
    Ok(())
}

pub fn maintain<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    descriptor: &IndexDescriptor,
    update: &IndexUpdate,
) -> RlResult<()> {
    for old in update.old_entries {
        if !update.new_entries.contains(old) {
            remove_member(tx, keys, &descriptor.name, &entry_with_primary_key(old, update.primary_key))?;
        }
    }
    for new in update.new_entries {
        if !update.old_entries.contains(new) {
            insert_member(tx, keys, &descriptor.name, &entry_with_primary_key(new, update.primary_key))?;
        }
    }
    Ok(())
}

/// Zero-based rank of `member` among all maintained entries, ascending by
/// score. Returns `None` if `member` is not present.
pub fn rank<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    index_name: &str,
    member: &Tuple,
) -> RlResult<Option<u64>> {
    let suffix = member.pack_bytes()?;
    let base = level_subspace(keys, index_name, 0);
    if tx.get(&full_key(&base, &suffix))?.is_none() {
        return Ok(None);
    }

    let mut rank_count = 0u64;
    let mut cursor: Option<Vec<u8>> = None;
    for level in (0..=MAX_LEVEL).rev() {
        let sub = level_subspace(keys, index_name, level);
        let target_key = full_key(&sub, &suffix);
        loop {
            let begin = match &cursor {
                Some(c) => successor(&full_key(&sub, c)),
                None => sub.range().0,
            };
            let mut found = tx.get_range(&begin, &target_key)?;
            if found.is_empty() {
                break;
            }
            let (key, value) = found.remove(0);
            let span = if level == 0 { 1 } else { read_span(&value) };
            rank_count += span;
            cursor = Some(key[sub.prefix().len()..].to_vec());
        }
    }
    Ok(Some(rank_count))
}

/// The member at zero-based rank `position`, ascending by score.
pub fn select<Tx: KvTransaction>(
    tx: &mut Tx,
    keys: &StoreKeys,
    index_name: &str,
    position: u64,
) -> RlResult<Option<Tuple>> {
    let mut remaining = position + 1;
    let mut cursor: Option<Vec<u8>> = None;
    let mut result: Option<Vec<u8>> = None;

    'outer: for level in (0..=MAX_LEVEL).rev() {
        let sub = level_subspace(keys, index_name, level);
        loop {
            if remaining == 0 {
                break 'outer;
            }
            let begin = match &cursor {
                Some(c) => successor(&full_key(&sub, c)),
                None => sub.range().0,
            };
            let (_, end) = sub.range();
            let mut found = tx.get_range(&begin, &end)?;
            if found.is_empty() {
                break;
            }
            let (key, value) = found.remove(0);
            let span = if level == 0 { 1 } else { read_span(&value) };
            if span <= remaining {
                remaining -= span;
                let suffix = key[sub.prefix().len()..].to_vec();
                cursor = Some(suffix.clone());
                result = Some(suffix);
            } else {
                break;
            }
        }
    }

    if remaining == 0 {
        match result {
            Some(suffix) => Ok(Some(Tuple::unpack(&suffix)?)),
            None => Ok(None),
        }
    } else {
        Ok(None)
    }
}

/// The level-0 subspace, holding every maintained member once each —
/// exposed so the scrubber can scan it directly for dangling-entry
/// detection without reaching into this module's level layout.
pub fn level0_subspace(keys: &StoreKeys, index_name: &str) -> Subspace {
    level_subspace(keys, index_name, 0)
}

/// Number of maintained entries.
pub fn count<Tx: KvTransaction>(tx: &mut Tx, keys: &StoreKeys, index_name: &str) -> RlResult<u64> {
    let mut total = 0u64;
    let mut cursor: Option<Vec<u8>> = None;
    for level in (0..=MAX_LEVEL).rev() {
        let sub = level_subspace(keys, index_name, level);
        loop {
            let begin = match &cursor {
                Some(c) => successor(&full_key(&sub, c)),
                None => sub.range().0,
            };
            let (_, end) = sub.range();
            let mut found = tx.get_range(&begin, &end)?;
            if found.is_empty() {
                break;
            }
            let (key, value) = found.remove(0);
            let span = if level == 0 { 1 } else { read_span(&value) };
            total += span;
            cursor = Some(key[sub.prefix().len()..].to_vec());
        }
    }
    Ok(total)
}
