//! In-memory reference implementation of the KV contract.
//!
//! Keys are ordered bytes in one flat `BTreeMap`-under-`RwLock`, giving the
//! bytewise-ordered range scans the tuple codec relies on. A monotonic
//! counter plays the role of FoundationDB's commit-version oracle: every
//! commit gets a fresh `u64`, encoded big-endian into the low 8 bytes of a
//! 12-byte version-stamp, so version-stamps are lexicographically
//! increasing across commits.
//!
//! Conflict detection is optimistic: a transaction records the point keys
//! and ranges it has read (non-snapshot only); at commit, if any recorded
//! key/range was last written at or after the transaction's read version,
//! the commit fails with `ConflictDetected`. Atomic ops never add to the
//! read-conflict set — they are blind, conflict-free mutations.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{RecordLayerError, RlResult};
use crate::kv::traits::{AtomicOp, CommitResult, KvDatabase, KvTransaction, Versionstamp};

#[derive(Debug, Clone)]
enum PendingOp {
    Set(Vec<u8>),
    Clear,
    Atomic(Vec<u8>, AtomicOp),
    VersionstampedKey {
        key_with_placeholder: Vec<u8>,
        placeholder_offset: usize,
        value: Vec<u8>,
    },
}

struct Inner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Last commit version at which each key was touched (write or atomic op).
    last_written: BTreeMap<Vec<u8>, u64>,
    version_oracle: u64,
}

/// An in-memory, transactional, ordered KV store.
pub struct MemoryDatabase {
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                data: BTreeMap::new(),
                last_written: BTreeMap::new(),
                version_oracle: 0,
            })),
        }
    }
}

fn encode_version(v: u64) -> Versionstamp {
    let mut bytes = [0u8; 12];
    bytes[..8].copy_from_slice(&v.to_be_bytes());
    bytes
}

/// A transaction against a [`MemoryDatabase`].
pub struct MemoryTransaction {
    db: Arc<RwLock<Inner>>,
    read_version: u64,
    /// Read-your-writes view: staged mutations layered over the snapshot.
    writes: BTreeMap<Vec<u8>, PendingOp>,
    read_keys: Vec<Vec<u8>>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    approximate_size: usize,
}

impl MemoryTransaction {
    fn committed_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.read().data.get(key).cloned()
    }

    fn committed_range(&self, begin: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.db
            .read()
            .data
            .range(begin.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Merge staged writes (read-your-writes) over a base range read.
    fn apply_staged_to_range(
        &self,
        begin: &[u8],
        end: &[u8],
        mut base: BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        for (k, op) in self.writes.range(begin.to_vec()..end.to_vec()) {
            match op {
                PendingOp::Set(v) => {
                    base.insert(k.clone(), v.clone());
                }
                PendingOp::Clear => {
                    base.remove(k);
                }
                PendingOp::Atomic(operand, kind) => {
                    let existing = base.get(k).cloned();
                    let merged = apply_atomic(existing, operand, *kind);
                    base.insert(k.clone(), merged);
                }
                PendingOp::VersionstampedKey { .. } => {
                    // Not yet resolvable before commit; invisible to reads until committed.
                }
            }
        }
        base.into_iter().collect()
    }
}

fn apply_atomic(existing: Option<Vec<u8>>, operand: &[u8], op: AtomicOp) -> Vec<u8> {
    match op {
        AtomicOp::Add => {
            let mut base = existing.unwrap_or_else(|| vec![0u8; operand.len()]);
            if base.len() < operand.len() {
                base.resize(operand.len(), 0);
            }
            let mut carry = 0u16;
            for i in 0..operand.len() {
                let sum = base[i] as u16 + operand[i] as u16 + carry;
                base[i] = (sum & 0xff) as u8;
                carry = sum >> 8;
            }
            base
        }
        AtomicOp::Min => match existing {
            Some(cur) if cur.as_slice() <= operand => cur,
            _ => operand.to_vec(),
        },
        AtomicOp::Max => match existing {
            Some(cur) if cur.as_slice() >= operand => cur,
            _ => operand.to_vec(),
        },
        AtomicOp::ByteOr => {
            let mut base = existing.unwrap_or_else(|| vec![0u8; operand.len()]);
            if base.len() < operand.len() {
                base.resize(operand.len(), 0);
            }
            for i in 0..operand.len() {
                base[i] |= operand[i];
            }
            base
        }
    }
}

impl KvTransaction for MemoryTransaction {
    fn get(&mut self, key: &[u8]) -> RlResult<Option<Vec<u8>>> {
        self.read_keys.push(key.to_vec());
        if let Some(op) = self.writes.get(key) {
            return Ok(match op {
                PendingOp::Set(v) => Some(v.clone()),
                PendingOp::Clear => None,
                PendingOp::Atomic(operand, kind) => {
                    Some(apply_atomic(self.committed_get(key), operand, *kind))
                }
                PendingOp::VersionstampedKey { .. } => None,
            });
        }
        Ok(self.committed_get(key))
    }

    fn get_snapshot(&mut self, key: &[u8]) -> RlResult<Option<Vec<u8>>> {
        if let Some(op) = self.writes.get(key) {
            return Ok(match op {
                PendingOp::Set(v) => Some(v.clone()),
                PendingOp::Clear => None,
                PendingOp::Atomic(operand, kind) => {
                    Some(apply_atomic(self.committed_get(key), operand, *kind))
                }
                PendingOp::VersionstampedKey { .. } => None,
            });
        }
        Ok(self.committed_get(key))
    }

    fn get_range(&mut self, begin: &[u8], end: &[u8]) -> RlResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.read_ranges.push((begin.to_vec(), end.to_vec()));
        let base: BTreeMap<Vec<u8>, Vec<u8>> = self.committed_range(begin, end).into_iter().collect();
        let mut merged = self.apply_staged_to_range(begin, end, base);
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(merged)
    }

    fn get_range_snapshot(&mut self, begin: &[u8], end: &[u8]) -> RlResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let base: BTreeMap<Vec<u8>, Vec<u8>> = self.committed_range(begin, end).into_iter().collect();
        let mut merged = self.apply_staged_to_range(begin, end, base);
        merged.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(merged)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.approximate_size += key.len() + value.len();
        self.writes.insert(key.to_vec(), PendingOp::Set(value.to_vec()));
    }

    fn clear(&mut self, key: &[u8]) {
        self.approximate_size += key.len();
        self.writes.insert(key.to_vec(), PendingOp::Clear);
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        self.approximate_size += begin.len() + end.len();
        let keys: Vec<Vec<u8>> = self
            .committed_range(begin, end)
            .into_iter()
            .map(|(k, _)| k)
            .chain(
                self.writes
                    .range(begin.to_vec()..end.to_vec())
                    .map(|(k, _)| k.clone()),
            )
            .collect();
        for k in keys {
            self.writes.insert(k, PendingOp::Clear);
        }
    }

    fn atomic_op(&mut self, key: &[u8], operand: &[u8], op: AtomicOp) {
        self.approximate_size += key.len() + operand.len();
        self.writes.insert(key.to_vec(), PendingOp::Atomic(operand.to_vec(), op));
    }

    fn set_versionstamped_key(
        &mut self,
        key_with_placeholder: Vec<u8>,
        placeholder_offset: usize,
        value: Vec<u8>,
    ) {
        self.approximate_size += key_with_placeholder.len() + value.len();
        // Keyed by the placeholder bytes for staging purposes only; actual
        // key is resolved at commit.
        self.writes.insert(
            key_with_placeholder.clone(),
            PendingOp::VersionstampedKey {
                key_with_placeholder,
                placeholder_offset,
                value,
            },
        );
    }

    fn read_version(&self) -> u64 {
        self.read_version
    }

    fn approximate_size(&self) -> usize {
        self.approximate_size
    }
}

impl KvDatabase for MemoryDatabase {
    type Tx = MemoryTransaction;

    fn begin(&self) -> Self::Tx {
        self.begin_at(self.current_read_version())
    }

    fn begin_at(&self, read_version: u64) -> Self::Tx {
        MemoryTransaction {
            db: Arc::clone(&self.inner),
            read_version,
            writes: BTreeMap::new(),
            read_keys: Vec::new(),
            read_ranges: Vec::new(),
            approximate_size: 0,
        }
    }

    fn commit(&self, tx: Self::Tx) -> RlResult<CommitResult> {
        let mut inner = self.inner.write();

        for key in &tx.read_keys {
            if let Some(&ts) = inner.last_written.get(key) {
                if ts > tx.read_version {
                    return Err(RecordLayerError::ConflictDetected(key.clone()));
                }
            }
        }
        for (begin, end) in &tx.read_ranges {
            for (k, &ts) in inner.last_written.range(begin.clone()..end.clone()) {
                if ts > tx.read_version {
                    return Err(RecordLayerError::ConflictDetected(k.clone()));
                }
            }
        }

        inner.version_oracle += 1;
        let commit_ts = inner.version_oracle;
        let commit_version = encode_version(commit_ts);

        for (key, op) in tx.writes {
            match op {
                PendingOp::Set(value) => {
                    inner.data.insert(key.clone(), value);
                    inner.last_written.insert(key, commit_ts);
                }
                PendingOp::Clear => {
                    inner.data.remove(&key);
                    inner.last_written.insert(key, commit_ts);
                }
                PendingOp::Atomic(operand, kind) => {
                    let existing = inner.data.get(&key).cloned();
                    let merged = apply_atomic(existing, &operand, kind);
                    inner.data.insert(key.clone(), merged);
                    inner.last_written.insert(key, commit_ts);
                }
                PendingOp::VersionstampedKey {
                    mut key_with_placeholder,
                    placeholder_offset,
                    value,
                } => {
                    key_with_placeholder[placeholder_offset..placeholder_offset + 12]
                        .copy_from_slice(&commit_version);
                    inner.data.insert(key_with_placeholder.clone(), value);
                    inner.last_written.insert(key_with_placeholder, commit_ts);
                }
            }
        }

        Ok(CommitResult { commit_version })
    }

    fn current_read_version(&self) -> u64 {
        self.inner.read().version_oracle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin();
        tx.set(b"k1", b"v1");
        db.commit(tx).unwrap();

        let mut tx = db.begin();
        assert_eq!(tx.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn range_scan_is_ordered() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin();
        tx.set(b"b", b"2");
        tx.set(b"a", b"1");
        tx.set(b"c", b"3");
        db.commit(tx).unwrap();

        let mut tx = db.begin();
        let results = tx.get_range(b"a", b"z").unwrap();
        assert_eq!(
            results,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn conflict_detected_on_concurrent_write() {
        let db = MemoryDatabase::new();
        let mut seed = db.begin();
        seed.set(b"k", b"0");
        db.commit(seed).unwrap();

        let mut tx1 = db.begin();
        let mut tx2 = db.begin();
        let _ = tx1.get(b"k").unwrap();
        tx2.set(b"k", b"2");
        db.commit(tx2).unwrap();

        tx1.set(b"k", b"1");
        let result = db.commit(tx1);
        assert!(matches!(result, Err(RecordLayerError::ConflictDetected(_))));
    }

    #[test]
    fn snapshot_read_avoids_conflict() {
        let db = MemoryDatabase::new();
        let mut seed = db.begin();
        seed.set(b"k", b"0");
        db.commit(seed).unwrap();

        let mut tx1 = db.begin();
        let mut tx2 = db.begin();
        let _ = tx1.get_snapshot(b"k").unwrap();
        tx2.set(b"k", b"2");
        db.commit(tx2).unwrap();

        tx1.set(b"other", b"1");
        assert!(db.commit(tx1).is_ok());
    }

    #[test]
    fn versionstamps_are_monotonic_across_commits() {
        let db = MemoryDatabase::new();
        let mut tx1 = db.begin();
        tx1.set(b"k1", b"v");
        let r1 = db.commit(tx1).unwrap();

        let mut tx2 = db.begin();
        tx2.set(b"k2", b"v");
        let r2 = db.commit(tx2).unwrap();

        assert!(r2.commit_version > r1.commit_version);
    }

    #[test]
    fn versionstamped_key_is_patched_at_commit() {
        let db = MemoryDatabase::new();
        let mut key = b"prefix/".to_vec();
        let offset = key.len();
        key.extend_from_slice(&[0u8; 12]);
        key.extend_from_slice(b"/suffix");

        let mut tx = db.begin();
        tx.set_versionstamped_key(key.clone(), offset, b"value".to_vec());
        let result = db.commit(tx).unwrap();

        let mut tx2 = db.begin();
        let mut expected_key = b"prefix/".to_vec();
        expected_key.extend_from_slice(&result.commit_version);
        expected_key.extend_from_slice(b"/suffix");
        assert_eq!(tx2.get(&expected_key).unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn atomic_add_accumulates() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin();
        tx.atomic_op(b"counter", &1i64.to_le_bytes(), AtomicOp::Add);
        db.commit(tx).unwrap();

        let mut tx = db.begin();
        tx.atomic_op(b"counter", &1i64.to_le_bytes(), AtomicOp::Add);
        db.commit(tx).unwrap();

        let mut tx = db.begin();
        let value = tx.get(b"counter").unwrap().unwrap();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&value);
        assert_eq!(i64::from_le_bytes(buf), 2);
    }
}
