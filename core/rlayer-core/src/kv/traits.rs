//! KV client dependency contract.
//!
//! Must provide: key-value get/set/clear; range reads with begin/end keys
//! and a `snapshot` flag; atomic add/min/max/byte-or/set-versionstamped-key;
//! transaction commit returning a 12-byte version-stamp; read-version
//! set/get; bytewise-ordered keys. Per-transaction timeout/retry-limit
//! envelopes live on [`crate::config::TransactionLimits`], not here — they
//! govern how a caller's retry loop around `KvDatabase::begin`/`commit`
//! behaves, not the transaction's data-plane API.

use crate::error::RlResult;

/// Atomic, conflict-free mutations the KV applies without a read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Interpret both the existing value and operand as little-endian
    /// integers of the operand's length and add them, wrapping on overflow.
    Add,
    /// Byte-wise minimum of the existing value and the operand.
    Min,
    /// Byte-wise maximum of the existing value and the operand.
    Max,
    /// Byte-wise OR of the existing value and the operand.
    ByteOr,
}

/// The 12-byte version-stamp assigned by the KV at commit time.
pub type Versionstamp = [u8; 12];

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_version: Versionstamp,
}

/// One KV transaction. All reads/writes within a `RecordStore` operation
/// happen through one `KvTransaction` borrowed for the duration of the call.
pub trait KvTransaction {
    /// Read-your-writes get.
    fn get(&mut self, key: &[u8]) -> RlResult<Option<Vec<u8>>>;

    /// Snapshot get — bypasses conflict detection.
    fn get_snapshot(&mut self, key: &[u8]) -> RlResult<Option<Vec<u8>>>;

    /// Read-your-writes range scan over `[begin, end)`, ascending.
    fn get_range(&mut self, begin: &[u8], end: &[u8]) -> RlResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Snapshot range scan over `[begin, end)`, ascending — bypasses conflict detection.
    fn get_range_snapshot(&mut self, begin: &[u8], end: &[u8]) -> RlResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Upsert a key.
    fn set(&mut self, key: &[u8], value: &[u8]);

    /// Remove a key (no-op if absent).
    fn clear(&mut self, key: &[u8]);

    /// Remove every key in `[begin, end)`.
    fn clear_range(&mut self, begin: &[u8], end: &[u8]);

    /// Apply a commutative, conflict-free mutation.
    fn atomic_op(&mut self, key: &[u8], operand: &[u8], op: AtomicOp);

    /// Write `value` at a key that contains a 12-byte all-zero placeholder at
    /// `placeholder_offset`; the KV fills the placeholder with the commit
    /// version-stamp at commit time.
    fn set_versionstamped_key(&mut self, key_with_placeholder: Vec<u8>, placeholder_offset: usize, value: Vec<u8>);

    /// The read version (snapshot) this transaction observes.
    fn read_version(&self) -> u64;

    /// Approximate accumulated mutation size in bytes, for
    /// `TransactionTooLarge` bookkeeping by callers that want to narrow a
    /// batch before it actually overflows the KV's limit.
    fn approximate_size(&self) -> usize;
}

/// The database handle: opens transactions and commits them.
pub trait KvDatabase: Send + Sync {
    type Tx: KvTransaction;

    /// Begin a transaction at the database's current read version.
    fn begin(&self) -> Self::Tx;

    /// Begin a transaction pinned to a specific read version — used by plan
    /// combinators that fan out sibling transactions sharing one snapshot.
    fn begin_at(&self, read_version: u64) -> Self::Tx;

    /// Commit a transaction, applying its buffered mutations atomically and
    /// returning the assigned version-stamp. Fails with
    /// `RecordLayerError::ConflictDetected` if a read this transaction made
    /// (non-snapshot) was invalidated by a concurrent commit.
    fn commit(&self, tx: Self::Tx) -> RlResult<CommitResult>;

    /// The database's current read version (for non-transactional reads and
    /// for seeding sibling transactions with a shared snapshot).
    fn current_read_version(&self) -> u64;
}

/// Run `body` against a fresh transaction, retrying on `ConflictDetected` up
/// to `retry.max_retries` times with the given backoff. Every other error,
/// and every error from `body` itself, aborts immediately without retrying.
pub fn transact<D, F, T>(db: &D, retry: &crate::config::RetryPolicy, mut body: F) -> RlResult<T>
where
    D: KvDatabase,
    F: FnMut(&mut D::Tx) -> RlResult<T>,
{
    let mut attempt = 0;
    loop {
        let mut tx = db.begin();
        let outcome = body(&mut tx);
        match outcome {
            Ok(value) => match db.commit(tx) {
                Ok(_) => return Ok(value),
                Err(crate::error::RecordLayerError::ConflictDetected(_)) if attempt < retry.max_retries => {
                    attempt += 1;
                    std::thread::sleep(retry.backoff_for_attempt(attempt));
                    continue;
                }
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
