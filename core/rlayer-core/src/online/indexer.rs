//! `OnlineIndexer`: builds one index against a live store in bounded
//! transactions, tracking resumable progress with a `RangeSet` so a crash
//! or explicit pause picks back up without rescanning completed work.

use crate::config::IndexerConfig;
use crate::error::{RecordLayerError, RlResult};
use crate::index::{self, IndexUpdate};
use crate::kv::{KvDatabase, KvTransaction};
use crate::rangeset::RangeSet;
use crate::record::{IndexDescriptor, IndexState, RecordSerializer};
use crate::store::StoreKeys;
use crate::tuple::Subspace;
use std::marker::PhantomData;
use std::sync::OnceLock;

/// In-process registry of index subspaces with a `build()` loop currently
/// running, keyed by the index's subspace prefix. The only serialization an
/// `OnlineIndexer` provides is this in-memory guard against two build loops
/// racing each other inside the same process — it says nothing about
/// concurrent builds from other processes, which the KV's own conflict
/// detection still protects against at the transaction level.
fn active_builds() -> &'static dashmap::DashSet<Vec<u8>> {
    static REGISTRY: OnceLock<dashmap::DashSet<Vec<u8>>> = OnceLock::new();
    REGISTRY.get_or_init(dashmap::DashSet::new)
}

/// Drives one index from `disabled`/`writeOnly` to fully `readable`.
pub struct OnlineIndexer<'d, D, R, S> {
    db: &'d D,
    keys: StoreKeys,
    record_type_name: String,
    descriptor: IndexDescriptor,
    serializer: S,
    config: IndexerConfig,
    _marker: PhantomData<R>,
}

impl<'d, D, R, S> OnlineIndexer<'d, D, R, S>
where
    D: KvDatabase,
    S: RecordSerializer<R>,
{
    pub fn new(
        db: &'d D,
        root: Subspace,
        record_type_name: impl Into<String>,
        descriptor: IndexDescriptor,
        serializer: S,
        config: IndexerConfig,
    ) -> Self {
        Self {
            db,
            keys: StoreKeys::new(root),
            record_type_name: record_type_name.into(),
            descriptor,
            serializer,
            config,
            _marker: PhantomData,
        }
    }

    fn progress_key(&self) -> Vec<u8> {
        self.keys.progress_subspace(&self.descriptor.name).child_bytes(b"build").prefix().to_vec()
    }

    fn load_progress<Tx: KvTransaction>(&self, tx: &mut Tx) -> RlResult<RangeSet> {
        match tx.get(&self.progress_key())? {
            Some(bytes) => RangeSet::from_bytes(&bytes),
            None => Ok(RangeSet::new()),
        }
    }

    fn save_progress<Tx: KvTransaction>(&self, tx: &mut Tx, progress: &RangeSet) -> RlResult<()> {
        tx.set(&self.progress_key(), &progress.to_bytes()?);
        Ok(())
    }

    /// Mark the index `writeOnly` if it is currently `disabled`, so ordinary
    /// record writes start maintaining it concurrently with the backfill.
    pub fn start(&self) -> RlResult<()> {
        let mut tx = self.db.begin();
        let header_key = self.keys.header_key();
        let mut header = match tx.get(&header_key)? {
            Some(bytes) => crate::store::StoreHeader::from_bytes(&bytes)?,
            None => return Err(RecordLayerError::RecordTypeNotFound(self.record_type_name.clone())),
        };
        if header.index_state(&self.descriptor.name) == IndexState::Disabled {
            header.set_index_state(&self.descriptor.name, IndexState::WriteOnly);
            tx.set(&header_key, &header.to_bytes()?);
        }
        self.db.commit(tx)?;
        Ok(())
    }

    fn lock_key(&self) -> Vec<u8> {
        self.keys.index_subspace(&self.descriptor.name).prefix().to_vec()
    }

    /// Run batches until the whole record range is indexed, then mark the
    /// index `readable`. Safe to call again after a partial run; already
    /// covered ranges are skipped. Refuses to start if another `build()` on
    /// this same index is already running in this process.
    pub fn build(&self) -> RlResult<()> {
        let lock_key = self.lock_key();
        if !active_builds().insert(lock_key.clone()) {
            return Err(RecordLayerError::BuildInProgress(self.descriptor.name.clone()));
        }
        let result = (|| {
            self.start()?;
            loop {
                let made_progress = self.run_one_batch()?;
                if !made_progress {
                    break;
                }
            }
            self.finish()
        })();
        active_builds().remove(&lock_key);
        result
    }

    fn finish(&self) -> RlResult<()> {
        let mut tx = self.db.begin();
        let header_key = self.keys.header_key();
        let mut header = match tx.get(&header_key)? {
            Some(bytes) => crate::store::StoreHeader::from_bytes(&bytes)?,
            None => return Err(RecordLayerError::RecordTypeNotFound(self.record_type_name.clone())),
        };
        header.set_index_state(&self.descriptor.name, IndexState::Readable);
        tx.set(&header_key, &header.to_bytes()?);
        self.db.commit(tx)?;
        Ok(())
    }

    /// Index up to one batch's worth of records, narrowing the batch and
    /// retrying on `TransactionTooLarge`, retrying with backoff on
    /// `ConflictDetected`. Returns `false` once nothing remains to index.
    fn run_one_batch(&self) -> RlResult<bool> {
        let mut config = self.config;
        let mut attempt = 0;
        loop {
            match self.try_batch(&config) {
                Ok(made_progress) => return Ok(made_progress),
                Err(RecordLayerError::TransactionTooLarge { .. }) => {
                    config = config.narrowed();
                    continue;
                }
                Err(RecordLayerError::ConflictDetected(_)) if attempt < config.retry.max_retries => {
                    attempt += 1;
                    std::thread::sleep(config.retry.backoff_for_attempt(attempt));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_batch(&self, config: &IndexerConfig) -> RlResult<bool> {
        let mut tx = self.db.begin();
        let records_subspace = self.keys.records_subspace(&self.record_type_name);
        let (subspace_begin, subspace_end) = records_subspace.range();

        let mut progress = self.load_progress(&mut tx)?;
        let missing = progress.missing_ranges(&subspace_begin, &subspace_end);
        let Some((begin, end)) = missing.into_iter().next() else {
            return Ok(false);
        };

        let candidates = tx.get_range(&begin, &end)?;
        let mut bytes_used = 0usize;
        let mut batch = Vec::new();
        for (key, value) in candidates {
            if batch.len() >= config.records_per_batch || bytes_used + value.len() > config.bytes_per_batch {
                break;
            }
            bytes_used += value.len();
            batch.push((key, value));
        }

        if batch.is_empty() {
            // The whole remaining range is smaller than one batch item would
            // allow, or empty: cover it in one step to make progress.
            progress.insert_range(&begin, &end);
            self.save_progress(&mut tx, &progress)?;
            self.db.commit(tx)?;
            return Ok(true);
        }

        let covered_end = batch.last().map(|(k, _)| {
            let mut next = k.clone();
            next.push(0x00);
            next
        }).unwrap_or_else(|| end.clone());

        for (_, value) in &batch {
            let record = self.serializer.deserialize(value)?;
            let primary_key = self.serializer.primary_key(&record)?;
            let get_field = |path: &str| self.serializer.extract_field(&record, path);
            let entries = self.descriptor.root_expression.evaluate(&get_field)?;
            let update = IndexUpdate {
                primary_key: &primary_key,
                old_entries: &[],
                new_entries: &entries,
                old_covering: None,
                new_covering: None,
            };
            index::maintain(&mut tx, &self.keys, &self.descriptor, &update)?;
        }

        progress.insert_range(&begin, &covered_end);
        self.save_progress(&mut tx, &progress)?;

        if tx.approximate_size() > config.bytes_per_batch * 4 {
            return Err(RecordLayerError::TransactionTooLarge {
                size: tx.approximate_size(),
                limit: config.bytes_per_batch * 4,
            });
        }

        self.db.commit(tx)?;
        Ok(true)
    }
}
