//! `OnlineIndexScrubber`: detects (and optionally repairs) drift between a
//! record type's records and one of its indexes, in two independent passes,
//! each its own sequence of bounded transactions tracking resumable
//! progress with a `RangeSet`, mirroring `OnlineIndexer`'s build loop.

use crate::config::ScrubberConfig;
use crate::error::{RecordLayerError, RlResult};
use crate::index::{self, rank, IndexUpdate};
use crate::kv::{KvDatabase, KvTransaction};
use crate::rangeset::RangeSet;
use crate::record::{IndexDescriptor, IndexKind, RecordSerializer, RecordType};
use crate::store::StoreKeys;
use crate::tuple::{Subspace, Tuple};
use std::marker::PhantomData;

/// One consistency problem found during a scrub pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrubIssue {
    /// An index entry whose record no longer exists (or no longer produces it).
    DanglingEntry { primary_key: Tuple },
    /// A record whose expected index entry is absent.
    MissingEntry { primary_key: Tuple },
}

/// Outcome of one scrub pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrubReport {
    pub issues: Vec<ScrubIssue>,
    pub repaired: usize,
}

pub struct OnlineIndexScrubber<'d, D, R, S> {
    db: &'d D,
    keys: StoreKeys,
    record_type: RecordType,
    descriptor: IndexDescriptor,
    serializer: S,
    config: ScrubberConfig,
    _marker: PhantomData<R>,
}

impl<'d, D, R, S> OnlineIndexScrubber<'d, D, R, S>
where
    D: KvDatabase,
    S: RecordSerializer<R>,
{
    pub fn new(
        db: &'d D,
        root: Subspace,
        record_type: RecordType,
        descriptor: IndexDescriptor,
        serializer: S,
        config: ScrubberConfig,
    ) -> Self {
        Self {
            db,
            keys: StoreKeys::new(root),
            record_type,
            descriptor,
            serializer,
            config,
            _marker: PhantomData,
        }
    }

    fn missing_progress_key(&self) -> Vec<u8> {
        self.keys.progress_subspace(&self.descriptor.name).child_bytes(b"scrub_missing").prefix().to_vec()
    }

    fn dangling_progress_key(&self) -> Vec<u8> {
        self.keys.progress_subspace(&self.descriptor.name).child_bytes(b"scrub_dangling").prefix().to_vec()
    }

    fn load_progress<Tx: KvTransaction>(&self, tx: &mut Tx, key: &[u8]) -> RlResult<RangeSet> {
        match tx.get(key)? {
            Some(bytes) => RangeSet::from_bytes(&bytes),
            None => Ok(RangeSet::new()),
        }
    }

    fn save_progress<Tx: KvTransaction>(&self, tx: &mut Tx, key: &[u8], progress: &RangeSet) -> RlResult<()> {
        tx.set(key, &progress.to_bytes()?);
        Ok(())
    }

    /// Records without their expected index entry, driven off a persisted
    /// `RangeSet` over the record type's primary-key range so a crash or
    /// explicit pause resumes rather than rescanning from the start.
    /// Applies to every index kind with a per-entry membership check
    /// (`index::entry_is_present`); kinds that fold straight into a shared
    /// accumulator, or are maintained outside `index::maintain` entirely,
    /// have nothing for this pass to compare.
    pub fn scrub_missing(&self) -> RlResult<ScrubReport> {
        let mut report = ScrubReport::default();
        let progress_key = self.missing_progress_key();
        let (subspace_begin, subspace_end) = self.keys.records_subspace(&self.record_type.name).range();

        while let Some((issues, repaired)) = self.run_missing_batch(&progress_key, &subspace_begin, &subspace_end)? {
            report.issues.extend(issues);
            report.repaired += repaired;
        }
        Ok(report)
    }

    fn run_missing_batch(
        &self,
        progress_key: &[u8],
        subspace_begin: &[u8],
        subspace_end: &[u8],
    ) -> RlResult<Option<(Vec<ScrubIssue>, usize)>> {
        let mut attempt = 0;
        loop {
            match self.try_missing_batch(progress_key, subspace_begin, subspace_end) {
                Ok(outcome) => return Ok(outcome),
                Err(RecordLayerError::ConflictDetected(_)) if attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    std::thread::sleep(self.config.retry.backoff_for_attempt(attempt));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs one bounded transaction's worth of the missing-entry pass.
    /// `Ok(None)` once the whole range is covered; the returned issues and
    /// repair count are only ever handed back after `self.db.commit`
    /// succeeds, so a failed commit never inflates the report.
    fn try_missing_batch(
        &self,
        progress_key: &[u8],
        subspace_begin: &[u8],
        subspace_end: &[u8],
    ) -> RlResult<Option<(Vec<ScrubIssue>, usize)>> {
        let mut tx = self.db.begin();
        let mut progress = self.load_progress(&mut tx, progress_key)?;
        let Some((begin, end)) = progress.missing_ranges(subspace_begin, subspace_end).into_iter().next() else {
            self.db.commit(tx)?;
            return Ok(None);
        };

        let candidates = tx.get_range(&begin, &end)?;
        let batch: Vec<_> = candidates.into_iter().take(self.config.entries_per_batch).collect();
        if batch.is_empty() {
            progress.insert_range(&begin, &end);
            self.save_progress(&mut tx, progress_key, &progress)?;
            self.db.commit(tx)?;
            return Ok(Some((Vec::new(), 0)));
        }

        let mut issues = Vec::new();
        let mut repaired = 0usize;
        for (_, value) in &batch {
            let record = self.serializer.deserialize(value)?;
            let primary_key = self.serializer.primary_key(&record)?;
            let get_field = |path: &str| self.serializer.extract_field(&record, path);
            let entries = self.descriptor.root_expression.evaluate(&get_field)?;

            let mut missing = false;
            for entry in &entries {
                if index::entry_is_present(&mut tx, &self.keys, &self.descriptor, &primary_key, entry)? == Some(false) {
                    missing = true;
                }
            }

            if missing {
                issues.push(ScrubIssue::MissingEntry { primary_key: primary_key.clone() });
                if self.config.repair == crate::config::RepairPolicy::Repair {
                    let update = IndexUpdate {
                        primary_key: &primary_key,
                        old_entries: &[],
                        new_entries: &entries,
                        old_covering: None,
                        new_covering: None,
                    };
                    index::maintain(&mut tx, &self.keys, &self.descriptor, &update)?;
                    repaired += 1;
                }
            }
        }

        let covered_end = {
            let mut next = batch.last().unwrap().0.clone();
            next.push(0x00);
            next
        };
        progress.insert_range(&begin, &covered_end);
        self.save_progress(&mut tx, progress_key, &progress)?;

        self.db.commit(tx)?;
        Ok(Some((issues, repaired)))
    }

    /// The subspace holding one raw entry per (index value, primary key) for
    /// `descriptor`'s kind, if it has one — `None` for kinds with no such
    /// layout to scan for orphans.
    fn dangling_subspace(&self) -> Option<Subspace> {
        match &self.descriptor.kind {
            IndexKind::Value | IndexKind::Unique | IndexKind::Permuted { .. } | IndexKind::Spatial(_) => {
                Some(self.keys.index_subspace(&self.descriptor.name))
            }
            IndexKind::Rank { .. } => Some(rank::level0_subspace(&self.keys, &self.descriptor.name)),
            IndexKind::Min | IndexKind::Max => Some(self.keys.aggregate_member_subspace(&self.descriptor.name)),
            IndexKind::Vector(_) => Some(self.keys.index_subspace(&self.descriptor.name).child_bytes(b"vec")),
            IndexKind::Count | IndexKind::Sum | IndexKind::Average | IndexKind::Version { .. } => None,
        }
    }

    /// Index entries whose record is gone, driven off a persisted `RangeSet`
    /// over `dangling_subspace()`. Every entry in that subspace ends with
    /// the record's primary key, regardless of kind, so recovering it is
    /// just splitting off the trailing `primary_key_fields.len()` elements.
    pub fn scrub_dangling(&self) -> RlResult<ScrubReport> {
        let mut report = ScrubReport::default();
        let Some(dangling_subspace) = self.dangling_subspace() else {
            return Ok(report);
        };
        let progress_key = self.dangling_progress_key();
        let (subspace_begin, subspace_end) = dangling_subspace.range();

        while let Some((issues, repaired)) =
            self.run_dangling_batch(&dangling_subspace, &progress_key, &subspace_begin, &subspace_end)?
        {
            report.issues.extend(issues);
            report.repaired += repaired;
        }
        Ok(report)
    }

    fn run_dangling_batch(
        &self,
        dangling_subspace: &Subspace,
        progress_key: &[u8],
        subspace_begin: &[u8],
        subspace_end: &[u8],
    ) -> RlResult<Option<(Vec<ScrubIssue>, usize)>> {
        let mut attempt = 0;
        loop {
            match self.try_dangling_batch(dangling_subspace, progress_key, subspace_begin, subspace_end) {
                Ok(outcome) => return Ok(outcome),
                Err(RecordLayerError::ConflictDetected(_)) if attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    std::thread::sleep(self.config.retry.backoff_for_attempt(attempt));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_dangling_batch(
        &self,
        dangling_subspace: &Subspace,
        progress_key: &[u8],
        subspace_begin: &[u8],
        subspace_end: &[u8],
    ) -> RlResult<Option<(Vec<ScrubIssue>, usize)>> {
        let primary_key_arity = self.record_type.primary_key_fields.len();
        let mut tx = self.db.begin();
        let mut progress = self.load_progress(&mut tx, progress_key)?;
        let Some((begin, end)) = progress.missing_ranges(subspace_begin, subspace_end).into_iter().next() else {
            self.db.commit(tx)?;
            return Ok(None);
        };

        let candidates = tx.get_range(&begin, &end)?;
        let batch: Vec<_> = candidates.into_iter().take(self.config.entries_per_batch).collect();
        if batch.is_empty() {
            progress.insert_range(&begin, &end);
            self.save_progress(&mut tx, progress_key, &progress)?;
            self.db.commit(tx)?;
            return Ok(Some((Vec::new(), 0)));
        }

        let mut issues = Vec::new();
        let mut repaired = 0usize;
        for (key, _) in &batch {
            let full = dangling_subspace.unpack(key)?;
            if full.elements.len() < primary_key_arity {
                continue;
            }
            let split_at = full.elements.len() - primary_key_arity;
            let primary_key = Tuple::from_elements(full.elements.iter().skip(split_at).cloned());
            let record_key = self.keys.record_key(&self.record_type.name, &primary_key)?;

            if tx.get(&record_key)?.is_none() {
                issues.push(ScrubIssue::DanglingEntry { primary_key: primary_key.clone() });
                if self.config.repair == crate::config::RepairPolicy::Repair {
                    tx.clear(key);
                    repaired += 1;
                }
            }
        }

        let covered_end = {
            let mut next = batch.last().unwrap().0.clone();
            next.push(0x00);
            next
        };
        progress.insert_range(&begin, &covered_end);
        self.save_progress(&mut tx, progress_key, &progress)?;

        self.db.commit(tx)?;
        Ok(Some((issues, repaired)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepairPolicy;
    use crate::kv::memory::MemoryDatabase;
    use crate::record::{Expression, FieldDescriptor, JsonRecordSerializer, TieBreak};
    use crate::store::RecordStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct User {
        id: i64,
        city: String,
        score: i64,
    }

    fn user_type() -> RecordType {
        RecordType {
            name: "User".into(),
            fields: vec![
                FieldDescriptor { name: "id".into(), optional: false, repeated: false },
                FieldDescriptor { name: "city".into(), optional: false, repeated: false },
                FieldDescriptor { name: "score".into(), optional: false, repeated: false },
            ],
            primary_key_fields: vec!["id".into()],
            supports_covering_reconstruction: false,
        }
    }

    fn by_city_index() -> IndexDescriptor {
        IndexDescriptor {
            name: "by_city".into(),
            kind: IndexKind::Value,
            root_expression: Expression::field("city"),
            applies_to_types: vec!["User".into()],
            covering_fields: vec![],
        }
    }

    fn by_score_rank_index() -> IndexDescriptor {
        IndexDescriptor {
            name: "by_score".into(),
            kind: IndexKind::Rank { tie_break: TieBreak::PrimaryKey },
            root_expression: Expression::field("score"),
            applies_to_types: vec!["User".into()],
            covering_fields: vec![],
        }
    }

    #[test]
    fn scrub_missing_detects_and_repairs_an_unindexed_record() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));

        {
            let mut tx = db.begin();
            let record_key = keys
                .record_key("User", &Tuple::from_elements(vec![crate::tuple::Element::Int(1)]))
                .unwrap();
            let serializer = JsonRecordSerializer::<User>::new(["id"]);
            let user = User { id: 1, city: "Tokyo".into(), score: 0 };
            tx.set(&record_key, &serializer.serialize(&user).unwrap());
            db.commit(tx).unwrap();
        }

        let mut config = ScrubberConfig::default();
        config.repair = RepairPolicy::DetectOnly;
        let scrubber = OnlineIndexScrubber::new(
            &db,
            Subspace::new(b"s".to_vec()),
            user_type(),
            by_city_index(),
            JsonRecordSerializer::<User>::new(["id"]),
            config,
        );
        let report = scrubber.scrub_missing().unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.repaired, 0);

        config.repair = RepairPolicy::Repair;
        let scrubber = OnlineIndexScrubber::new(
            &db,
            Subspace::new(b"s".to_vec()),
            user_type(),
            by_city_index(),
            JsonRecordSerializer::<User>::new(["id"]),
            config,
        );
        let report = scrubber.scrub_missing().unwrap();
        assert_eq!(report.repaired, 1);

        let report = scrubber.scrub_missing().unwrap();
        assert!(report.issues.is_empty());
    }

    #[test]
    fn scrub_missing_resumes_from_persisted_progress_across_batches() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let serializer = JsonRecordSerializer::<User>::new(["id"]);

        {
            let mut tx = db.begin();
            for i in 0..7 {
                let record_key =
                    keys.record_key("User", &Tuple::from_elements(vec![crate::tuple::Element::Int(i)])).unwrap();
                let user = User { id: i, city: "Osaka".into(), score: 0 };
                tx.set(&record_key, &serializer.serialize(&user).unwrap());
            }
            db.commit(tx).unwrap();
        }

        let mut config = ScrubberConfig::default();
        config.repair = RepairPolicy::Repair;
        config.entries_per_batch = 2;
        let scrubber = OnlineIndexScrubber::new(
            &db,
            Subspace::new(b"s".to_vec()),
            user_type(),
            by_city_index(),
            JsonRecordSerializer::<User>::new(["id"]),
            config,
        );

        let progress_key = scrubber.missing_progress_key();
        let subspace = keys.records_subspace("User");
        let (begin, end) = subspace.range();

        let first = scrubber.run_missing_batch(&progress_key, &begin, &end).unwrap().unwrap();
        assert_eq!(first.1, 2);
        let second = scrubber.run_missing_batch(&progress_key, &begin, &end).unwrap().unwrap();
        assert_eq!(second.1, 2);

        // A fresh scrubber picks up the persisted progress rather than
        // restarting, and a full run converges on every remaining record.
        let scrubber = OnlineIndexScrubber::new(
            &db,
            Subspace::new(b"s".to_vec()),
            user_type(),
            by_city_index(),
            JsonRecordSerializer::<User>::new(["id"]),
            config,
        );
        let report = scrubber.scrub_missing().unwrap();
        assert_eq!(report.repaired, 3);
    }

    #[test]
    fn scrub_missing_detects_a_rank_index_gap() {
        let db = MemoryDatabase::new();
        let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
        let serializer = JsonRecordSerializer::<User>::new(["id"]);

        {
            let mut tx = db.begin();
            let record_key =
                keys.record_key("User", &Tuple::from_elements(vec![crate::tuple::Element::Int(1)])).unwrap();
            let user = User { id: 1, city: "Tokyo".into(), score: 42 };
            tx.set(&record_key, &serializer.serialize(&user).unwrap());
            db.commit(tx).unwrap();
        }

        let mut config = ScrubberConfig::default();
        config.repair = RepairPolicy::Repair;
        let scrubber = OnlineIndexScrubber::new(
            &db,
            Subspace::new(b"s".to_vec()),
            user_type(),
            by_score_rank_index(),
            JsonRecordSerializer::<User>::new(["id"]),
            config,
        );
        let report = scrubber.scrub_missing().unwrap();
        assert_eq!(report.repaired, 1);

        let mut tx = db.begin();
        let member = Tuple::from_elements(vec![crate::tuple::Element::Int(42), crate::tuple::Element::Int(1)]);
        assert_eq!(rank::rank(&mut tx, &keys, "by_score", &member).unwrap(), Some(0));
    }

    #[test]
    fn scrub_dangling_detects_and_repairs_an_orphaned_entry() {
        let db = MemoryDatabase::new();

        {
            let mut tx = db.begin();
            let mut store = RecordStore::open(
                &mut tx,
                Subspace::new(b"s".to_vec()),
                user_type(),
                vec![by_city_index()],
                JsonRecordSerializer::<User>::new(["id"]),
                1,
                "digest".into(),
            )
            .unwrap();
            store.save(&User { id: 1, city: "Tokyo".into(), score: 0 }).unwrap();
            let pk = Tuple::from_elements(vec![crate::tuple::Element::Int(1)]);
            store.delete(&pk).unwrap();
            db.commit(tx).unwrap();
        }

        // Re-insert the dangling index entry directly, bypassing the store,
        // to simulate drift (e.g. a crash mid-delete in a real KV).
        {
            let mut tx = db.begin();
            let keys = StoreKeys::new(Subspace::new(b"s".to_vec()));
            let subspace = keys.index_subspace("by_city");
            let entry = Tuple::from_elements(vec![crate::tuple::Element::String("Tokyo".into())])
                .concat(Tuple::from_elements(vec![crate::tuple::Element::Int(1)]));
            tx.set(&subspace.pack(&entry).unwrap(), &[]);
            db.commit(tx).unwrap();
        }

        let mut config = ScrubberConfig::default();
        config.repair = RepairPolicy::DetectOnly;
        let scrubber = OnlineIndexScrubber::new(
            &db,
            Subspace::new(b"s".to_vec()),
            user_type(),
            by_city_index(),
            JsonRecordSerializer::<User>::new(["id"]),
            config,
        );
        let report = scrubber.scrub_dangling().unwrap();
        assert_eq!(report.issues.len(), 1);

        config.repair = RepairPolicy::Repair;
        let scrubber = OnlineIndexScrubber::new(
            &db,
            Subspace::new(b"s".to_vec()),
            user_type(),
            by_city_index(),
            JsonRecordSerializer::<User>::new(["id"]),
            config,
        );
        let report = scrubber.scrub_dangling().unwrap();
        assert_eq!(report.repaired, 1);
        let report = scrubber.scrub_dangling().unwrap();
        assert!(report.issues.is_empty());
    }

    #[test]
    fn scrub_dangling_is_a_no_op_for_accumulator_only_kinds() {
        let db = MemoryDatabase::new();
        let descriptor = IndexDescriptor {
            name: "total".into(),
            kind: IndexKind::Sum,
            root_expression: Expression::field("score"),
            applies_to_types: vec!["User".into()],
            covering_fields: vec![],
        };
        let scrubber = OnlineIndexScrubber::new(
            &db,
            Subspace::new(b"s".to_vec()),
            user_type(),
            descriptor,
            JsonRecordSerializer::<User>::new(["id"]),
            ScrubberConfig::default(),
        );
        let report = scrubber.scrub_dangling().unwrap();
        assert_eq!(report, ScrubReport::default());
    }
}
