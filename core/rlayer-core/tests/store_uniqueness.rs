//! Updating a record that holds a unique-indexed value must free that value
//! for reuse by another record in the same transaction sequence.

use rlayer_core::error::RecordLayerError;
use rlayer_core::kv::memory::MemoryDatabase;
use rlayer_core::kv::KvDatabase;
use rlayer_core::record::{Expression, FieldDescriptor, IndexDescriptor, IndexKind, JsonRecordSerializer, RecordType};
use rlayer_core::store::RecordStore;
use rlayer_core::tuple::{Element, Subspace, Tuple};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Account {
    id: i64,
    handle: String,
}

fn account_type() -> RecordType {
    RecordType {
        name: "Account".into(),
        fields: vec![
            FieldDescriptor { name: "id".into(), optional: false, repeated: false },
            FieldDescriptor { name: "handle".into(), optional: false, repeated: false },
        ],
        primary_key_fields: vec!["id".into()],
        supports_covering_reconstruction: false,
    }
}

fn by_handle_index() -> IndexDescriptor {
    IndexDescriptor {
        name: "by_handle".into(),
        kind: IndexKind::Unique,
        root_expression: Expression::field("handle"),
        applies_to_types: vec!["Account".into()],
        covering_fields: vec![],
    }
}

fn open(tx: &mut rlayer_core::kv::memory::MemoryTransaction) -> RecordStore<'_, rlayer_core::kv::memory::MemoryTransaction, Account, JsonRecordSerializer<Account>> {
    RecordStore::open(
        tx,
        Subspace::new(b"accounts".to_vec()),
        account_type(),
        vec![by_handle_index()],
        JsonRecordSerializer::<Account>::new(["id"]),
        1,
        "v1".into(),
    )
    .unwrap()
}

#[test]
fn renaming_away_from_a_handle_frees_it_for_reuse() {
    let db = MemoryDatabase::new();
    let mut tx = db.begin();
    {
        let mut store = open(&mut tx);
        store.save(&Account { id: 1, handle: "alice".into() }).unwrap();
        store.save(&Account { id: 2, handle: "bob".into() }).unwrap();
    }
    db.commit(tx).unwrap();

    let mut tx = db.begin();
    {
        let mut store = open(&mut tx);
        // bob takes a new handle, freeing "bob".
        store.save(&Account { id: 2, handle: "bobby".into() }).unwrap();
        // someone else may now take "bob".
        store.save(&Account { id: 3, handle: "bob".into() }).unwrap();
    }
    db.commit(tx).unwrap();

    let mut tx = db.begin();
    let loaded = {
        let mut store = open(&mut tx);
        store.load(&Tuple::from_elements(vec![Element::Int(3)])).unwrap().unwrap()
    };
    assert_eq!(loaded.handle, "bob");
}

#[test]
fn two_records_cannot_hold_the_same_unique_value_at_once() {
    let db = MemoryDatabase::new();
    let mut tx = db.begin();
    let mut store = open(&mut tx);
    store.save(&Account { id: 1, handle: "alice".into() }).unwrap();
    let err = store.save(&Account { id: 2, handle: "alice".into() }).unwrap_err();
    assert!(matches!(err, RecordLayerError::UniquenessViolation { .. }));
}
