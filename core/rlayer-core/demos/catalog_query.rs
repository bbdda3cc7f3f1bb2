//! A small product catalog: a Value index, a Unique index, and a query
//! planned and executed through the filter/cursor stack.
//!
//! Run: cargo run --example catalog_query -p rlayer-core

use rlayer_core::kv::memory::MemoryDatabase;
use rlayer_core::kv::KvDatabase;
use rlayer_core::query::{Comparison, Cursor, FilterExpr, Planner, QueryRequest};
use rlayer_core::record::{Expression, FieldDescriptor, IndexDescriptor, IndexKind, JsonRecordSerializer, RecordType, Schema};
use rlayer_core::store::{RecordStore, StoreKeys};
use rlayer_core::tuple::{Element, Subspace};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Product {
    sku: String,
    category: String,
    price_cents: i64,
}

fn product_type() -> RecordType {
    RecordType {
        name: "Product".into(),
        fields: vec![
            FieldDescriptor { name: "sku".into(), optional: false, repeated: false },
            FieldDescriptor { name: "category".into(), optional: false, repeated: false },
            FieldDescriptor { name: "price_cents".into(), optional: false, repeated: false },
        ],
        primary_key_fields: vec!["sku".into()],
        supports_covering_reconstruction: false,
    }
}

fn by_sku_index() -> IndexDescriptor {
    IndexDescriptor {
        name: "by_sku".into(),
        kind: IndexKind::Unique,
        root_expression: Expression::field("sku"),
        applies_to_types: vec!["Product".into()],
        covering_fields: vec![],
    }
}

fn by_category_index() -> IndexDescriptor {
    IndexDescriptor {
        name: "by_category".into(),
        kind: IndexKind::Value,
        root_expression: Expression::field("category"),
        applies_to_types: vec!["Product".into()],
        covering_fields: vec![],
    }
}

fn main() -> rlayer_core::error::RlResult<()> {
    let db = MemoryDatabase::new();
    let indexes = vec![by_sku_index(), by_category_index()];

    let catalog = [
        Product { sku: "SKU-1".into(), category: "electronics".into(), price_cents: 12999 },
        Product { sku: "SKU-2".into(), category: "electronics".into(), price_cents: 4999 },
        Product { sku: "SKU-3".into(), category: "kitchen".into(), price_cents: 2499 },
    ];

    let mut tx = db.begin();
    {
        let mut store = RecordStore::open(
            &mut tx,
            Subspace::new(b"catalog".to_vec()),
            product_type(),
            indexes.clone(),
            JsonRecordSerializer::<Product>::new(["sku"]),
            1,
            "v1".into(),
        )?;
        for product in &catalog {
            store.save(product)?;
        }
    }
    db.commit(tx)?;

    let mut schema = Schema::new(1);
    schema.record_types.push(product_type());
    schema.indexes.extend(indexes);

    let planner = Planner::new(schema.clone());
    let request = QueryRequest {
        record_type: "Product".into(),
        filter: Some(FilterExpr::Compare {
            field: "category".into(),
            op: Comparison::Eq,
            value: Element::String("electronics".into()),
        }),
        sort: vec!["price_cents".into()],
        limit: None,
    };
    let plan = planner.plan(&request);

    let mut tx = db.begin();
    let keys = StoreKeys::new(Subspace::new(b"catalog".to_vec()));
    let serializer = JsonRecordSerializer::<Product>::new(["sku"]);
    let mut cursor = Cursor::new(&mut tx, &keys, &schema, &serializer);
    let rows = cursor.execute(&plan)?;

    println!("electronics, cheapest first:");
    for product in &rows {
        println!("  {} — {} cents", product.sku, product.price_cents);
    }

    Ok(())
}
