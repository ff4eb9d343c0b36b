use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde_json::Value;
use vaultkeeper_core::{EngineInfo, ModelId, PrimaryKey, Record, RecordStore, SchemaRegistry};
use vaultkeeper_store_sqlite::SqliteStore;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const TEST_REGISTRY: &str = r"
models:
  - shop.customer
  - shop.order
  - shop.coupon
  - shop.project
  - shop.note
  - auth.user
  - sessions.session
managed_namespaces: [shop, auth]
relations:
  - { child: shop.order, field: customer, parent: shop.customer }
  - { child: shop.order, field: coupon, parent: shop.coupon, nullable: true }
orphan_checks:
  - { child: shop.order, field: customer, parent: shop.customer }
required_fields:
  - { model: shop.customer, fields: [name] }
forward_references:
  - { model: shop.order, field: customer, target: shop.customer }
  - { model: shop.project, field: customer, target: shop.customer }
ephemeral_models: [sessions.session]
protected_models: [auth.user]
purge_namespaces: [shop, auth]
purge_order: [shop.order, shop.project, shop.note, shop.customer, shop.coupon]
categories:
  customers: [shop.customer]
  sales: [shop.order, shop.coupon, shop.project]
business_entity:
  model: shop.project
";

pub(crate) fn registry() -> Result<SchemaRegistry> {
    Ok(SchemaRegistry::parse(TEST_REGISTRY)?)
}

pub(crate) fn engine() -> EngineInfo {
    EngineInfo {
        schema_version: "4.2".to_string(),
        database_engine: "sqlite".to_string(),
    }
}

pub(crate) fn model(label: &str) -> Result<ModelId> {
    Ok(ModelId::parse(label)?)
}

pub(crate) fn rec(label: &str, pk: i64, fields: Value) -> Result<Record> {
    let Value::Object(fields) = fields else {
        return Err(anyhow!("record fields must be a JSON object"));
    };
    Ok(Record::new(model(label)?, PrimaryKey::Int(pk), fields))
}

pub(crate) fn empty_store() -> Result<SqliteStore> {
    let mut store = SqliteStore::open(Path::new(":memory:"))?;
    store.migrate()?;
    Ok(store)
}

pub(crate) fn seeded_store(records: &[Record]) -> Result<SqliteStore> {
    let mut store = empty_store()?;
    for record in records {
        store.upsert(record)?;
    }
    Ok(store)
}

/// Two customers, two orders, three projects with mixed identifiers, a note, a user and a session.
pub(crate) fn sample_records() -> Result<Vec<Record>> {
    use serde_json::json;
    Ok(vec![
        rec("shop.customer", 1, json!({"name": "Acme"}))?,
        rec("shop.customer", 2, json!({"name": "Globex"}))?,
        rec("shop.order", 10, json!({"customer": 1, "coupon": null}))?,
        rec("shop.order", 11, json!({"customer": 2}))?,
        rec(
            "shop.project",
            1,
            json!({
                "customer": 1,
                "management_no": "M250001",
                "created_at": "2025-01-01T09:00:00Z"
            }),
        )?,
        rec(
            "shop.project",
            2,
            json!({
                "customer": 2,
                "management_no": "25000002",
                "created_at": "2025-01-02T09:00:00Z"
            }),
        )?,
        rec(
            "shop.project",
            3,
            json!({
                "customer": 1,
                "management_no": "000003",
                "created_at": "2025-01-03T09:00:00Z"
            }),
        )?,
        rec("shop.note", 1, json!({"body": "call back"}))?,
        rec("auth.user", 1, json!({"username": "admin"}))?,
        rec("sessions.session", 1, json!({"data": "opaque"}))?,
    ])
}

/// Write a ZIP with the given entries, for archives the builder would never produce.
pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    let mut writer = ZipWriter::new(File::create(path)?);
    for (name, bytes) in entries {
        writer.start_file(*name, SimpleFileOptions::default())?;
        writer.write_all(bytes)?;
    }
    writer.finish()?;
    Ok(())
}
