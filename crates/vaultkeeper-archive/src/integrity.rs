use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info};
use vaultkeeper_core::{
    FkViolation, ModelId, PrimaryKey, Record, RecordStore, SchemaRegistry, StoreError,
    ValidationResult,
};

/// Result of a pre-backup scan plus the number of orphaned child records it found.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreScan {
    pub result: ValidationResult,
    pub orphaned_records: u64,
}

/// Validate the live store before export. See [`scan_store`].
#[must_use]
pub fn validate_store<S: RecordStore + ?Sized>(
    store: &S,
    registry: &SchemaRegistry,
) -> ValidationResult {
    scan_store(store, registry).result
}

/// Run every pre-backup check against the live store.
///
/// Checks are independent: a store failure inside one check is recorded as a warning and the
/// remaining checks still run. Only a null required foreign key is an error.
#[must_use]
pub fn scan_store<S: RecordStore + ?Sized>(store: &S, registry: &SchemaRegistry) -> StoreScan {
    info!("validating record store before backup");
    let mut result = ValidationResult::new();
    let mut cache = RecordCache::new(store);

    check_relations(&mut cache, registry, &mut result);
    let orphaned_records = detect_orphans(&mut cache, registry, &mut result);
    check_required_fields(&mut cache, registry, &mut result);
    result.statistics = Some(collect_statistics(store, registry, &mut result));

    info!(
        errors = result.errors.len(),
        warnings = result.warnings.len(),
        orphaned_records,
        "record store validation finished"
    );
    StoreScan {
        result: result.finish(),
        orphaned_records,
    }
}

/// Lazily loaded records and key sets, so each model is read from the store at most once.
struct RecordCache<'a, S: ?Sized> {
    store: &'a S,
    records: HashMap<ModelId, Vec<Record>>,
    keys: HashMap<ModelId, HashSet<PrimaryKey>>,
}

impl<'a, S: RecordStore + ?Sized> RecordCache<'a, S> {
    fn new(store: &'a S) -> Self {
        Self {
            store,
            records: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    fn records(&mut self, model: &ModelId) -> Result<&[Record], StoreError> {
        if !self.records.contains_key(model) {
            let loaded = self.store.records_of(model)?;
            self.records.insert(model.clone(), loaded);
        }
        Ok(self.records.get(model).map_or(&[], Vec::as_slice))
    }

    fn keys(&mut self, model: &ModelId) -> Result<&HashSet<PrimaryKey>, StoreError> {
        if !self.keys.contains_key(model) {
            let keys = self
                .records(model)?
                .iter()
                .map(|record| record.pk.clone())
                .collect();
            self.keys.insert(model.clone(), keys);
        }
        self.keys
            .get(model)
            .ok_or_else(|| StoreError::Backend(format!("key index for {model} was not built")))
    }

    /// Children of `child` whose `field` names a `parent` key that does not exist.
    fn dangling(
        &mut self,
        child: &ModelId,
        field: &str,
        parent: &ModelId,
    ) -> Result<Vec<(PrimaryKey, PrimaryKey)>, StoreError> {
        let parent_keys = self.keys(parent)?.clone();
        let dangling = self
            .records(child)?
            .iter()
            .filter_map(|record| record.fk_value(field).map(|target| (record.pk.clone(), target)))
            .filter(|(_, target)| !parent_keys.contains(target))
            .collect();
        Ok(dangling)
    }
}

fn check_relations<S: RecordStore + ?Sized>(
    cache: &mut RecordCache<'_, S>,
    registry: &SchemaRegistry,
    result: &mut ValidationResult,
) {
    for relation in &registry.relations {
        let label = format!("{}.{}", relation.child, relation.field);
        debug!(relation = %label, nullable = relation.nullable, "checking foreign key");

        if relation.nullable {
            match cache.dangling(&relation.child, &relation.field, &relation.parent) {
                Ok(dangling) => {
                    for (pk, target_pk) in dangling {
                        result.warn(format!(
                            "{}(id={pk}).{}: parent {}(id={target_pk}) does not exist",
                            relation.child, relation.field, relation.parent
                        ));
                        result.fk_violations.push(FkViolation {
                            model: relation.child.clone(),
                            pk,
                            field: relation.field.clone(),
                            target_model: relation.parent.clone(),
                            target_pk,
                        });
                    }
                }
                Err(err) => result.warn(format!("foreign key check failed ({label}): {err}")),
            }
            continue;
        }

        match cache.records(&relation.child) {
            Ok(records) => {
                let missing = records
                    .iter()
                    .filter(|record| record.fk_value(&relation.field).is_none())
                    .count();
                if missing > 0 {
                    result.error(format!(
                        "{label}: {missing} records missing required reference to {}",
                        relation.parent
                    ));
                }
            }
            Err(err) => result.warn(format!("foreign key check failed ({label}): {err}")),
        }
    }
}

fn detect_orphans<S: RecordStore + ?Sized>(
    cache: &mut RecordCache<'_, S>,
    registry: &SchemaRegistry,
    result: &mut ValidationResult,
) -> u64 {
    let mut orphaned_total = 0_u64;
    for check in &registry.orphan_checks {
        match cache.dangling(&check.child, &check.field, &check.parent) {
            Ok(dangling) if dangling.is_empty() => {}
            Ok(dangling) => {
                orphaned_total += dangling.len() as u64;
                result.warn(format!(
                    "{}: {} orphaned records (parent {} no longer exists)",
                    check.child,
                    dangling.len(),
                    check.parent
                ));
            }
            Err(err) => result.warn(format!("orphan detection failed ({}): {err}", check.child)),
        }
    }
    orphaned_total
}

fn check_required_fields<S: RecordStore + ?Sized>(
    cache: &mut RecordCache<'_, S>,
    registry: &SchemaRegistry,
    result: &mut ValidationResult,
) {
    for required in &registry.required_fields {
        let records = match cache.records(&required.model) {
            Ok(records) => records,
            Err(err) => {
                result.warn(format!("required field check failed ({}): {err}", required.model));
                continue;
            }
        };
        for field in &required.fields {
            let empty = records
                .iter()
                .filter(|record| record.is_blank(field))
                .count();
            if empty > 0 {
                result.warn(format!(
                    "{}.{field}: {empty} records have an empty required field",
                    required.model
                ));
            }
        }
    }
}

fn collect_statistics<S: RecordStore + ?Sized>(
    store: &S,
    registry: &SchemaRegistry,
    result: &mut ValidationResult,
) -> BTreeMap<String, u64> {
    let mut models: BTreeSet<ModelId> = registry.managed_models().cloned().collect();
    match store.models() {
        Ok(mut present) => {
            present.retain(|model| registry.is_managed(model));
            models.extend(present);
        }
        Err(err) => result.warn(format!("could not list stored models: {err}")),
    }

    let mut statistics = BTreeMap::new();
    for model in models {
        let count = match store.count(&model) {
            Ok(count) => count,
            Err(err) => {
                result.warn(format!("statistics unavailable for {model}: {err}"));
                0
            }
        };
        if count > 0 {
            result.note(format!("{model}: {count} records"));
        }
        statistics.insert(model.to_string(), count);
    }

    let total: u64 = statistics.values().sum();
    result.note(format!("total records: {total}"));
    statistics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{rec, registry, sample_records, seeded_store};
    use anyhow::Result;
    use serde_json::json;
    use vaultkeeper_core::ModelId;

    #[test]
    fn clean_store_passes_with_statistics() -> Result<()> {
        let store = seeded_store(&sample_records()?)?;
        let scan = scan_store(&store, &registry()?);

        assert!(
            scan.result.success,
            "unexpected errors: {:?}",
            scan.result.errors
        );
        assert!(
            scan.result.warnings.is_empty(),
            "unexpected warnings: {:?}",
            scan.result.warnings
        );
        assert_eq!(scan.orphaned_records, 0);

        let statistics = scan.result.statistics.unwrap_or_default();
        assert_eq!(statistics.get("shop.customer"), Some(&2));
        assert_eq!(statistics.get("shop.project"), Some(&3));
        assert_eq!(statistics.get("shop.coupon"), Some(&0));
        assert!(!statistics.contains_key("sessions.session"));
        assert!(scan.result.info.iter().any(|line| line == "total records: 9"));
        Ok(())
    }

    #[test]
    fn null_required_reference_is_an_error() -> Result<()> {
        let mut records = sample_records()?;
        records.push(rec("shop.order", 99, json!({"customer": null, "coupon": null}))?);
        let store = seeded_store(&records)?;

        let result = validate_store(&store, &registry()?);
        assert!(!result.success);
        assert_eq!(
            result.errors,
            vec!["shop.order.customer: 1 records missing required reference to shop.customer"]
        );
        Ok(())
    }

    #[test]
    fn dangling_and_orphaned_references_are_warnings() -> Result<()> {
        let mut records = sample_records()?;
        records.push(rec("shop.order", 50, json!({"customer": 404, "coupon": 7}))?);
        let store = seeded_store(&records)?;

        let scan = scan_store(&store, &registry()?);
        assert!(scan.result.success);
        assert_eq!(scan.orphaned_records, 1);
        let dangling = "shop.order(id=50).coupon: parent shop.coupon(id=7) does not exist";
        let orphaned = "shop.order: 1 orphaned records (parent shop.customer no longer exists)";
        assert!(scan.result.warnings.iter().any(|line| line == dangling));
        assert!(scan.result.warnings.iter().any(|line| line == orphaned));
        let coupon = ModelId::parse("shop.coupon")?;
        assert_eq!(scan.result.fk_violations.len(), 1);
        assert_eq!(scan.result.fk_violations[0].target_model, coupon);
        Ok(())
    }

    #[test]
    fn empty_required_fields_warn_without_failing() -> Result<()> {
        let mut records = sample_records()?;
        records.push(rec("shop.customer", 3, json!({"name": ""}))?);
        records.push(rec("shop.customer", 4, json!({}))?);
        let store = seeded_store(&records)?;

        let result = validate_store(&store, &registry()?);
        assert!(result.success);
        assert!(result
            .warnings
            .contains(&"shop.customer.name: 2 records have an empty required field".to_string()));
        Ok(())
    }
}
