use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, warn};
use vaultkeeper_core::{
    EngineInfo, FkIntegrity, FkViolation, Manifest, ModelId, PrimaryKey, Record, SchemaRegistry,
    ValidationResult, BACKUP_FORMAT_VERSION, REQUIRED_MANIFEST_FIELDS,
};
use zip::ZipArchive;

use crate::error::{BackupError, ErrorKind};
use crate::loader::ensure_known_models;
use crate::reader::{has_entry, media_entries, open_archive, read_entry, ArchiveLimits};
use crate::{DATA_ENTRY, DISPLAY_LIMIT, MANIFEST_ENTRY};

const SPOT_CHECK_ENTRIES: usize = 10;
const RECORD_KEYS: [&str; 3] = ["model", "pk", "fields"];

/// Validation result plus the category of the failure that stopped it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveInspection {
    pub result: ValidationResult,
    pub failure: Option<ErrorKind>,
}

impl ArchiveInspection {
    fn passed(result: ValidationResult) -> Self {
        let result = result.finish();
        info!(
            warnings = result.warnings.len(),
            fk_violations = result.fk_violations.len(),
            "archive validation passed"
        );
        Self {
            result,
            failure: None,
        }
    }

    fn rejected(result: ValidationResult, kind: ErrorKind) -> Self {
        let result = result.finish();
        warn!(
            kind = kind.as_str(),
            errors = result.errors.len(),
            "archive validation failed"
        );
        Self {
            result,
            failure: Some(kind),
        }
    }
}

/// Run the staged archive checks: structure, manifest fields, version compatibility,
/// record document shape, and forward references inside the document.
///
/// Each stage runs only if the previous one produced no errors. Problems with the archive's
/// contents are reported in the returned result and never as `Err`.
///
/// # Errors
/// Returns [`BackupError::Resource`] when the archive file cannot be opened at all.
pub fn inspect_archive(
    path: &Path,
    engine: &EngineInfo,
    registry: &SchemaRegistry,
    limits: &ArchiveLimits,
) -> Result<ArchiveInspection, BackupError> {
    info!(archive = %path.display(), "validating backup archive");
    let mut result = ValidationResult::new();

    let mut archive = match open_archive(path) {
        Ok(archive) => archive,
        Err(BackupError::Structural(message)) => {
            result.error(message);
            return Ok(ArchiveInspection::rejected(result, ErrorKind::Structural));
        }
        Err(other) => return Err(other),
    };

    check_structure(&mut archive, limits, &mut result);
    if !result.is_success() {
        return Ok(ArchiveInspection::rejected(result, ErrorKind::Structural));
    }

    let Some(manifest) = check_manifest(&mut archive, &mut result) else {
        return Ok(ArchiveInspection::rejected(result, ErrorKind::Structural));
    };

    check_versions(&manifest, engine, &mut result);
    let total_records = manifest.total_records;
    result.metadata = Some(manifest);

    let records = match check_document(&mut archive, registry, total_records, &mut result) {
        Ok(records) => records,
        Err(kind) => return Ok(ArchiveInspection::rejected(result, kind)),
    };

    check_forward_references(&records, registry, &mut result);
    Ok(ArchiveInspection::passed(result))
}

fn check_structure(
    archive: &mut ZipArchive<File>,
    limits: &ArchiveLimits,
    result: &mut ValidationResult,
) {
    match limits.violation(archive) {
        Ok(None) => {}
        Ok(Some(violation)) => {
            result.error(format!("archive rejected: {violation}"));
            return;
        }
        Err(err) => {
            result.error(format!("archive directory is unreadable: {err}"));
            return;
        }
    }

    for required in [DATA_ENTRY, MANIFEST_ENTRY] {
        if !has_entry(archive, required) {
            result.error(format!("required entry {required} is missing"));
        }
    }
    if !result.is_success() {
        return;
    }

    if let Ok(entry) = archive.by_name(DATA_ENTRY) {
        result.note(format!("{DATA_ENTRY}: {} bytes", entry.size()));
    }
    let media = media_entries(archive).len();
    if media == 0 {
        result.warn("archive contains no media files");
    } else {
        result.note(format!("media files: {media}"));
    }
}

fn check_manifest(
    archive: &mut ZipArchive<File>,
    result: &mut ValidationResult,
) -> Option<Manifest> {
    let raw = match read_entry(archive, MANIFEST_ENTRY) {
        Ok(raw) => raw,
        Err(err) => {
            result.error(format!("{MANIFEST_ENTRY} could not be read: {err}"));
            return None;
        }
    };
    let value: Value = match serde_json::from_slice(&raw) {
        Ok(value) => value,
        Err(err) => {
            result.error(format!("{MANIFEST_ENTRY} is not valid JSON: {err}"));
            return None;
        }
    };
    let Some(object) = value.as_object() else {
        result.error(format!("{MANIFEST_ENTRY} must be a JSON object"));
        return None;
    };

    for field in REQUIRED_MANIFEST_FIELDS {
        if !object.contains_key(field) {
            result.error(format!("{MANIFEST_ENTRY} is missing required field {field}"));
        }
    }
    if !result.is_success() {
        return None;
    }

    let manifest: Manifest = match serde_json::from_value(value) {
        Ok(manifest) => manifest,
        Err(err) => {
            result.error(format!("{MANIFEST_ENTRY} has malformed fields: {err}"));
            return None;
        }
    };

    if manifest.backup_version != BACKUP_FORMAT_VERSION {
        result.warn(format!(
            "unrecognized backup format version {}; attempting restore anyway",
            manifest.backup_version
        ));
    }
    if manifest.validation.fk_integrity == FkIntegrity::Failed {
        result.warn(format!(
            "archive was exported with foreign key integrity {}",
            manifest.validation.fk_integrity.as_str()
        ));
    }
    result.note(format!("backup created at {}", manifest.created_at));
    result.note(format!(
        "manifest lists {} records across {} models",
        manifest.total_records,
        manifest.model_count()
    ));
    Some(manifest)
}

fn check_versions(manifest: &Manifest, engine: &EngineInfo, result: &mut ValidationResult) {
    if manifest.django_version != engine.schema_version {
        result.warn(format!(
            "archive was created with schema version {}, running {}",
            manifest.django_version, engine.schema_version
        ));
    }
    if !manifest.database_engine.is_empty() && manifest.database_engine != engine.database_engine {
        result.warn(format!(
            "archive was created on database engine {}, running {}",
            manifest.database_engine, engine.database_engine
        ));
    }
}

fn check_document(
    archive: &mut ZipArchive<File>,
    registry: &SchemaRegistry,
    expected: u64,
    result: &mut ValidationResult,
) -> Result<Vec<Record>, ErrorKind> {
    let raw = read_entry(archive, DATA_ENTRY).map_err(|err| {
        result.error(format!("{DATA_ENTRY} could not be read: {err}"));
        ErrorKind::Structural
    })?;
    let value: Value = serde_json::from_slice(&raw).map_err(|err| {
        result.error(format!("{DATA_ENTRY} is not valid JSON: {err}"));
        ErrorKind::Structural
    })?;
    let Value::Array(entries) = value else {
        result.error(format!("{DATA_ENTRY} must be a JSON array of records"));
        return Err(ErrorKind::Structural);
    };
    if entries.is_empty() {
        result.error(format!("{DATA_ENTRY} contains no records"));
        return Err(ErrorKind::Structural);
    }

    for (index, entry) in entries.iter().take(SPOT_CHECK_ENTRIES).enumerate() {
        for key in RECORD_KEYS {
            if entry.get(key).is_none() {
                result.error(format!("{DATA_ENTRY} entry {index} is missing key {key}"));
            }
        }
    }
    if !result.is_success() {
        return Err(ErrorKind::Structural);
    }

    let actual = entries.len() as u64;
    if actual != expected {
        result.error(format!(
            "record count mismatch: manifest lists {expected}, {DATA_ENTRY} holds {actual}"
        ));
        return Err(ErrorKind::Integrity);
    }
    result.note(format!("{DATA_ENTRY} holds {actual} records"));

    let records: Vec<Record> = serde_json::from_value(Value::Array(entries)).map_err(|err| {
        result.error(format!("{DATA_ENTRY} holds a malformed record: {err}"));
        ErrorKind::Structural
    })?;
    if let Err(err) = ensure_known_models(&records, registry) {
        result.error(err.to_string());
        return Err(ErrorKind::Structural);
    }
    Ok(records)
}

fn check_forward_references(
    records: &[Record],
    registry: &SchemaRegistry,
    result: &mut ValidationResult,
) {
    let index: HashSet<(&ModelId, &PrimaryKey)> = records
        .iter()
        .map(|record| (&record.model, &record.pk))
        .collect();

    let mut violations = Vec::new();
    for reference in &registry.forward_references {
        for record in records {
            if record.model != reference.model {
                continue;
            }
            let Some(target_pk) = record.fk_value(&reference.field) else {
                continue;
            };
            if !index.contains(&(&reference.target, &target_pk)) {
                violations.push(FkViolation {
                    model: record.model.clone(),
                    pk: record.pk.clone(),
                    field: reference.field.clone(),
                    target_model: reference.target.clone(),
                    target_pk,
                });
            }
        }
    }
    debug!(
        checked = registry.forward_references.len(),
        violations = violations.len(),
        "forward references checked"
    );

    if violations.is_empty() {
        result.note("forward references: all resolved within the archive");
        return;
    }
    for violation in violations.iter().take(DISPLAY_LIMIT) {
        result.warn(format!(
            "{}(id={}).{}: references {}(id={}) which is not in the archive",
            violation.model,
            violation.pk,
            violation.field,
            violation.target_model,
            violation.target_pk
        ));
    }
    if violations.len() > DISPLAY_LIMIT {
        result.warn(format!(
            "... and {} more forward reference violations",
            violations.len() - DISPLAY_LIMIT
        ));
    }
    result.fk_violations = violations;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{engine, registry, write_zip};
    use anyhow::{anyhow, Result};
    use serde_json::json;
    use tempfile::TempDir;

    fn manifest_bytes(total: u64) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&json!({
            "backup_version": "1.0",
            "created_at": "2025-01-01T00:00:00Z",
            "django_version": "4.2",
            "database_engine": "sqlite",
            "total_records": total,
            "models": {"shop.customer": 1, "shop.order": 1},
        }))?)
    }

    fn document(entries: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(entries)?)
    }

    fn one_customer() -> Result<Vec<u8>> {
        document(&json!([{"model": "shop.customer", "pk": 1, "fields": {"name": "A"}}]))
    }

    fn write_archive(path: &Path, data: &[u8], manifest: &[u8]) -> Result<()> {
        write_zip(path, &[(DATA_ENTRY, data), (MANIFEST_ENTRY, manifest)])
    }

    fn inspect(path: &Path) -> Result<ArchiveInspection> {
        Ok(inspect_archive(path, &engine(), &registry()?, &ArchiveLimits::default())?)
    }

    #[test]
    fn child_before_parent_has_no_violations() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ordered.zip");
        let data = document(&json!([
            {"model": "shop.order", "pk": 5, "fields": {"customer": 9}},
            {"model": "shop.customer", "pk": 9, "fields": {"name": "Late Parent"}},
        ]))?;
        let manifest = manifest_bytes(2)?;
        write_zip(
            &path,
            &[
                (DATA_ENTRY, &data),
                (MANIFEST_ENTRY, &manifest),
                ("media/a.txt", b"asset"),
            ],
        )?;

        let result = inspect(&path)?.result;
        assert!(result.success, "errors: {:?}", result.errors);
        assert!(result.fk_violations.is_empty());
        assert!(
            result.warnings.is_empty(),
            "warnings: {:?}",
            result.warnings
        );
        let total = result.metadata.map(|manifest| manifest.total_records);
        assert_eq!(total, Some(2));
        Ok(())
    }

    #[test]
    fn missing_manifest_is_structural() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("no_manifest.zip");
        write_zip(&path, &[(DATA_ENTRY, b"[]")])?;

        let inspection = inspect(&path)?;
        assert_eq!(inspection.failure, Some(ErrorKind::Structural));
        let expected = "required entry metadata.json is missing";
        assert_eq!(inspection.result.errors, vec![expected]);
        assert!(inspection.result.metadata.is_none());
        Ok(())
    }

    #[test]
    fn record_count_mismatch_is_an_integrity_failure() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("tampered.zip");
        write_archive(&path, &one_customer()?, &manifest_bytes(3)?)?;

        let inspection = inspect(&path)?;
        assert_eq!(inspection.failure, Some(ErrorKind::Integrity));
        assert_eq!(
            inspection.result.errors,
            vec!["record count mismatch: manifest lists 3, data.json holds 1"]
        );
        Ok(())
    }

    #[test]
    fn each_missing_manifest_field_is_reported() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("thin_manifest.zip");
        let manifest = serde_json::to_vec(&json!({"backup_version": "1.0", "models": {}}))?;
        write_archive(&path, b"[]", &manifest)?;

        let inspection = inspect(&path)?;
        assert_eq!(inspection.failure, Some(ErrorKind::Structural));
        assert_eq!(
            inspection.result.errors,
            vec![
                "metadata.json is missing required field created_at",
                "metadata.json is missing required field django_version",
                "metadata.json is missing required field total_records",
            ]
        );
        Ok(())
    }

    #[test]
    fn version_differences_only_warn() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("old.zip");
        let manifest = serde_json::to_vec(&json!({
            "backup_version": "0.9",
            "created_at": "2024-01-01T00:00:00Z",
            "django_version": "3.2",
            "database_engine": "postgresql",
            "total_records": 1,
        }))?;
        write_archive(&path, &one_customer()?, &manifest)?;

        let result = inspect(&path)?.result;
        assert!(result.success);
        assert_eq!(
            result.warnings,
            vec![
                "archive contains no media files",
                "unrecognized backup format version 0.9; attempting restore anyway",
                "archive was created with schema version 3.2, running 4.2",
                "archive was created on database engine postgresql, running sqlite",
            ]
        );
        Ok(())
    }

    #[test]
    fn failed_export_integrity_is_a_warning() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("flagged.zip");
        let manifest = serde_json::to_vec(&json!({
            "backup_version": "1.0",
            "created_at": "2025-01-01T00:00:00Z",
            "django_version": "4.2",
            "database_engine": "sqlite",
            "total_records": 1,
            "validation": {"fk_integrity": "failed", "orphaned_records": 2, "warnings": []},
        }))?;
        write_archive(&path, &one_customer()?, &manifest)?;

        let inspection = inspect(&path)?;
        assert_eq!(inspection.failure, None);
        let flagged = "archive was exported with foreign key integrity failed".to_string();
        assert!(inspection.result.warnings.contains(&flagged));
        let metadata = inspection.result.metadata;
        let fk_integrity = metadata.map(|manifest| manifest.validation.fk_integrity);
        assert_eq!(fk_integrity, Some(FkIntegrity::Failed));
        Ok(())
    }

    #[test]
    fn document_shape_errors_stop_validation() -> Result<()> {
        let dir = TempDir::new()?;

        let empty = dir.path().join("empty.zip");
        write_archive(&empty, b"[]", &manifest_bytes(0)?)?;
        let errors = inspect(&empty)?.result.errors;
        assert_eq!(errors, vec!["data.json contains no records"]);

        let object = dir.path().join("object.zip");
        write_archive(&object, b"{}", &manifest_bytes(0)?)?;
        let errors = inspect(&object)?.result.errors;
        assert_eq!(errors, vec!["data.json must be a JSON array of records"]);

        let sparse = dir.path().join("sparse.zip");
        let data = document(&json!([{"model": "shop.customer"}, {"pk": 2, "fields": {}}]))?;
        write_archive(&sparse, &data, &manifest_bytes(2)?)?;
        assert_eq!(
            inspect(&sparse)?.result.errors,
            vec![
                "data.json entry 0 is missing key pk",
                "data.json entry 0 is missing key fields",
                "data.json entry 1 is missing key model",
            ]
        );
        Ok(())
    }

    #[test]
    fn unknown_models_are_rejected_before_restore() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("foreign.zip");
        let data = document(&json!([{"model": "billing.invoice", "pk": 1, "fields": {}}]))?;
        write_archive(&path, &data, &manifest_bytes(1)?)?;

        let inspection = inspect(&path)?;
        assert_eq!(inspection.failure, Some(ErrorKind::Structural));
        assert!(inspection.result.errors[0].contains("unknown models: billing.invoice"));
        Ok(())
    }

    #[test]
    fn dangling_forward_references_are_capped_for_display() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dangling.zip");
        let orders: Vec<_> = (1..=12)
            .map(|pk| json!({"model": "shop.order", "pk": pk, "fields": {"customer": 1000 + pk}}))
            .collect();
        let data = document(&serde_json::Value::Array(orders))?;
        write_archive(&path, &data, &manifest_bytes(12)?)?;

        let result = inspect(&path)?.result;
        assert!(result.success);
        assert_eq!(result.fk_violations.len(), 12);
        let fk_warnings: Vec<_> = result
            .warnings
            .iter()
            .filter(|line| line.contains("not in the archive"))
            .collect();
        assert_eq!(fk_warnings.len(), DISPLAY_LIMIT);
        assert_eq!(
            result.warnings.last().map(String::as_str),
            Some("... and 2 more forward reference violations")
        );
        Ok(())
    }

    #[test]
    fn unreadable_inputs() -> Result<()> {
        let dir = TempDir::new()?;
        let garbage = dir.path().join("garbage.zip");
        std::fs::write(&garbage, b"definitely not a zip")?;
        let inspection = inspect(&garbage)?;
        assert_eq!(inspection.failure, Some(ErrorKind::Structural));

        let Err(err) = inspect_archive(
            &dir.path().join("missing.zip"),
            &engine(),
            &registry()?,
            &ArchiveLimits::default(),
        ) else {
            return Err(anyhow!("missing archive should be a resource error"));
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        Ok(())
    }

    #[test]
    fn entry_limit_rejects_oversized_archives() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("crowded.zip");
        let (data, manifest) = (one_customer()?, manifest_bytes(1)?);
        write_zip(
            &path,
            &[
                (DATA_ENTRY, &data),
                (MANIFEST_ENTRY, &manifest),
                ("media/x", b"x"),
            ],
        )?;

        let limits = ArchiveLimits {
            max_entries: 2,
            ..ArchiveLimits::default()
        };
        let inspection = inspect_archive(&path, &engine(), &registry()?, &limits)?;
        assert_eq!(inspection.failure, Some(ErrorKind::Structural));
        let expected = "archive rejected: archive holds 3 entries, limit is 2";
        assert_eq!(inspection.result.errors, vec![expected]);
        Ok(())
    }
}
