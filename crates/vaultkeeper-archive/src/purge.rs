use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use vaultkeeper_core::{EngineInfo, ModelId, RecordStore, SchemaRegistry};

use crate::builder::{archive_file_name, ArchiveBuilder, BuildOptions};
use crate::error::BackupError;
use crate::operator::{Operator, Question};

/// Literal the operator must type to confirm delete-all.
pub const DELETE_CONFIRMATION_TOKEN: &str = "DELETE";

const SAFETY_BACKUP_PREFIX: &str = "pre_delete_backup";

#[derive(Debug, Clone, Default)]
pub struct PurgeOptions {
    /// Skip the confirmation token and continue past a failed safety backup
    pub force: bool,
    /// Do not take a safety backup at all
    pub skip_backup: bool,
    /// Continue without asking when the safety backup fails
    pub skip_backup_on_failure: bool,
    /// Token supplied up front; otherwise the operator is asked to type one
    pub confirmation: Option<String>,
    pub backup_dir: PathBuf,
    pub asset_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct PurgeReport {
    pub preview: BTreeMap<String, u64>,
    pub deleted: BTreeMap<String, u64>,
    pub total_deleted: u64,
    pub preserved: BTreeMap<String, u64>,
    pub backup: Option<PathBuf>,
    pub backup_error: Option<String>,
    /// Models whose deletion failed; the rest were still deleted
    pub failures: Vec<String>,
}

/// Delete every purgeable record after a typed confirmation and a safety backup.
///
/// Protected models are never deleted.
///
/// # Errors
/// - [`BackupError::OperatorAborted`] when the token does not match or the operator refuses to
///   continue without a safety backup.
/// - [`BackupError::Store`] when the preview counts cannot be read.
pub fn delete_all<S: RecordStore + ?Sized>(
    store: &mut S,
    registry: &SchemaRegistry,
    engine: &EngineInfo,
    options: &PurgeOptions,
    operator: &dyn Operator,
) -> Result<PurgeReport, BackupError> {
    let order = deletion_order(&*store, registry)?;
    let mut report = PurgeReport::default();
    for model in &order {
        let count = store.count(model)?;
        if count > 0 {
            report.preview.insert(model.to_string(), count);
        }
    }
    for model in &registry.protected_models {
        let count = store.count(model)?;
        report.preserved.insert(model.to_string(), count);
    }
    if report.preview.is_empty() {
        info!("no purgeable records; nothing to delete");
        return Ok(report);
    }

    if !options.force {
        let question = Question::ConfirmDeletion {
            preview: &report.preview,
        };
        let typed = options
            .confirmation
            .clone()
            .or_else(|| operator.typed_token(&question));
        if typed.as_deref().map(str::trim) != Some(DELETE_CONFIRMATION_TOKEN) {
            return Err(BackupError::OperatorAborted(format!(
                "confirmation token did not match {DELETE_CONFIRMATION_TOKEN}"
            )));
        }
    }

    if options.skip_backup {
        warn!("safety backup skipped at operator request");
    } else {
        let output = archive_file_name(
            &options.backup_dir,
            SAFETY_BACKUP_PREFIX,
            OffsetDateTime::now_utc(),
        );
        let mut builder = ArchiveBuilder::new(&*store, registry, engine);
        if let Some(asset_root) = &options.asset_root {
            builder = builder.with_asset_root(asset_root);
        }
        let build = BuildOptions {
            output,
            include_assets: true,
        };
        match builder.build(&build) {
            Ok(summary) => {
                info!(path = %summary.path.display(), "safety backup written");
                report.backup = Some(summary.path);
            }
            Err(err) => {
                let message = err.to_string();
                if options.force || options.skip_backup_on_failure {
                    warn!(error = %message, "safety backup failed; continuing as requested");
                } else if !operator.confirm(&Question::ContinueWithoutBackup { error: &message }) {
                    return Err(BackupError::OperatorAborted(format!(
                        "deletion cancelled because the safety backup failed: {message}"
                    )));
                }
                report.backup_error = Some(message);
            }
        }
    }

    for model in &order {
        match store.delete_model(model) {
            Ok(0) => {}
            Ok(removed) => {
                info!(model = %model, removed, "deleted records");
                report.total_deleted += removed;
                report.deleted.insert(model.to_string(), removed);
            }
            Err(err) => {
                warn!(model = %model, error = %err, "failed to delete records");
                report.failures.push(format!("{model}: {err}"));
            }
        }
    }

    info!(
        total_deleted = report.total_deleted,
        failures = report.failures.len(),
        "delete-all finished"
    );
    Ok(report)
}

/// Declared purge order first, then any other purgeable model found in the store.
fn deletion_order<S: RecordStore + ?Sized>(
    store: &S,
    registry: &SchemaRegistry,
) -> Result<Vec<ModelId>, BackupError> {
    let mut order: Vec<ModelId> = registry
        .purge_order
        .iter()
        .filter(|model| registry.is_purgeable(model))
        .cloned()
        .collect();
    let listed: BTreeSet<ModelId> = order.iter().cloned().collect();
    let remaining: BTreeSet<ModelId> = store
        .models()?
        .into_iter()
        .filter(|model| registry.is_purgeable(model) && !listed.contains(model))
        .collect();
    order.extend(remaining);
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{AutoApprove, Decline};
    use crate::testutil::{engine, model, rec, registry, sample_records, seeded_store};
    use anyhow::{anyhow, Result};
    use serde_json::json;
    use tempfile::TempDir;

    struct Typist(&'static str);

    impl Operator for Typist {
        fn confirm(&self, _question: &Question<'_>) -> bool {
            false
        }

        fn typed_token(&self, _question: &Question<'_>) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn options(dir: &TempDir) -> PurgeOptions {
        PurgeOptions {
            backup_dir: dir.path().join("backups"),
            ..PurgeOptions::default()
        }
    }

    fn backups_in(dir: &TempDir) -> Result<Vec<String>> {
        let backups = dir.path().join("backups");
        if !backups.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(backups)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    #[test]
    fn typed_token_deletes_everything_but_protected_models() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = seeded_store(&sample_records()?)?;
        let registry = registry()?;
        let (engine, options) = (engine(), options(&dir));

        let report = delete_all(&mut store, &registry, &engine, &options, &Typist("DELETE"))?;

        assert_eq!(report.total_deleted, 8);
        assert_eq!(report.deleted.get("shop.project"), Some(&3));
        assert_eq!(report.preserved.get("auth.user"), Some(&1));
        assert!(report.failures.is_empty());
        assert_eq!(store.count(&model("auth.user")?)?, 1);
        assert_eq!(store.count(&model("sessions.session")?)?, 1);
        assert_eq!(store.count(&model("shop.customer")?)?, 0);

        let backups = backups_in(&dir)?;
        assert_eq!(backups.len(), 1);
        assert!(backups[0].starts_with("pre_delete_backup_"));
        let expected = dir.path().join("backups").join(&backups[0]);
        assert_eq!(report.backup, Some(expected));
        Ok(())
    }

    #[test]
    fn wrong_token_aborts_without_side_effects() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = seeded_store(&sample_records()?)?;
        let registry = registry()?;
        let (engine, options) = (engine(), options(&dir));

        let lowercase = Typist("delete");
        let Err(err) = delete_all(&mut store, &registry, &engine, &options, &lowercase) else {
            return Err(anyhow!("lowercase token must not confirm deletion"));
        };
        assert!(err.is_operator_abort());

        let Err(err) = delete_all(&mut store, &registry, &engine, &options, &AutoApprove) else {
            return Err(anyhow!("an operator that cannot type must not confirm deletion"));
        };
        assert!(err.is_operator_abort());

        assert_eq!(store.total_count()?, 10);
        assert!(backups_in(&dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn force_and_skip_backup_need_no_operator() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = seeded_store(&sample_records()?)?;
        let registry = registry()?;
        let options = PurgeOptions {
            force: true,
            skip_backup: true,
            ..options(&dir)
        };

        let report = delete_all(&mut store, &registry, &engine(), &options, &Decline)?;
        assert_eq!(report.total_deleted, 8);
        assert!(report.backup.is_none());
        assert!(backups_in(&dir)?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_safety_backup_needs_an_override() -> Result<()> {
        let dir = TempDir::new()?;
        let mut records = sample_records()?;
        records.push(rec("shop.order", 66, json!({"customer": null}))?);
        let registry = registry()?;

        let mut store = seeded_store(&records)?;
        let confirmed = PurgeOptions {
            confirmation: Some("DELETE".to_string()),
            ..options(&dir)
        };
        let Err(err) = delete_all(&mut store, &registry, &engine(), &confirmed, &Decline) else {
            return Err(anyhow!("a failed backup must stop deletion unless overridden"));
        };
        assert!(err.is_operator_abort());
        assert!(err.to_string().contains("safety backup failed"));
        assert_eq!(store.total_count()?, 11);

        let report = delete_all(&mut store, &registry, &engine(), &confirmed, &AutoApprove)?;
        assert!(report.backup_error.is_some());
        assert_eq!(report.total_deleted, 9);

        let mut store = seeded_store(&records)?;
        let unattended = PurgeOptions {
            skip_backup_on_failure: true,
            ..confirmed
        };
        let report = delete_all(&mut store, &registry, &engine(), &unattended, &Decline)?;
        assert!(report.backup.is_none());
        let backup_error = report.backup_error.unwrap_or_default();
        assert!(backup_error.contains("missing required reference"));
        assert_eq!(store.count(&model("shop.order")?)?, 0);
        Ok(())
    }

    #[test]
    fn empty_store_has_nothing_to_confirm() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = seeded_store(&[rec("auth.user", 1, json!({"username": "admin"}))?])?;
        let registry = registry()?;
        let report = delete_all(&mut store, &registry, &engine(), &options(&dir), &Decline)?;
        assert_eq!(report.total_deleted, 0);
        assert!(report.preview.is_empty());
        assert_eq!(report.preserved.get("auth.user"), Some(&1));
        Ok(())
    }
}
