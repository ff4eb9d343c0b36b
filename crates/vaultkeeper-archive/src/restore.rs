use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{info, warn};
use vaultkeeper_core::{EngineInfo, RecordStore, SchemaRegistry, ValidationResult};
use walkdir::WalkDir;

use crate::error::{BackupError, RestoreStage};
use crate::loader::{ensure_known_models, load_records, ImportMode, LoadTally};
use crate::lock::RestoreLock;
use crate::operator::{Operator, Question};
use crate::reader::{extract_to, open_archive, ArchiveLimits};
use crate::renumber::renormalize_identifiers;
use crate::validator::inspect_archive;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreOptions {
    /// Wipe the store before loading
    pub clear_first: bool,
    /// Validate only; never write
    pub dry_run: bool,
    /// Proceed past validation warnings and the clear confirmation without asking
    pub force_ignore_warnings: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RestoreReport {
    pub stage_reached: RestoreStage,
    pub validation: ValidationResult,
    pub records_cleared: u64,
    pub records_loaded: usize,
    pub records_inserted: usize,
    pub records_replaced: usize,
    pub identifiers_renumbered: usize,
    pub assets_restored: usize,
    pub dry_run: bool,
}

impl RestoreReport {
    fn new(dry_run: bool) -> Self {
        Self {
            stage_reached: RestoreStage::PreCheck,
            validation: ValidationResult::new(),
            records_cleared: 0,
            records_loaded: 0,
            records_inserted: 0,
            records_replaced: 0,
            identifiers_renumbered: 0,
            assets_restored: 0,
            dry_run,
        }
    }

    fn enter(&mut self, stage: RestoreStage) {
        self.stage_reached = stage;
        info!(
            stage = %stage,
            records_loaded = self.records_loaded,
            identifiers_renumbered = self.identifiers_renumbered,
            assets_restored = self.assets_restored,
            "restore stage"
        );
    }

    fn absorb(&mut self, tally: LoadTally) {
        self.records_loaded = tally.loaded;
        self.records_inserted = tally.inserted;
        self.records_replaced = tally.replaced;
    }

    fn fail(&self, source: BackupError) -> BackupError {
        warn!(
            stage = %self.stage_reached,
            records_loaded = self.records_loaded,
            assets_restored = self.assets_restored,
            error = %source,
            "restore stage failed; store may hold partial data"
        );
        BackupError::StageFailed {
            stage: self.stage_reached,
            records_loaded: self.records_loaded,
            assets_restored: self.assets_restored,
            source: Box::new(source),
        }
    }

    fn abort(&mut self, err: BackupError) -> BackupError {
        info!(from = %self.stage_reached, reason = %err, "restore aborted");
        self.stage_reached = RestoreStage::Aborted;
        err
    }
}

/// Full restore of an archive into a record store and asset root.
pub struct RestoreEngine<'a, S: ?Sized> {
    store: &'a mut S,
    registry: &'a SchemaRegistry,
    engine: &'a EngineInfo,
    asset_root: PathBuf,
    lock_dir: PathBuf,
    limits: ArchiveLimits,
}

impl<'a, S: RecordStore + ?Sized> RestoreEngine<'a, S> {
    pub fn new(
        store: &'a mut S,
        registry: &'a SchemaRegistry,
        engine: &'a EngineInfo,
        asset_root: impl Into<PathBuf>,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            registry,
            engine,
            asset_root: asset_root.into(),
            lock_dir: lock_dir.into(),
            limits: ArchiveLimits::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Restore `archive`, stage by stage.
    ///
    /// Holds the restore lock for the whole run. Nothing is written before validation passes
    /// and any warnings are accepted. A dry run stops after validation without asking about
    /// warnings. Failures after writing has begun come back as [`BackupError::StageFailed`]
    /// with the progress made so far; nothing is rolled back.
    ///
    /// # Errors
    /// - [`BackupError::RestoreInProgress`] when another restore holds the lock.
    /// - [`BackupError::Resource`] when the archive does not exist.
    /// - [`BackupError::ValidationFailed`] when the archive fails validation.
    /// - [`BackupError::OperatorAborted`] when the operator declines a confirmation.
    /// - [`BackupError::StageFailed`] when clearing, loading, renumbering, or asset copying fails.
    pub fn restore(
        &mut self,
        archive: &Path,
        options: &RestoreOptions,
        operator: &dyn Operator,
    ) -> Result<RestoreReport, BackupError> {
        let mut report = RestoreReport::new(options.dry_run);
        report.enter(RestoreStage::PreCheck);
        let _lock = RestoreLock::acquire(&self.lock_dir, "restore")?;
        if !archive.is_file() {
            let missing = io::Error::new(io::ErrorKind::NotFound, "archive does not exist");
            return Err(report.abort(BackupError::io_at("open archive", archive, missing)));
        }

        report.enter(RestoreStage::Validate);
        let inspection = inspect_archive(archive, self.engine, self.registry, &self.limits)
            .map_err(|err| report.abort(err))?;
        report.validation = inspection.result;
        if let Some(kind) = inspection.failure {
            let result = Box::new(report.validation.clone());
            return Err(report.abort(BackupError::ValidationFailed { kind, result }));
        }
        if options.dry_run {
            info!(
                archive = %archive.display(),
                warnings = report.validation.warnings.len(),
                "dry run: archive is restorable, nothing written"
            );
            return Ok(report);
        }
        if report.validation.has_warnings() && !options.force_ignore_warnings {
            let question = Question::ProceedWithWarnings {
                warnings: &report.validation.warnings,
            };
            if !operator.confirm(&question) {
                return Err(report.abort(BackupError::OperatorAborted(
                    "restore declined because of validation warnings".to_string(),
                )));
            }
        }

        if options.clear_first {
            report.enter(RestoreStage::ClearExisting);
            let existing = self
                .store
                .total_count()
                .map_err(|err| report.fail(err.into()))?;
            if !options.force_ignore_warnings
                && !operator.confirm(&Question::ClearExisting { records: existing })
            {
                return Err(report.abort(BackupError::OperatorAborted(
                    "clearing the existing store was declined".to_string(),
                )));
            }
            let cleared = self.store.clear(&[]);
            report.records_cleared = cleared.map_err(|err| report.fail(err.into()))?;
        }

        report.enter(RestoreStage::ExtractAndLoad);
        let scratch = TempDir::new().map_err(|err| {
            report.fail(BackupError::io("failed to create scratch directory", err))
        })?;
        let mut zip = open_archive(archive).map_err(|err| report.fail(err))?;
        let extracted = extract_to(&mut zip, scratch.path()).map_err(|err| report.fail(err))?;
        let records = extracted.records().map_err(|err| report.fail(err))?;
        ensure_known_models(&records, self.registry).map_err(|err| report.fail(err))?;
        let mut tally = LoadTally::default();
        let loaded = load_records(
            &mut *self.store,
            &records,
            ImportMode::Overwrite,
            &mut tally,
        );
        report.absorb(tally);
        loaded.map_err(|err| report.fail(err))?;

        report.enter(RestoreStage::RenormalizeIdentifiers);
        let renumbered = renormalize_identifiers(&mut *self.store, self.registry)
            .map_err(|err| report.fail(err))?;
        report.identifiers_renumbered = renumbered.renumbered;

        report.enter(RestoreStage::RestoreAssets);
        let copied = copy_assets(
            &extracted.media_root,
            &self.asset_root,
            &mut report.assets_restored,
        );
        copied.map_err(|err| report.fail(err))?;

        report.enter(RestoreStage::Done);
        Ok(report)
    }
}

/// Copy every file under `media_root` into `asset_root`, overwriting files at the same path.
fn copy_assets(
    media_root: &Path,
    asset_root: &Path,
    restored: &mut usize,
) -> Result<(), BackupError> {
    if !media_root.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(media_root) {
        let entry = entry.map_err(|err| {
            let context = format!("failed to walk {}", media_root.display());
            BackupError::io(context, err.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(media_root).map_err(|err| {
            BackupError::Structural(format!(
                "asset {} escapes the media tree: {err}",
                entry.path().display()
            ))
        })?;
        let target = asset_root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| BackupError::io_at("create", parent, err))?;
        }
        fs::copy(entry.path(), &target)
            .map_err(|err| BackupError::io_at("restore asset", &target, err))?;
        *restored += 1;
    }
    Ok(())
}
