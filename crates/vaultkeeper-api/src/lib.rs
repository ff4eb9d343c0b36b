//! Embeddable facade over the backup, restore and delete-all pipelines, bound to one
//! configuration. Front ends call this instead of wiring stores and builders themselves.

mod config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use vaultkeeper_archive::{
    analyze_archive, archive_file_name, delete_all, inspect_archive, renormalize_identifiers,
    restore_selected, scan_store, verification_view, ArchiveAnalysis, ArchiveBuilder, BuildOptions,
    BuildSummary, ErrorKind, ImportMode, Operator, PurgeOptions, PurgeReport, RenumberOutcome,
    RestoreEngine, RestoreOptions, RestoreReport, SelectiveReport, StoreScan, UploadRegistry,
    UploadToken, VerificationView,
};
use vaultkeeper_core::{EngineInfo, ModelId, SchemaRegistry, ValidationResult};
use vaultkeeper_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};

pub use config::{ConfigError, EnvironmentConfig, VaultConfig};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub current_version: i64,
    pub target_version: i64,
    pub applied_versions: Vec<i64>,
    pub up_to_date: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackupRequest {
    /// Archive path; a timestamped name in the backup directory when absent
    pub output: Option<PathBuf>,
    pub include_assets: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerifyOutcome {
    pub archive: PathBuf,
    pub result: ValidationResult,
    /// Category of the check that rejected the archive
    pub failure: Option<ErrorKind>,
    pub view: VerificationView,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeleteAllRequest {
    pub force: bool,
    pub skip_backup: bool,
    pub skip_backup_on_failure: bool,
    pub confirmation: Option<String>,
}

pub struct VaultApi {
    config: VaultConfig,
    registry: SchemaRegistry,
    engine: EngineInfo,
    uploads: UploadRegistry,
}

impl VaultApi {
    /// # Errors
    /// Returns an error when the config is invalid or the schema registry cannot be loaded.
    pub fn new(config: VaultConfig) -> Result<Self> {
        config.validate().context("invalid vaultkeeper config")?;
        let registry = config
            .load_registry()
            .context("failed to load schema registry")?;
        let engine = config.environment.engine_info();
        let uploads = UploadRegistry::new(config.staging_dir(), config.limits);
        Ok(Self {
            config,
            registry,
            engine,
            uploads,
        })
    }

    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.config.database)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteStore::open(&self.config.database)?.schema_status()
    }

    /// # Errors
    /// Returns an error when a migration step fails.
    pub fn migrate(&self) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.config.database)?;
        let before = store.schema_status()?;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            current_version: after.current_version,
            target_version: after.target_version,
            applied_versions: before.pending_versions,
            up_to_date: after.pending_versions.is_empty(),
        })
    }

    /// # Errors
    /// Returns an error when the health checks cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        SqliteStore::open(&self.config.database)?.integrity_check()
    }

    /// Run the pre-backup checks without writing anything.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened.
    pub fn validate_store(&self) -> Result<StoreScan> {
        let store = self.open_store()?;
        Ok(scan_store(&store, &self.registry))
    }

    /// # Errors
    /// Returns an error when the store fails validation or the archive cannot be written.
    pub fn create_backup(&self, request: &BackupRequest) -> Result<BuildSummary> {
        let store = self.open_store()?;
        let output = request.output.clone().unwrap_or_else(|| {
            archive_file_name(&self.config.backup_dir, "backup", OffsetDateTime::now_utc())
        });
        let options = BuildOptions {
            output: output.clone(),
            include_assets: request.include_assets,
        };
        let summary = ArchiveBuilder::new(&store, &self.registry, &self.engine)
            .with_asset_root(&self.config.asset_root)
            .build(&options)
            .with_context(|| format!("failed to create backup {}", output.display()))?;
        Ok(summary)
    }

    /// Validate an archive without touching the store.
    ///
    /// # Errors
    /// Returns an error when the archive file cannot be opened.
    pub fn verify_backup(&self, archive: &Path, detailed: bool) -> Result<VerifyOutcome> {
        let inspection = inspect_archive(archive, &self.engine, &self.registry, &self.config.limits)
            .with_context(|| format!("failed to verify {}", archive.display()))?;
        let view = verification_view(&inspection.result, detailed);
        Ok(VerifyOutcome {
            archive: archive.to_path_buf(),
            result: inspection.result,
            failure: inspection.failure,
            view,
        })
    }

    /// # Errors
    /// Returns an error wrapping the archive pipeline's `BackupError` when the restore fails
    /// or is aborted.
    pub fn restore_backup(
        &self,
        archive: &Path,
        options: &RestoreOptions,
        operator: &dyn Operator,
    ) -> Result<RestoreReport> {
        let mut store = self.open_store()?;
        let report = RestoreEngine::new(
            &mut store,
            &self.registry,
            &self.engine,
            &self.config.asset_root,
            &self.config.backup_dir,
        )
        .with_limits(self.config.limits)
        .restore(archive, options, operator)
        .with_context(|| format!("failed to restore {}", archive.display()))?;
        info!(stage = %report.stage_reached, records = report.records_loaded, "restore finished");
        Ok(report)
    }

    /// # Errors
    /// Returns an error when the upload cannot be copied into staging.
    pub fn stage_upload(&self, archive: &Path) -> Result<UploadToken> {
        Ok(self.uploads.stage_file(archive)?)
    }

    /// # Errors
    /// Returns an error for an unknown token or an unreadable archive.
    pub fn analyze_upload(&self, token: UploadToken) -> Result<ArchiveAnalysis> {
        let path = self.uploads.path_of(token)?;
        Ok(analyze_archive(&path, &self.registry, self.uploads.limits())?)
    }

    /// Count records per model and category in an archive on disk.
    ///
    /// # Errors
    /// Returns an error when the archive cannot be read or exceeds the configured limits.
    pub fn analyze_archive(&self, archive: &Path) -> Result<ArchiveAnalysis> {
        analyze_archive(archive, &self.registry, &self.config.limits)
            .with_context(|| format!("failed to analyze {}", archive.display()))
    }

    /// Load only `models` from a staged upload. The upload is discarded afterwards.
    ///
    /// # Errors
    /// Returns an error for an unknown token, an invalid model label, or a failed load.
    pub fn restore_selected(
        &self,
        token: UploadToken,
        models: &[String],
        mode: ImportMode,
    ) -> Result<SelectiveReport> {
        let selected = models
            .iter()
            .map(|label| ModelId::parse(label))
            .collect::<Result<Vec<_>, _>>()
            .context("invalid model selection")?;
        let mut store = self.open_store()?;
        let report = restore_selected(
            &mut store,
            &self.registry,
            &self.uploads,
            token,
            &selected,
            mode,
            &self.config.backup_dir,
        )?;
        Ok(report)
    }

    pub fn discard_upload(&self, token: UploadToken) -> bool {
        self.uploads.discard(token)
    }

    /// # Errors
    /// Returns an error when the identifier rewrite fails; the store is left unchanged.
    pub fn renumber_identifiers(&self) -> Result<RenumberOutcome> {
        let mut store = self.open_store()?;
        Ok(renormalize_identifiers(&mut store, &self.registry)?)
    }

    /// # Errors
    /// Returns an error when confirmation fails, the operator aborts, or counting fails.
    pub fn delete_all(
        &self,
        request: &DeleteAllRequest,
        operator: &dyn Operator,
    ) -> Result<PurgeReport> {
        let mut store = self.open_store()?;
        let options = PurgeOptions {
            force: request.force,
            skip_backup: request.skip_backup,
            skip_backup_on_failure: request.skip_backup_on_failure,
            confirmation: request.confirmation.clone(),
            backup_dir: self.config.backup_dir.clone(),
            asset_root: Some(self.config.asset_root.clone()),
        };
        Ok(delete_all(&mut store, &self.registry, &self.engine, &options, operator)?)
    }
}
