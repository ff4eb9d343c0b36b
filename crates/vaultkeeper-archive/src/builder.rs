use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use vaultkeeper_core::{
    EngineInfo, FkIntegrity, Manifest, MediaSummary, ModelId, Record, RecordStore, SchemaRegistry,
    ValidationSummary, BACKUP_FORMAT_VERSION,
};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::error::BackupError;
use crate::integrity::scan_store;
use crate::{DATA_ENTRY, MANIFEST_ENTRY, MEDIA_PREFIX};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub output: PathBuf,
    pub include_assets: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub path: PathBuf,
    pub archive_bytes: u64,
    pub sha256: String,
    pub manifest: Manifest,
}

/// An asset file and the path it is stored under inside `media/`.
struct AssetFile {
    source: PathBuf,
    relative: String,
    size: u64,
}

/// Exports the live store and asset tree into one archive.
pub struct ArchiveBuilder<'a, S: ?Sized> {
    store: &'a S,
    registry: &'a SchemaRegistry,
    engine: &'a EngineInfo,
    asset_root: Option<PathBuf>,
}

impl<'a, S: RecordStore + ?Sized> ArchiveBuilder<'a, S> {
    pub fn new(store: &'a S, registry: &'a SchemaRegistry, engine: &'a EngineInfo) -> Self {
        Self {
            store,
            registry,
            engine,
            asset_root: None,
        }
    }

    #[must_use]
    pub fn with_asset_root(mut self, asset_root: impl Into<PathBuf>) -> Self {
        self.asset_root = Some(asset_root.into());
        self
    }

    /// Validate, dump, and package the store into `options.output`.
    ///
    /// The archive is written next to the target as `<output>.partial` and renamed into place
    /// only once complete.
    ///
    /// # Errors
    /// Returns [`BackupError::Integrity`] with the validator's errors when the store fails
    /// validation or when the dumped records disagree with the validator's per-model counts,
    /// [`BackupError::Structural`] when an asset path is not valid UTF-8, and
    /// [`BackupError::Resource`] or [`BackupError::Zip`] when writing fails.
    /// No file is left at `options.output` on failure.
    pub fn build(&self, options: &BuildOptions) -> Result<BuildSummary, BackupError> {
        let mut scan = scan_store(self.store, self.registry);
        if !scan.result.success {
            warn!(
                errors = scan.result.errors.len(),
                "store validation failed; backup aborted"
            );
            return Err(BackupError::Integrity(scan.result.errors));
        }

        let statistics = scan.result.statistics.take().ok_or_else(|| {
            BackupError::Integrity(vec!["validator produced no per-model counts".to_string()])
        })?;
        let (records, models) = self.dump_records(statistics)?;
        let total_records = records.len() as u64;
        let counted: u64 = models.values().sum();
        if counted != total_records {
            warn!(
                counted,
                dumped = total_records,
                "record counts disagree; backup aborted"
            );
            return Err(BackupError::Integrity(vec![format!(
                "validator counted {counted} records but {total_records} were dumped"
            )]));
        }

        let assets = if options.include_assets {
            self.collect_assets()?
        } else {
            Vec::new()
        };
        let asset_bytes: u64 = assets.iter().map(|asset| asset.size).sum();

        let manifest = Manifest {
            backup_version: BACKUP_FORMAT_VERSION.to_string(),
            created_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            django_version: self.engine.schema_version.clone(),
            database_engine: self.engine.database_engine.clone(),
            total_records,
            models,
            validation: ValidationSummary {
                fk_integrity: FkIntegrity::Passed,
                orphaned_records: scan.orphaned_records,
                warnings: scan.result.warnings,
            },
            media_files: MediaSummary::from_bytes(
                assets.len() as u64,
                asset_bytes,
                options.include_assets,
            ),
        };

        if let Some(parent) = options
            .output
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            fs::create_dir_all(parent).map_err(|err| BackupError::io_at("create", parent, err))?;
        }
        let partial = partial_path(&options.output);
        if let Err(err) = write_archive(&partial, &records, &manifest, &assets) {
            if let Err(cleanup) = fs::remove_file(&partial) {
                debug!(path = %partial.display(), error = %cleanup, "no partial archive to remove");
            }
            return Err(err);
        }
        fs::rename(&partial, &options.output)
            .map_err(|err| BackupError::io_at("finalize", &options.output, err))?;

        let (archive_bytes, sha256) = digest_file(&options.output)?;
        info!(
            path = %options.output.display(),
            records = manifest.total_records,
            models = manifest.model_count(),
            assets = manifest.media_files.count,
            archive_bytes,
            "backup archive created"
        );
        Ok(BuildSummary {
            path: options.output.clone(),
            archive_bytes,
            sha256,
            manifest,
        })
    }

    /// Dump every non-ephemeral model the validator counted, keeping its count for the manifest.
    fn dump_records(
        &self,
        statistics: BTreeMap<String, u64>,
    ) -> Result<(Vec<Record>, BTreeMap<String, u64>), BackupError> {
        let mut records = Vec::new();
        let mut models = BTreeMap::new();
        for (label, count) in statistics {
            let model = ModelId::parse(&label)?;
            if self.registry.is_ephemeral(&model) {
                debug!(model = %model, "skipping ephemeral model");
                continue;
            }
            let batch = self.store.records_of(&model)?;
            debug!(model = %model, records = batch.len(), "dumped model");
            records.extend(batch);
            models.insert(label, count);
        }
        Ok((records, models))
    }

    fn collect_assets(&self) -> Result<Vec<AssetFile>, BackupError> {
        let Some(root) = self.asset_root.as_deref() else {
            return Ok(Vec::new());
        };
        if !root.is_dir() {
            debug!(root = %root.display(), "asset root does not exist; no assets to bundle");
            return Ok(Vec::new());
        }

        let mut assets = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                let context = format!("failed to walk asset root {}", root.display());
                BackupError::io(context, err.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = asset_name(root, entry.path())?;
            let size = entry
                .metadata()
                .map_err(|err| {
                    let context = format!("failed to stat {}", entry.path().display());
                    BackupError::io(context, err.into())
                })?
                .len();
            assets.push(AssetFile {
                source: entry.path().to_path_buf(),
                relative,
                size,
            });
        }
        Ok(assets)
    }
}

/// `/`-separated name of `path` below `root`, as stored under `media/`.
fn asset_name(root: &Path, path: &Path) -> Result<String, BackupError> {
    let relative = path.strip_prefix(root).map_err(|err| {
        BackupError::Structural(format!(
            "asset {} is outside the asset root: {err}",
            path.display()
        ))
    })?;
    let mut parts = Vec::new();
    for part in relative.components() {
        let Some(part) = part.as_os_str().to_str() else {
            return Err(BackupError::Structural(format!(
                "asset path is not valid UTF-8: {}",
                path.display()
            )));
        };
        parts.push(part);
    }
    Ok(parts.join("/"))
}

fn write_archive(
    path: &Path,
    records: &[Record],
    manifest: &Manifest,
    assets: &[AssetFile],
) -> Result<(), BackupError> {
    let file = File::create(path).map_err(|err| BackupError::io_at("create", path, err))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file(DATA_ENTRY, options)?;
    serde_json::to_writer_pretty(&mut zip, records)?;

    zip.start_file(MANIFEST_ENTRY, options)?;
    serde_json::to_writer_pretty(&mut zip, manifest)?;

    for asset in assets {
        let name = format!("{MEDIA_PREFIX}{}", asset.relative);
        zip.start_file(
            name.as_str(),
            options.large_file(asset.size >= u64::from(u32::MAX)),
        )?;
        let mut source = File::open(&asset.source)
            .map_err(|err| BackupError::io_at("open asset", &asset.source, err))?;
        io::copy(&mut source, &mut zip)
            .map_err(|err| BackupError::io_at("archive asset", &asset.source, err))?;
    }

    zip.finish()?;
    Ok(())
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

fn digest_file(path: &Path) -> Result<(u64, String), BackupError> {
    let mut file = File::open(path).map_err(|err| BackupError::io_at("open", path, err))?;
    let mut hasher = Sha256::new();
    let bytes =
        io::copy(&mut file, &mut hasher).map_err(|err| BackupError::io_at("hash", path, err))?;
    Ok((bytes, hex::encode(hasher.finalize())))
}

/// Timestamped archive path in `dir`, e.g. `backup_20250101_093000.zip`.
///
/// A `_2`, `_3`, ... suffix is appended when a file of that name already exists.
#[must_use]
pub fn archive_file_name(dir: &Path, prefix: &str, now: OffsetDateTime) -> PathBuf {
    let stamp = format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    );
    let candidate = dir.join(format!("{prefix}_{stamp}.zip"));
    if !candidate.exists() {
        return candidate;
    }
    (2_u32..)
        .map(|attempt| dir.join(format!("{prefix}_{stamp}_{attempt}.zip")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
