//! Two-phase selective restore: tabulate what an uploaded archive holds, then load a chosen
//! subset of its models. No identifier renumbering and no asset restore happen on this path.
//!
//! Uploads are staged under a token so the archive survives between the two phases; the
//! staged file is discarded once the restore finishes, successfully or not.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;
use vaultkeeper_core::{CoreError, ModelId, RecordStore, SchemaRegistry};

use crate::error::{BackupError, RestoreStage};
use crate::loader::{load_records, ImportMode, LoadTally};
use crate::lock::RestoreLock;
use crate::reader::{open_archive, read_record_document, ArchiveLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadToken(Ulid);

impl UploadToken {
    fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for UploadToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UploadToken {
    type Err = BackupError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|_| BackupError::UnknownUpload(raw.to_string()))
    }
}

/// Archives staged between analysis and selective restore, keyed by token.
#[derive(Debug)]
pub struct UploadRegistry {
    staging_dir: PathBuf,
    limits: ArchiveLimits,
    uploads: Mutex<HashMap<UploadToken, PathBuf>>,
}

impl UploadRegistry {
    pub fn new(staging_dir: impl Into<PathBuf>, limits: ArchiveLimits) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            limits,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    /// Copy an archive file into staging.
    ///
    /// # Errors
    /// Returns [`BackupError::Resource`] when the file cannot be read or staged.
    pub fn stage_file(&self, source: &Path) -> Result<UploadToken, BackupError> {
        let mut file =
            File::open(source).map_err(|err| BackupError::io_at("open upload", source, err))?;
        self.stage_reader(&mut file)
    }

    /// Stream an uploaded archive into staging.
    ///
    /// # Errors
    /// Returns [`BackupError::Resource`] when the staged copy cannot be written.
    pub fn stage_reader(&self, reader: &mut dyn Read) -> Result<UploadToken, BackupError> {
        fs::create_dir_all(&self.staging_dir)
            .map_err(|err| BackupError::io_at("create", &self.staging_dir, err))?;
        let token = UploadToken::generate();
        let path = self.staging_dir.join(format!("upload_{token}.zip"));

        let mut staged =
            File::create(&path).map_err(|err| BackupError::io_at("create", &path, err))?;
        if let Err(err) = io::copy(reader, &mut staged) {
            drop(staged);
            remove_quietly(&path);
            return Err(BackupError::io_at("stage upload", &path, err));
        }

        debug!(%token, path = %path.display(), "staged upload");
        self.uploads.lock().insert(token, path);
        Ok(token)
    }

    /// # Errors
    /// Returns [`BackupError::UnknownUpload`] for a token that was never issued or is discarded.
    pub fn path_of(&self, token: UploadToken) -> Result<PathBuf, BackupError> {
        self.uploads
            .lock()
            .get(&token)
            .cloned()
            .ok_or_else(|| BackupError::UnknownUpload(token.to_string()))
    }

    /// Forget a staged upload and delete its file. Returns whether the token was known.
    pub fn discard(&self, token: UploadToken) -> bool {
        let Some(path) = self.uploads.lock().remove(&token) else {
            return false;
        };
        remove_quietly(&path);
        debug!(%token, "discarded staged upload");
        true
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.uploads.lock().len()
    }

    #[must_use]
    pub fn limits(&self) -> &ArchiveLimits {
        &self.limits
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %err, "failed to remove staged upload");
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArchiveAnalysis {
    pub total_records: u64,
    pub models: BTreeMap<String, u64>,
    /// Display grouping: category -> model -> count
    pub categories: BTreeMap<String, BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SelectiveReport {
    pub selected: Vec<ModelId>,
    pub mode: ImportMode,
    pub records_loaded: usize,
    pub records_inserted: usize,
    pub records_replaced: usize,
    pub records_skipped: usize,
    pub per_model: BTreeMap<String, u64>,
    /// Selected models with no records in the archive
    pub absent_models: Vec<ModelId>,
}

/// Count the records of each model in an archive. Never touches the store.
///
/// # Errors
/// Returns [`BackupError::Structural`] when the archive is unreadable, exceeds `limits`, or its
/// record document is malformed, and [`BackupError::Resource`] when the file cannot be opened.
pub fn analyze_archive(
    path: &Path,
    registry: &SchemaRegistry,
    limits: &ArchiveLimits,
) -> Result<ArchiveAnalysis, BackupError> {
    let mut archive = open_archive(path)?;
    if let Some(violation) = limits.violation(&mut archive)? {
        return Err(BackupError::Structural(format!("archive rejected: {violation}")));
    }
    let records = read_record_document(&mut archive)?;

    let mut models: BTreeMap<String, u64> = BTreeMap::new();
    let mut categories: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for record in &records {
        *models.entry(record.model.to_string()).or_default() += 1;
        *categories
            .entry(registry.category_of(&record.model))
            .or_default()
            .entry(record.model.to_string())
            .or_default() += 1;
    }

    info!(
        archive = %path.display(),
        records = records.len(),
        models = models.len(),
        "analyzed archive"
    );
    Ok(ArchiveAnalysis {
        total_records: records.len() as u64,
        models,
        categories,
    })
}

/// Load only the records of `selected` models from a staged upload, then discard the upload.
///
/// # Errors
/// - [`BackupError::UnknownUpload`] when `token` is not staged.
/// - [`BackupError::Schema`] when the selection is empty or names an undeclared model.
/// - [`BackupError::RestoreInProgress`] when a restore holds the lock in `lock_dir`.
/// - [`BackupError::StageFailed`] when loading fails part way, with the records loaded so far.
pub fn restore_selected<S: RecordStore + ?Sized>(
    store: &mut S,
    registry: &SchemaRegistry,
    uploads: &UploadRegistry,
    token: UploadToken,
    selected: &[ModelId],
    mode: ImportMode,
    lock_dir: &Path,
) -> Result<SelectiveReport, BackupError> {
    let path = uploads.path_of(token)?;
    let outcome = load_selection(
        store,
        registry,
        &path,
        uploads.limits(),
        selected,
        mode,
        lock_dir,
    );
    uploads.discard(token);
    outcome
}

fn load_selection<S: RecordStore + ?Sized>(
    store: &mut S,
    registry: &SchemaRegistry,
    path: &Path,
    limits: &ArchiveLimits,
    selected: &[ModelId],
    mode: ImportMode,
    lock_dir: &Path,
) -> Result<SelectiveReport, BackupError> {
    if selected.is_empty() {
        let reason = "select at least one model to restore".to_string();
        return Err(CoreError::Validation(reason).into());
    }
    if let Some(unknown) = selected.iter().find(|model| !registry.is_known(model)) {
        let reason = format!("cannot restore undeclared model {unknown}");
        return Err(CoreError::Validation(reason).into());
    }

    let _lock = RestoreLock::acquire(lock_dir, "selective_restore")?;
    let wanted: BTreeSet<&ModelId> = selected.iter().collect();

    let mut archive = open_archive(path)?;
    if let Some(violation) = limits.violation(&mut archive)? {
        return Err(BackupError::Structural(format!("archive rejected: {violation}")));
    }
    let records = read_record_document(&mut archive)?;
    let subset: Vec<_> = records
        .iter()
        .filter(|record| wanted.contains(&record.model))
        .collect();

    let mut per_model: BTreeMap<String, u64> = BTreeMap::new();
    for record in &subset {
        *per_model.entry(record.model.to_string()).or_default() += 1;
    }
    let absent_models: Vec<ModelId> = selected
        .iter()
        .filter(|model| !per_model.contains_key(model.as_str()))
        .cloned()
        .collect();

    info!(
        selected = selected.len(),
        records = subset.len(),
        mode = mode.as_str(),
        "selective restore"
    );
    let mut tally = LoadTally::default();
    if let Err(err) = load_records(store, subset.iter().copied(), mode, &mut tally) {
        warn!(records_loaded = tally.loaded, error = %err, "selective restore failed part way");
        return Err(BackupError::StageFailed {
            stage: RestoreStage::ExtractAndLoad,
            records_loaded: tally.loaded,
            assets_restored: 0,
            source: Box::new(err),
        });
    }

    Ok(SelectiveReport {
        selected: selected.to_vec(),
        mode,
        records_loaded: tally.loaded,
        records_inserted: tally.inserted,
        records_replaced: tally.replaced,
        records_skipped: tally.skipped_existing,
        per_model,
        absent_models,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ArchiveBuilder, BuildOptions};
    use crate::error::ErrorKind;
    use crate::testutil::{empty_store, engine, model, rec, registry, seeded_store};
    use anyhow::{anyhow, Result};
    use serde_json::json;
    use tempfile::TempDir;
    use vaultkeeper_core::{PrimaryKey, Record};

    /// 20 customers, 15 coupons, 15 notes.
    fn fifty_records() -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for pk in 1..=20 {
            let name = format!("Customer {pk}");
            records.push(rec("shop.customer", pk, json!({"name": name}))?);
        }
        for pk in 1..=15 {
            records.push(rec("shop.coupon", pk, json!({"code": format!("SAVE{pk}")}))?);
            records.push(rec("shop.note", pk, json!({"body": format!("note {pk}")}))?);
        }
        Ok(records)
    }

    fn staged(dir: &TempDir) -> Result<(UploadRegistry, UploadToken)> {
        let source = seeded_store(&fifty_records()?)?;
        let registry = registry()?;
        let engine = engine();
        let archive = dir.path().join("upload.zip");
        let options = BuildOptions {
            output: archive.clone(),
            include_assets: false,
        };
        ArchiveBuilder::new(&source, &registry, &engine).build(&options)?;

        let uploads = UploadRegistry::new(dir.path().join("staging"), ArchiveLimits::default());
        let token = uploads.stage_file(&archive)?;
        Ok((uploads, token))
    }

    #[test]
    fn analysis_groups_counts_by_category() -> Result<()> {
        let dir = TempDir::new()?;
        let (uploads, token) = staged(&dir)?;

        let analysis = analyze_archive(&uploads.path_of(token)?, &registry()?, uploads.limits())?;
        assert_eq!(analysis.total_records, 50);
        assert_eq!(analysis.models.get("shop.customer"), Some(&20));
        assert_eq!(analysis.categories["customers"]["shop.customer"], 20);
        assert_eq!(analysis.categories["sales"]["shop.coupon"], 15);
        assert_eq!(analysis.categories["shop"]["shop.note"], 15);
        assert_eq!(uploads.pending(), 1);
        Ok(())
    }

    #[test]
    fn only_selected_model_is_loaded() -> Result<()> {
        let dir = TempDir::new()?;
        let (uploads, token) = staged(&dir)?;
        let staged_path = uploads.path_of(token)?;
        let mut target = seeded_store(&[
            rec("shop.customer", 1, json!({"name": "Local Customer"}))?,
            rec("shop.note", 900, json!({"body": "local note"}))?,
        ])?;

        let report = restore_selected(
            &mut target,
            &registry()?,
            &uploads,
            token,
            &[model("shop.coupon")?],
            ImportMode::Overwrite,
            &dir.path().join("locks"),
        )?;

        assert_eq!(report.records_loaded, 15);
        assert_eq!(report.per_model.get("shop.coupon"), Some(&15));
        assert!(report.absent_models.is_empty());
        assert_eq!(target.count(&model("shop.coupon")?)?, 15);
        assert_eq!(target.count(&model("shop.customer")?)?, 1);
        assert_eq!(target.count(&model("shop.note")?)?, 1);
        let customers = target.records_of(&model("shop.customer")?)?;
        assert_eq!(customers[0].field("name"), Some(&json!("Local Customer")));

        assert_eq!(uploads.pending(), 0);
        assert!(!staged_path.exists());
        Ok(())
    }

    #[test]
    fn skip_existing_keeps_local_records() -> Result<()> {
        let dir = TempDir::new()?;
        let (uploads, token) = staged(&dir)?;
        let local = rec("shop.customer", 1, json!({"name": "Local Customer"}))?;
        let mut target = seeded_store(&[local])?;

        let report = restore_selected(
            &mut target,
            &registry()?,
            &uploads,
            token,
            &[model("shop.customer")?, model("shop.project")?],
            ImportMode::SkipExisting,
            &dir.path().join("locks"),
        )?;

        assert_eq!(report.records_inserted, 19);
        assert_eq!(report.records_skipped, 1);
        assert_eq!(report.absent_models, vec![model("shop.project")?]);
        let first = target.records_of(&model("shop.customer")?)?;
        assert_eq!(first[0].pk, PrimaryKey::Int(1));
        assert_eq!(first[0].field("name"), Some(&json!("Local Customer")));
        Ok(())
    }

    #[test]
    fn failed_restore_still_discards_upload() -> Result<()> {
        let dir = TempDir::new()?;
        let (uploads, token) = staged(&dir)?;
        let staged_path = uploads.path_of(token)?;
        let mut target = empty_store()?;

        let Err(err) = restore_selected(
            &mut target,
            &registry()?,
            &uploads,
            token,
            &[model("legacy.widget")?],
            ImportMode::Overwrite,
            &dir.path().join("locks"),
        ) else {
            return Err(anyhow!("undeclared model should be rejected"));
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!staged_path.exists());

        let Err(err) = uploads.path_of(token) else {
            return Err(anyhow!("token should be gone after restore"));
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(target.total_count()?, 0);
        Ok(())
    }

    #[test]
    fn tokens_parse_from_their_display_form() -> Result<()> {
        let dir = TempDir::new()?;
        let (uploads, token) = staged(&dir)?;
        let parsed: UploadToken = token.to_string().parse()?;
        assert_eq!(parsed, token);
        assert!("not-a-token".parse::<UploadToken>().is_err());
        assert!(uploads.discard(parsed));
        assert!(!uploads.discard(parsed));
        Ok(())
    }
}
