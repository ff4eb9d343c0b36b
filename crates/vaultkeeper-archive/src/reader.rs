use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use vaultkeeper_core::Record;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::BackupError;
use crate::{DATA_ENTRY, MANIFEST_ENTRY, MEDIA_PREFIX};

/// Bounds applied before anything is read out of an untrusted archive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ArchiveLimits {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_uncompressed_bytes")]
    pub max_uncompressed_bytes: u64,
    #[serde(default = "default_max_compression_ratio")]
    pub max_compression_ratio: f64,
}

fn default_max_entries() -> usize {
    100_000
}

fn default_max_uncompressed_bytes() -> u64 {
    20 * 1024 * 1024 * 1024
}

fn default_max_compression_ratio() -> f64 {
    1_000.0
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_uncompressed_bytes: default_max_uncompressed_bytes(),
            max_compression_ratio: default_max_compression_ratio(),
        }
    }
}

impl ArchiveLimits {
    /// Returns a description of the first limit the archive exceeds.
    pub(crate) fn violation(
        &self,
        archive: &mut ZipArchive<File>,
    ) -> Result<Option<String>, BackupError> {
        if archive.len() > self.max_entries {
            return Ok(Some(format!(
                "archive holds {} entries, limit is {}",
                archive.len(),
                self.max_entries
            )));
        }

        let mut total_uncompressed = 0_u64;
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            total_uncompressed = total_uncompressed.saturating_add(entry.size());
            if total_uncompressed > self.max_uncompressed_bytes {
                return Ok(Some(format!(
                    "archive expands beyond {} bytes",
                    self.max_uncompressed_bytes
                )));
            }

            if entry.compressed_size() > 0 {
                #[allow(clippy::cast_precision_loss)]
                let ratio = entry.size() as f64 / entry.compressed_size() as f64;
                if ratio > self.max_compression_ratio {
                    return Ok(Some(format!(
                        "entry {} has compression ratio {ratio:.1}, limit is {:.1}",
                        entry.name(),
                        self.max_compression_ratio
                    )));
                }
            }
        }

        Ok(None)
    }
}

pub(crate) fn open_archive(path: &Path) -> Result<ZipArchive<File>, BackupError> {
    let file = File::open(path).map_err(|err| BackupError::io_at("open archive", path, err))?;
    ZipArchive::new(file).map_err(|err| {
        BackupError::Structural(format!("{} is not a readable archive: {err}", path.display()))
    })
}

pub(crate) fn has_entry(archive: &ZipArchive<File>, name: &str) -> bool {
    archive.file_names().any(|entry| entry == name)
}

pub(crate) fn read_entry(
    archive: &mut ZipArchive<File>,
    name: &str,
) -> Result<Vec<u8>, BackupError> {
    let mut entry = archive.by_name(name).map_err(|err| match err {
        ZipError::FileNotFound => {
            BackupError::Structural(format!("required entry {name} is missing"))
        }
        other => BackupError::Zip(other),
    })?;
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(|err| BackupError::io(format!("failed to read archive entry {name}"), err))?;
    Ok(bytes)
}

/// Names of the file entries under `media/`.
pub(crate) fn media_entries(archive: &ZipArchive<File>) -> Vec<String> {
    archive
        .file_names()
        .filter(|name| name.starts_with(MEDIA_PREFIX) && !name.ends_with('/'))
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_record_document(bytes: &[u8]) -> Result<Vec<Record>, BackupError> {
    serde_json::from_slice(bytes).map_err(|err| {
        BackupError::Structural(format!("{DATA_ENTRY} is not a valid record document: {err}"))
    })
}

/// Read the record document straight out of an archive.
pub(crate) fn read_record_document(
    archive: &mut ZipArchive<File>,
) -> Result<Vec<Record>, BackupError> {
    let bytes = read_entry(archive, DATA_ENTRY)?;
    parse_record_document(&bytes)
}

/// Archive contents unpacked into a scratch directory.
#[derive(Debug)]
pub(crate) struct ExtractedArchive {
    pub data_path: PathBuf,
    pub media_root: PathBuf,
    pub files: usize,
}

impl ExtractedArchive {
    pub(crate) fn records(&self) -> Result<Vec<Record>, BackupError> {
        let file = File::open(&self.data_path)
            .map_err(|err| BackupError::io_at("open extracted", &self.data_path, err))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            BackupError::Structural(format!("{DATA_ENTRY} is not a valid record document: {err}"))
        })
    }
}

pub(crate) fn extract_to(
    archive: &mut ZipArchive<File>,
    target_dir: &Path,
) -> Result<ExtractedArchive, BackupError> {
    fs::create_dir_all(target_dir).map_err(|err| BackupError::io_at("create", target_dir, err))?;
    let mut files = 0_usize;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(BackupError::Structural(format!(
                "archive entry {} escapes the extraction directory",
                entry.name()
            )));
        };
        let out_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|err| BackupError::io_at("create", &out_path, err))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|err| BackupError::io_at("create", parent, err))?;
        }
        let mut out_file =
            File::create(&out_path).map_err(|err| BackupError::io_at("create", &out_path, err))?;
        std::io::copy(&mut entry, &mut out_file)
            .map_err(|err| BackupError::io_at("extract", &out_path, err))?;
        files += 1;
        debug!(entry = %out_path.display(), "extracted archive entry");
    }

    let data_path = target_dir.join(DATA_ENTRY);
    if !data_path.is_file() {
        return Err(BackupError::Structural(format!("required entry {DATA_ENTRY} is missing")));
    }
    if !target_dir.join(MANIFEST_ENTRY).is_file() {
        return Err(BackupError::Structural(format!("required entry {MANIFEST_ENTRY} is missing")));
    }

    Ok(ExtractedArchive {
        data_path,
        media_root: target_dir.join(MEDIA_PREFIX.trim_end_matches('/')),
        files,
    })
}
