use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const BACKUP_FORMAT_VERSION: &str = "1.0";

/// Manifest keys that must be present for an archive to be restorable.
pub const REQUIRED_MANIFEST_FIELDS: [&str; 4] = [
    "backup_version",
    "created_at",
    "django_version",
    "total_records",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FkIntegrity {
    #[default]
    Passed,
    Failed,
}

impl FkIntegrity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ValidationSummary {
    #[serde(default)]
    pub fk_integrity: FkIntegrity,
    #[serde(default)]
    pub orphaned_records: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MediaSummary {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub total_size_mb: f64,
    #[serde(default)]
    pub included: bool,
}

impl MediaSummary {
    #[must_use]
    pub fn from_bytes(count: u64, total_bytes: u64, included: bool) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let megabytes = total_bytes as f64 / (1024.0 * 1024.0);
        Self {
            count,
            total_size_mb: (megabytes * 100.0).round() / 100.0,
            included,
        }
    }
}

/// Runtime identity stamped into manifests and compared on restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineInfo {
    pub schema_version: String,
    pub database_engine: String,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub backup_version: String,
    pub created_at: String,
    pub django_version: String,
    #[serde(default)]
    pub database_engine: String,
    pub total_records: u64,
    #[serde(default)]
    pub models: BTreeMap<String, u64>,
    #[serde(default)]
    pub validation: ValidationSummary,
    #[serde(default)]
    pub media_files: MediaSummary,
}

impl Manifest {
    #[must_use]
    pub fn model_count(&self) -> usize {
        self.models.len()
    }
}
