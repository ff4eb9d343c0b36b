use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use vaultkeeper_core::{CoreError, StoreError, ValidationResult};

/// Coarse classification used by front ends to report failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Structural,
    Integrity,
    Resource,
    OperatorAborted,
    Busy,
    Configuration,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Integrity => "integrity",
            Self::Resource => "resource",
            Self::OperatorAborted => "operator_aborted",
            Self::Busy => "busy",
            Self::Configuration => "configuration",
        }
    }
}

/// Restore state machine stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    PreCheck,
    Validate,
    ClearExisting,
    ExtractAndLoad,
    RenormalizeIdentifiers,
    RestoreAssets,
    Done,
    Aborted,
}

impl RestoreStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreCheck => "pre_check",
            Self::Validate => "validate",
            Self::ClearExisting => "clear_existing",
            Self::ExtractAndLoad => "extract_and_load",
            Self::RenormalizeIdentifiers => "renormalize_identifiers",
            Self::RestoreAssets => "restore_assets",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl Display for RestoreStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("structural error: {0}")]
    Structural(String),
    #[error("integrity error: {}", .0.join("; "))]
    Integrity(Vec<String>),
    #[error("archive validation failed: {}", .result.errors.join("; "))]
    ValidationFailed {
        kind: ErrorKind,
        result: Box<ValidationResult>,
    },
    #[error("resource error: {context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("aborted by operator: {0}")]
    OperatorAborted(String),
    #[error("restore already in progress: {0}")]
    RestoreInProgress(String),
    #[error("unknown upload token: {0}")]
    UnknownUpload(String),
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
    #[error("schema error: {0}")]
    Schema(#[from] CoreError),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{stage} failed after {records_loaded} records and {assets_restored} assets: {source}")]
    StageFailed {
        stage: RestoreStage,
        records_loaded: usize,
        assets_restored: usize,
        #[source]
        source: Box<BackupError>,
    },
}

impl BackupError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        Self::Resource {
            context: format!("failed to {action} {}", path.display()),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Structural(_) | Self::Zip(_) | Self::Json(_) => ErrorKind::Structural,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::ValidationFailed { kind, .. } => *kind,
            Self::Resource { .. } | Self::Store(_) | Self::UnknownUpload(_) => ErrorKind::Resource,
            Self::OperatorAborted(_) => ErrorKind::OperatorAborted,
            Self::RestoreInProgress(_) => ErrorKind::Busy,
            Self::Schema(_) => ErrorKind::Configuration,
            Self::StageFailed { source, .. } => source.kind(),
        }
    }

    #[must_use]
    pub fn is_operator_abort(&self) -> bool {
        self.kind() == ErrorKind::OperatorAborted
    }

    /// Validation details carried by a failed archive check, if any.
    #[must_use]
    pub fn validation(&self) -> Option<&ValidationResult> {
        match self {
            Self::ValidationFailed { result, .. } => Some(result),
            Self::StageFailed { source, .. } => source.validation(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failures_report_the_underlying_kind() {
        let inner = BackupError::io(
            "failed to copy media/a.png",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let err = BackupError::StageFailed {
            stage: RestoreStage::RestoreAssets,
            records_loaded: 12,
            assets_restored: 3,
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(!err.is_operator_abort());
        let message = err.to_string();
        assert!(message.contains("restore_assets failed after 12 records and 3 assets"));
    }

    #[test]
    fn operator_aborts_are_distinguishable() {
        let err = BackupError::OperatorAborted("warnings declined".to_string());
        assert!(err.is_operator_abort());
        assert_eq!(err.kind().as_str(), "operator_aborted");
    }
}
