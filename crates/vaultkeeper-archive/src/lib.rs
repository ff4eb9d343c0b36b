//! Backup archive pipelines: store validation, archive export, archive verification,
//! full and selective restore, and the destructive delete-all workflow.
//!
//! Archives are ZIP containers holding `data.json` (the record document), `metadata.json`
//! (the manifest) and every asset under `media/`.

mod builder;
mod error;
mod integrity;
mod loader;
mod lock;
mod operator;
mod purge;
mod reader;
mod renumber;
mod restore;
mod selective;
#[cfg(test)]
mod testutil;
mod validator;
mod verify;

pub use builder::{archive_file_name, ArchiveBuilder, BuildOptions, BuildSummary};
pub use error::{BackupError, ErrorKind, RestoreStage};
pub use integrity::{scan_store, validate_store, StoreScan};
pub use loader::{ImportMode, LoadTally};
pub use lock::{LockInfo, RestoreLock};
pub use operator::{AutoApprove, Decline, Operator, Question};
pub use purge::{delete_all, PurgeOptions, PurgeReport, DELETE_CONFIRMATION_TOKEN};
pub use reader::ArchiveLimits;
pub use renumber::{renormalize_identifiers, RenumberOutcome};
pub use restore::{RestoreEngine, RestoreOptions, RestoreReport};
pub use selective::{
    analyze_archive, restore_selected, ArchiveAnalysis, SelectiveReport, UploadRegistry,
    UploadToken,
};
pub use validator::{inspect_archive, ArchiveInspection};
pub use verify::{verification_view, VerificationView};

pub const DATA_ENTRY: &str = "data.json";
pub const MANIFEST_ENTRY: &str = "metadata.json";
pub const MEDIA_PREFIX: &str = "media/";

/// Warnings and info lines shown before a rollup line.
pub const DISPLAY_LIMIT: usize = 10;
