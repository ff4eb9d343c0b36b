//! Shared vocabulary for the vaultkeeper backup and restore pipelines: records, manifests,
//! validation results, the schema registry, and the record store seam.

mod identifiers;
mod manifest;
mod model;
mod report;
mod schema;
mod store;

pub use identifiers::{
    plan_renumbering, CompiledScheme, EntityIdentity, IdentifierScheme, RenumberPlan,
};
pub use manifest::{
    EngineInfo, FkIntegrity, Manifest, MediaSummary, ValidationSummary, BACKUP_FORMAT_VERSION,
    REQUIRED_MANIFEST_FIELDS,
};
pub use model::{ModelId, PrimaryKey, Record};
pub use report::{CappedList, FkViolation, ValidationResult};
pub use schema::{
    BusinessEntity, ForwardReference, OrphanCheck, Relation, RequiredFields, SchemaRegistry,
};
pub use store::{RecordStore, StoreError, UpsertOutcome};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("schema error: {0}")]
    Schema(String),
}
