use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ModelId, PrimaryKey, Record};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store backend error: {0}")]
    Backend(String),
    #[error("record encoding error: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

/// Persistence seam used by the backup and restore pipelines.
///
/// Records are keyed by `(model, pk)`. Implementations must not enforce foreign keys across
/// records, since restores load documents whose references may point forward.
pub trait RecordStore {
    /// Every model that currently holds at least one record, sorted.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn models(&self) -> Result<Vec<ModelId>, StoreError>;

    /// All records of `model`, ordered by primary key.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read or a row cannot be decoded.
    fn records_of(&self, model: &ModelId) -> Result<Vec<Record>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn count(&self, model: &ModelId) -> Result<u64, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn contains(&self, model: &ModelId, pk: &PrimaryKey) -> Result<bool, StoreError>;

    /// Insert a record, replacing any existing record with the same key.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the write fails.
    fn upsert(&mut self, record: &Record) -> Result<UpsertOutcome, StoreError>;

    /// Insert a record only when its key is free. Returns whether it was written.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the write fails.
    fn insert_if_absent(&mut self, record: &Record) -> Result<bool, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the delete fails.
    fn delete_model(&mut self, model: &ModelId) -> Result<u64, StoreError>;

    /// Remove every record except those of `preserve`. Returns the number removed.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the delete fails.
    fn clear(&mut self, preserve: &[ModelId]) -> Result<u64, StoreError>;

    /// Set `field` on each listed record as one atomic unit: either every assignment lands or
    /// none does, and concurrent readers never see a partial rewrite.
    ///
    /// # Errors
    /// Returns [`StoreError`] when any assignment fails; the store is left unchanged.
    fn rewrite_field(
        &mut self,
        model: &ModelId,
        field: &str,
        assignments: &[(PrimaryKey, Value)],
    ) -> Result<usize, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when any model cannot be counted.
    fn total_count(&self) -> Result<u64, StoreError> {
        let mut total = 0_u64;
        for model in self.models()? {
            total += self.count(&model)?;
        }
        Ok(total)
    }
}
