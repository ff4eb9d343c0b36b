use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vaultkeeper_core::{Record, RecordStore, SchemaRegistry, UpsertOutcome};

use crate::error::BackupError;

/// How a loaded record interacts with an existing record that has the same key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    #[default]
    Overwrite,
    SkipExisting,
}

impl ImportMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::SkipExisting => "skip_existing",
        }
    }
}

/// Running totals for one load; kept up to date record by record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct LoadTally {
    pub loaded: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub skipped_existing: usize,
}

/// Reject the whole document if any record names a model the registry does not declare.
pub(crate) fn ensure_known_models(
    records: &[Record],
    registry: &SchemaRegistry,
) -> Result<(), BackupError> {
    let unknown: BTreeSet<&str> = records
        .iter()
        .filter(|record| !registry.is_known(&record.model))
        .map(|record| record.model.as_str())
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    Err(BackupError::Structural(format!(
        "archive contains records of unknown models: {}",
        unknown.into_iter().collect::<Vec<_>>().join(", ")
    )))
}

/// Write `records` into the store. `tally` reflects every record written before a failure.
pub(crate) fn load_records<'r, S, I>(
    store: &mut S,
    records: I,
    mode: ImportMode,
    tally: &mut LoadTally,
) -> Result<(), BackupError>
where
    S: RecordStore + ?Sized,
    I: IntoIterator<Item = &'r Record>,
{
    for record in records {
        match mode {
            ImportMode::Overwrite => match store.upsert(record)? {
                UpsertOutcome::Inserted => tally.inserted += 1,
                UpsertOutcome::Replaced => tally.replaced += 1,
            },
            ImportMode::SkipExisting => {
                if store.insert_if_absent(record)? {
                    tally.inserted += 1;
                } else {
                    tally.skipped_existing += 1;
                    debug!(model = %record.model, pk = %record.pk, "kept existing record");
                }
            }
        }
        tally.loaded += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{empty_store, rec, registry};
    use anyhow::{anyhow, Result};
    use serde_json::json;

    #[test]
    fn overwrite_replaces_and_skip_existing_keeps() -> Result<()> {
        let mut store = empty_store()?;
        let original = rec("shop.customer", 1, json!({"name": "Acme"}))?;
        let incoming = rec("shop.customer", 1, json!({"name": "Acme Renamed"}))?;
        let fresh = rec("shop.customer", 2, json!({"name": "Globex"}))?;

        let mut tally = LoadTally::default();
        load_records(&mut store, [&original], ImportMode::Overwrite, &mut tally)?;
        load_records(
            &mut store,
            [&incoming, &fresh],
            ImportMode::SkipExisting,
            &mut tally,
        )?;
        assert_eq!(
            tally,
            LoadTally {
                loaded: 3,
                inserted: 2,
                replaced: 0,
                skipped_existing: 1,
            }
        );
        let kept = store.records_of(&original.model)?;
        assert_eq!(kept[0].field("name"), Some(&json!("Acme")));

        let mut tally = LoadTally::default();
        load_records(&mut store, [&incoming], ImportMode::Overwrite, &mut tally)?;
        assert_eq!(tally.replaced, 1);
        let replaced = store.records_of(&original.model)?;
        assert_eq!(replaced[0].field("name"), Some(&json!("Acme Renamed")));
        Ok(())
    }

    #[test]
    fn unknown_models_are_listed_once() -> Result<()> {
        let records = vec![
            rec("shop.customer", 1, json!({"name": "Acme"}))?,
            rec("legacy.widget", 1, json!({}))?,
            rec("legacy.widget", 2, json!({}))?,
        ];
        let Err(err) = ensure_known_models(&records, &registry()?) else {
            return Err(anyhow!("expected unknown model rejection"));
        };
        assert_eq!(
            err.to_string(),
            "structural error: archive contains records of unknown models: legacy.widget"
        );
        Ok(())
    }
}
