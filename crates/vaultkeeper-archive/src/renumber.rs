use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use vaultkeeper_core::{plan_renumbering, EntityIdentity, PrimaryKey, RecordStore, SchemaRegistry};

use crate::error::BackupError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RenumberOutcome {
    pub examined: usize,
    pub legacy_detected: usize,
    pub renumbered: usize,
}

/// Rewrite business-entity identifiers into the canonical sequence.
///
/// Runs after every restore and on demand. All rewrites land in one store transaction, and a
/// store whose identifiers carry no legacy format is left untouched.
///
/// # Errors
/// Returns [`BackupError::Schema`] when the identifier scheme does not compile and
/// [`BackupError::Store`] when reading or rewriting the entities fails.
pub fn renormalize_identifiers<S: RecordStore + ?Sized>(
    store: &mut S,
    registry: &SchemaRegistry,
) -> Result<RenumberOutcome, BackupError> {
    let Some(entity) = &registry.business_entity else {
        debug!("no business entity declared; skipping identifier renumbering");
        return Ok(RenumberOutcome::default());
    };
    let scheme = entity.identifier.compile()?;

    let identities: Vec<EntityIdentity> = store
        .records_of(&entity.model)?
        .iter()
        .map(|record| {
            EntityIdentity::from_record(record, &entity.identifier_field, &entity.created_at_field)
        })
        .collect();
    let plan = plan_renumbering(&identities, &scheme);

    let mut outcome = RenumberOutcome {
        examined: identities.len(),
        legacy_detected: plan.legacy_detected,
        renumbered: 0,
    };
    if plan.is_noop() {
        info!(model = %entity.model, examined = outcome.examined, "identifiers already canonical");
        return Ok(outcome);
    }

    let assignments: Vec<(PrimaryKey, Value)> = plan
        .assignments
        .into_iter()
        .map(|(pk, identifier)| (pk, Value::String(identifier)))
        .collect();
    outcome.renumbered =
        store.rewrite_field(&entity.model, &entity.identifier_field, &assignments)?;

    info!(
        model = %entity.model,
        legacy_detected = outcome.legacy_detected,
        renumbered = outcome.renumbered,
        "renumbered business entity identifiers"
    );
    Ok(outcome)
}
