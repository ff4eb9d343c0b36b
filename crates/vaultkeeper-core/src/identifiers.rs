use std::cmp::Ordering;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::model::{PrimaryKey, Record};
use crate::CoreError;

/// Canonical and legacy management identifier formats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifierScheme {
    #[serde(default = "default_canonical_pattern")]
    pub canonical_pattern: String,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_legacy_patterns")]
    pub legacy_patterns: Vec<String>,
}

fn default_canonical_pattern() -> String {
    r"^\d{6}$".to_string()
}

fn default_width() -> usize {
    6
}

fn default_legacy_patterns() -> Vec<String> {
    vec![
        r"^M25\d{4}$".to_string(),
        r"^P25\d{4}$".to_string(),
        r"^\d{8}$".to_string(),
        r"^\d{2}-\d{6}$".to_string(),
    ]
}

impl Default for IdentifierScheme {
    fn default() -> Self {
        Self {
            canonical_pattern: default_canonical_pattern(),
            width: default_width(),
            legacy_patterns: default_legacy_patterns(),
        }
    }
}

impl IdentifierScheme {
    /// Compile the configured patterns.
    ///
    /// # Errors
    /// Returns [`CoreError::Schema`] when a pattern does not compile or the width is zero.
    pub fn compile(&self) -> Result<CompiledScheme, CoreError> {
        if self.width == 0 {
            return Err(CoreError::Schema("identifier width must be at least 1".to_string()));
        }
        let canonical = compile_pattern(&self.canonical_pattern)?;
        let legacy = self
            .legacy_patterns
            .iter()
            .map(|pattern| compile_pattern(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledScheme {
            canonical,
            legacy,
            width: self.width,
        })
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, CoreError> {
    Regex::new(pattern)
        .map_err(|err| CoreError::Schema(format!("invalid identifier pattern `{pattern}`: {err}")))
}

#[derive(Debug, Clone)]
pub struct CompiledScheme {
    canonical: Regex,
    legacy: Vec<Regex>,
    width: usize,
}

impl CompiledScheme {
    #[must_use]
    pub fn is_canonical(&self, identifier: &str) -> bool {
        self.canonical.is_match(identifier)
    }

    /// A non-empty identifier that is not canonical but matches a known legacy format.
    #[must_use]
    pub fn is_legacy(&self, identifier: &str) -> bool {
        if identifier.is_empty() || self.is_canonical(identifier) {
            return false;
        }
        self.legacy
            .iter()
            .any(|pattern| pattern.is_match(identifier))
    }

    #[must_use]
    pub fn format(&self, position: usize) -> String {
        format!("{position:0width$}", width = self.width)
    }
}

/// The slice of a business entity the planner needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdentity {
    pub pk: PrimaryKey,
    pub created_at: Option<String>,
    pub identifier: Option<String>,
}

impl EntityIdentity {
    #[must_use]
    pub fn from_record(record: &Record, identifier_field: &str, created_at_field: &str) -> Self {
        let identifier = match record.field(identifier_field) {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Number(number)) => Some(number.to_string()),
            _ => None,
        };
        let created_at = match record.field(created_at_field) {
            Some(Value::String(text)) => Some(text.clone()),
            _ => None,
        };
        Self {
            pk: record.pk.clone(),
            created_at,
            identifier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenumberPlan {
    /// Entities whose identifier matched a legacy format.
    pub legacy_detected: usize,
    /// New identifiers, in creation order, for entities whose identifier changes.
    pub assignments: Vec<(PrimaryKey, String)>,
}

impl RenumberPlan {
    #[must_use]
    pub fn converted(&self) -> usize {
        self.assignments.len()
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum CreationStamp {
    Missing,
    Parsed(OffsetDateTime),
    Raw(String),
}

impl CreationStamp {
    fn of(value: Option<&str>) -> Self {
        match value {
            None => Self::Missing,
            Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
                .map_or_else(|_| Self::Raw(raw.to_string()), Self::Parsed),
        }
    }
}

/// Plan canonical identifiers for every business entity.
///
/// Entities are ordered by creation time, ties broken by primary key. Nothing changes unless at
/// least one entity carries a legacy identifier; once one does, every entity is renumbered from 1
/// in creation order, including entities whose identifier was already canonical.
#[must_use]
pub fn plan_renumbering(entities: &[EntityIdentity], scheme: &CompiledScheme) -> RenumberPlan {
    let legacy_detected = entities
        .iter()
        .filter_map(|entity| entity.identifier.as_deref())
        .filter(|identifier| scheme.is_legacy(identifier))
        .count();
    if legacy_detected == 0 {
        return RenumberPlan::default();
    }

    let mut ordered: Vec<(CreationStamp, &EntityIdentity)> = entities
        .iter()
        .map(|entity| (CreationStamp::of(entity.created_at.as_deref()), entity))
        .collect();
    ordered.sort_by(|(left_stamp, left), (right_stamp, right)| {
        match left_stamp.cmp(right_stamp) {
            Ordering::Equal => left.pk.cmp(&right.pk),
            other => other,
        }
    });

    let assignments = ordered
        .into_iter()
        .enumerate()
        .filter_map(|(index, (_, entity))| {
            let next = scheme.format(index + 1);
            (entity.identifier.as_deref() != Some(next.as_str()))
                .then(|| (entity.pk.clone(), next))
        })
        .collect();

    RenumberPlan {
        legacy_detected,
        assignments,
    }
}
