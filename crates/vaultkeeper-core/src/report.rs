use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;
use crate::model::{ModelId, PrimaryKey};

/// A child record whose foreign key names a parent that could not be found.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FkViolation {
    pub model: ModelId,
    pub pk: PrimaryKey,
    pub field: String,
    pub target_model: ModelId,
    pub target_pk: PrimaryKey,
}

/// Outcome of a validation pass.
///
/// Checks accumulate messages here instead of raising. `success` mirrors `errors.is_empty()`
/// and is refreshed by [`ValidationResult::finish`]. Warnings are stored in full; callers
/// cap them for display with [`ValidationResult::warnings_capped`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub info: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Manifest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fk_violations: Vec<FkViolation>,
}

/// Head of a message list plus how many entries were left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CappedList<'a> {
    pub shown: &'a [String],
    pub remaining: usize,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    #[must_use]
    pub fn new() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            info: Vec::new(),
            statistics: None,
            metadata: None,
            fk_violations: Vec::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.success = false;
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.info.push(message.into());
    }

    #[must_use]
    pub fn finish(mut self) -> Self {
        self.success = self.errors.is_empty();
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    #[must_use]
    pub fn warnings_capped(&self, limit: usize) -> CappedList<'_> {
        cap(&self.warnings, limit)
    }

    #[must_use]
    pub fn info_capped(&self, limit: usize) -> CappedList<'_> {
        cap(&self.info, limit)
    }
}

fn cap(messages: &[String], limit: usize) -> CappedList<'_> {
    let shown = &messages[..messages.len().min(limit)];
    CappedList {
        shown,
        remaining: messages.len() - shown.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_tracks_error_list() {
        let mut result = ValidationResult::new();
        result.warn("dangling reference");
        result.note("12 records");
        assert!(result.is_success());
        assert!(result.clone().finish().success);

        result.error("required FK missing");
        let finished = result.finish();
        assert!(!finished.success);
        assert_eq!(finished.errors.len(), 1);
    }

    #[test]
    fn warnings_are_capped_for_display_but_kept_in_full() {
        let mut result = ValidationResult::new();
        for index in 0..25 {
            result.warn(format!("warning {index}"));
        }
        let capped = result.warnings_capped(10);
        assert_eq!(capped.shown.len(), 10);
        assert_eq!(capped.remaining, 15);
        assert_eq!(result.warnings.len(), 25);

        let all = result.warnings_capped(100);
        assert_eq!(all.remaining, 0);
    }
}
