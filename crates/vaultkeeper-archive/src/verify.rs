use serde::Serialize;
use vaultkeeper_core::ValidationResult;

use crate::DISPLAY_LIMIT;

const DETAILED_MODEL_LIMIT: usize = 20;

/// Display-ready rendering of an archive validation result.
///
/// Errors are never capped. Warnings and info are capped at [`DISPLAY_LIMIT`] unless the view is
/// detailed, in which case every warning is shown along with the largest models by record count.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VerificationView {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub warnings_omitted: usize,
    pub info: Vec<String>,
    pub info_omitted: usize,
    pub top_models: Vec<(String, u64)>,
    pub summary: String,
}

impl VerificationView {
    /// Plain-text lines in display order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.top_models.is_empty() {
            lines.push("records by model:".to_string());
            for (model, count) in &self.top_models {
                lines.push(format!("  {model}: {count}"));
            }
        }
        lines.extend(self.info.iter().map(|line| format!("info: {line}")));
        if self.info_omitted > 0 {
            lines.push(format!("info: ... and {} more", self.info_omitted));
        }
        lines.extend(self.warnings.iter().map(|line| format!("warning: {line}")));
        if self.warnings_omitted > 0 {
            lines.push(format!("warning: ... and {} more warnings", self.warnings_omitted));
        }
        lines.extend(self.errors.iter().map(|line| format!("error: {line}")));
        lines.push(self.summary.clone());
        lines
    }
}

#[must_use]
pub fn verification_view(result: &ValidationResult, detailed: bool) -> VerificationView {
    let warnings = if detailed {
        result.warnings_capped(usize::MAX)
    } else {
        result.warnings_capped(DISPLAY_LIMIT)
    };
    let info = result.info_capped(DISPLAY_LIMIT);

    let top_models = match (&result.metadata, detailed) {
        (Some(manifest), true) => {
            let mut models: Vec<(String, u64)> = manifest
                .models
                .iter()
                .map(|(model, count)| (model.clone(), *count))
                .collect();
            models.sort_by(|left, right| {
                right.1.cmp(&left.1).then_with(|| left.0.cmp(&right.0))
            });
            models.truncate(DETAILED_MODEL_LIMIT);
            models
        }
        _ => Vec::new(),
    };

    let summary = if result.is_success() {
        format!(
            "backup archive is valid ({} warnings)",
            result.warnings.len()
        )
    } else {
        format!("backup archive is INVALID ({} errors)", result.errors.len())
    };

    VerificationView {
        success: result.is_success(),
        errors: result.errors.clone(),
        warnings: warnings.shown.to_vec(),
        warnings_omitted: warnings.remaining,
        info: info.shown.to_vec(),
        info_omitted: info.remaining,
        top_models,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vaultkeeper_core::{Manifest, MediaSummary, ValidationSummary};

    fn noisy_result() -> ValidationResult {
        let mut result = ValidationResult::new();
        for index in 0..15 {
            result.warn(format!("warning {index}"));
            result.note(format!("info {index}"));
        }
        let models: BTreeMap<String, u64> = (0..25_u64)
            .map(|index| (format!("shop.model{index:02}"), index))
            .collect();
        result.metadata = Some(Manifest {
            backup_version: "1.0".to_string(),
            created_at: "2025-01-01T00:00:00Z".to_string(),
            django_version: "4.2".to_string(),
            database_engine: "sqlite".to_string(),
            total_records: models.values().sum(),
            models,
            validation: ValidationSummary::default(),
            media_files: MediaSummary::default(),
        });
        result.finish()
    }

    #[test]
    fn summary_view_caps_warnings_and_info() {
        let view = verification_view(&noisy_result(), false);
        assert!(view.success);
        assert_eq!(view.warnings.len(), DISPLAY_LIMIT);
        assert_eq!(view.warnings_omitted, 5);
        assert_eq!(view.info_omitted, 5);
        assert!(view.top_models.is_empty());

        let lines = view.lines();
        assert!(lines.contains(&"warning: ... and 5 more warnings".to_string()));
        let summary = lines.last().map(String::as_str);
        assert_eq!(summary, Some("backup archive is valid (15 warnings)"));
    }

    #[test]
    fn detailed_view_shows_all_warnings_and_largest_models() {
        let view = verification_view(&noisy_result(), true);
        assert_eq!(view.warnings.len(), 15);
        assert_eq!(view.warnings_omitted, 0);
        assert_eq!(view.info.len(), DISPLAY_LIMIT);
        assert_eq!(view.top_models.len(), DETAILED_MODEL_LIMIT);
        assert_eq!(view.top_models[0], ("shop.model24".to_string(), 24));
        assert_eq!(view.top_models[19], ("shop.model05".to_string(), 5));
    }

    #[test]
    fn errors_are_never_capped() {
        let mut result = ValidationResult::new();
        for index in 0..12 {
            result.error(format!("error {index}"));
        }
        let view = verification_view(&result.finish(), false);
        assert!(!view.success);
        assert_eq!(view.errors.len(), 12);
        assert_eq!(view.summary, "backup archive is INVALID (12 errors)");
    }
}
