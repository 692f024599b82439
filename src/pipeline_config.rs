//! Tunable thresholds for the pipeline, the diff engine and the impact projector.
//!
//! Every field has a default, so a settings file only needs the values it
//! changes. Status mapping bands live here as data, not code.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::CoverageStatus;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Documents shorter than this are rejected before any provider call.
    pub min_input_chars: usize,
    /// Extra extraction passes when validation flags too much.
    pub max_reextractions: u32,
    /// Flagged share (missing + extra) above which extraction is re-run.
    pub reextraction_flag_ratio: f64,
    /// Flagged share above which the policy is labelled `poor`.
    pub poor_flag_ratio: f64,
    /// Confidence multiplier for extraction-only, unsupported criteria.
    pub flagged_extra_confidence_factor: f64,
    /// Token overlap needed to call an extraction-only criterion grounded.
    pub grounding_threshold: f64,
    /// Similarity needed to pair an extracted criterion with a re-derived one.
    pub validation_match_threshold: f64,
    /// Ask a provider about codes missing from the reference table.
    pub reference_provider_lookup: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_input_chars: 50,
            max_reextractions: 1,
            reextraction_flag_ratio: 0.3,
            poor_flag_ratio: 0.5,
            flagged_extra_confidence_factor: 0.5,
            grounding_threshold: 0.7,
            validation_match_threshold: 0.5,
            reference_provider_lookup: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Pairs scoring below this are never matched.
    pub similarity_threshold: f64,
    /// A competing candidate within this margin marks the match low-confidence.
    pub ambiguity_margin: f64,
    /// In-memory result cache size.
    pub cache_capacity: usize,
    /// Emit entries for unchanged items too.
    pub include_unchanged: bool,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            ambiguity_margin: 0.02,
            cache_capacity: 64,
            include_unchanged: false,
        }
    }
}

/// Likelihood at or above `min_likelihood` maps to `status`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusBand {
    pub min_likelihood: f64,
    pub status: CoverageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactConfig {
    pub status_bands: Vec<StatusBand>,
    /// Likelihood drop that counts as at-risk without a status crossing.
    pub material_drop: f64,
    /// Likelihood ceiling while any required criterion is unmet.
    pub unmet_required_cap: f64,
    /// Penalty when an optional criterion stops being met.
    pub optional_unmet_penalty: f64,
    /// Bonus when an optional criterion becomes met.
    pub optional_met_bonus: f64,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            status_bands: vec![
                StatusBand { min_likelihood: 0.80, status: CoverageStatus::LikelyCovered },
                StatusBand { min_likelihood: 0.60, status: CoverageStatus::RequiresPa },
                StatusBand { min_likelihood: 0.40, status: CoverageStatus::Pend },
                StatusBand { min_likelihood: 0.0, status: CoverageStatus::RequiresHumanReview },
            ],
            material_drop: 0.2,
            unmet_required_cap: 0.3,
            optional_unmet_penalty: 0.1,
            optional_met_bonus: 0.05,
        }
    }
}

impl ImpactConfig {
    /// Highest band the likelihood reaches. Falls back to human review.
    pub fn status_for(&self, likelihood: f64) -> CoverageStatus {
        let mut bands = self.status_bands.clone();
        bands.sort_by(|a, b| b.min_likelihood.total_cmp(&a.min_likelihood));
        bands
            .iter()
            .find(|band| likelihood >= band.min_likelihood)
            .map(|band| band.status)
            .unwrap_or(CoverageStatus::RequiresHumanReview)
    }
}

/// All core settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub pipeline: PipelineConfig,
    pub diff: DiffConfig,
    pub impact: ImpactConfig,
}

impl CoreConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load from disk, falling back to defaults when missing or invalid.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Invalid settings file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
