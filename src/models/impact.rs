use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::coverage::CoverageStatus;
use super::enums::{ChangeType, CriterionOutcome, RiskCategory, Severity};

/// A changed criterion and how the patient's outcome moved on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectedCriterion {
    /// Id in the new version, or the old id for removed criteria.
    pub criterion_id: String,
    pub name: String,
    pub change_type: ChangeType,
    pub severity: Severity,
    pub required: bool,
    pub before: Option<CriterionOutcome>,
    pub after: Option<CriterionOutcome>,
}

impl AffectedCriterion {
    /// Was met before, is not met (or gone) now.
    pub fn lost(&self) -> bool {
        self.before == Some(CriterionOutcome::Met) && self.after != Some(CriterionOutcome::Met)
    }

    pub fn gained(&self) -> bool {
        self.before != Some(CriterionOutcome::Met) && self.after == Some(CriterionOutcome::Met)
    }
}

/// Projected effect of a policy change on one patient. Derived; never the
/// source of truth for the patient's coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientImpact {
    pub patient_id: String,
    pub payer: String,
    pub medication: String,
    pub old_version: u32,
    pub new_version: u32,
    pub current_status: CoverageStatus,
    pub projected_status: CoverageStatus,
    pub current_likelihood: f64,
    pub projected_likelihood: f64,
    pub risk: RiskCategory,
    pub affected_criteria: Vec<AffectedCriterion>,
    pub criteria_reevaluated: usize,
    pub recommended_action: String,
}

/// Impact of one diff across a patient population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub payer: String,
    pub medication: String,
    pub old_version: u32,
    pub new_version: u32,
    pub patients_evaluated: usize,
    pub verdict_flips: usize,
    pub at_risk: usize,
    pub improved: usize,
    pub no_impact: usize,
    pub impacts: Vec<PatientImpact>,
    pub action_items: Vec<String>,
    pub generated_at: DateTime<Utc>,
}
