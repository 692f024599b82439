use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{str_enum, CriterionOutcome};

str_enum!(
    /// Coverage verdict. There is deliberately no denial variant: any
    /// denial-like label coming from a provider parses as human review.
    CoverageStatus {
        Covered => "covered" | "approved" | "approve",
        LikelyCovered => "likely_covered",
        RequiresPa => "requires_pa" | "prior_authorization" | "requires_prior_authorization",
        Conditional => "conditional",
        Pend => "pend" | "pending",
        RequiresHumanReview => "requires_human_review"
            | "human_review"
            | "not_covered"
            | "deny"
            | "denied"
            | "denial",
        Unknown => "unknown",
    }
);

impl CoverageStatus {
    /// Map any provider label; unrecognized labels become `Unknown`.
    pub fn from_provider_label(label: &str) -> Self {
        label.parse().unwrap_or(CoverageStatus::Unknown)
    }

    pub fn is_approve_like(&self) -> bool {
        matches!(
            self,
            CoverageStatus::Covered | CoverageStatus::LikelyCovered | CoverageStatus::RequiresPa
        )
    }

    pub fn is_review_like(&self) -> bool {
        matches!(self, CoverageStatus::Pend | CoverageStatus::RequiresHumanReview)
    }
}

/// Outcome of one criterion for one patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionAssessment {
    pub criterion_id: String,
    #[serde(default)]
    pub criterion_name: String,
    pub outcome: CriterionOutcome,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<String>,
}

fn default_required() -> bool {
    true
}

impl CriterionAssessment {
    pub fn is_met(&self) -> bool {
        self.outcome == CriterionOutcome::Met
    }
}

/// A patient's assessment against one specific policy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAssessment {
    pub assessment_id: String,
    pub patient_id: String,
    pub payer: String,
    pub medication: String,
    pub policy_version: u32,
    pub status: CoverageStatus,
    pub approval_likelihood: f64,
    #[serde(default)]
    pub criteria: Vec<CriterionAssessment>,
    #[serde(default)]
    pub documentation_gaps: Vec<String>,
    pub assessed_at: DateTime<Utc>,
}

impl CoverageAssessment {
    pub fn outcome_for(&self, criterion_id: &str) -> Option<&CriterionAssessment> {
        self.criteria.iter().find(|c| c.criterion_id == criterion_id)
    }

    pub fn has_unmet_required(&self) -> bool {
        self.criteria.iter().any(|c| c.required && !c.is_met())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_labels_map_to_human_review() {
        for label in ["not_covered", "DENY", "denied", "Denial"] {
            assert_eq!(
                CoverageStatus::from_provider_label(label),
                CoverageStatus::RequiresHumanReview,
                "{label}"
            );
        }
    }

    #[test]
    fn unknown_label_maps_to_unknown() {
        assert_eq!(CoverageStatus::from_provider_label("maybe?"), CoverageStatus::Unknown);
    }

    #[test]
    fn deserializing_denial_never_yields_denial() {
        let status: CoverageStatus = serde_json::from_str("\"not_covered\"").unwrap();
        assert_eq!(status, CoverageStatus::RequiresHumanReview);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"requires_human_review\"");
    }

    #[test]
    fn approve_and_review_are_disjoint() {
        for status in CoverageStatus::ALL {
            assert!(!(status.is_approve_like() && status.is_review_like()), "{status}");
        }
        assert!(CoverageStatus::RequiresPa.is_approve_like());
        assert!(CoverageStatus::Pend.is_review_like());
        assert!(!CoverageStatus::Unknown.is_approve_like());
    }
}
