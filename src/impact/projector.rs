use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;

use super::evaluator::{normalize_code, CriterionEvaluator};
use super::ImpactError;
use crate::models::{
    AffectedCriterion, ChangeType, ClinicalCode, CoverageAssessment, CoverageStatus,
    CriterionAssessment, CriterionOutcome, DiffEntry, DiffResult, DiffSubject, DiffValue,
    ImpactReport, Indication, PatientImpact, PatientRecord, RiskCategory, Severity,
};
use crate::pipeline_config::ImpactConfig;

/// Tolerance for likelihood comparisons against configured thresholds.
const EPSILON: f64 = 1e-9;

pub struct ImpactProjector {
    evaluator: Arc<dyn CriterionEvaluator>,
    config: ImpactConfig,
}

impl ImpactProjector {
    pub fn new(evaluator: Arc<dyn CriterionEvaluator>, config: ImpactConfig) -> Self {
        Self { evaluator, config }
    }

    pub fn config(&self) -> &ImpactConfig {
        &self.config
    }

    /// Project one patient's assessment from the diff's old version onto its new one.
    pub async fn project(
        &self,
        diff: &DiffResult,
        baseline: &CoverageAssessment,
        patient: &PatientRecord,
    ) -> Result<PatientImpact, ImpactError> {
        check_baseline(diff, baseline)?;

        let mut outcomes: Vec<CriterionAssessment> = baseline.criteria.clone();
        let mut affected = Vec::new();
        let mut reevaluated = 0;

        for entry in diff.criterion_changes() {
            if entry.change_type == ChangeType::Modified && entry.severity == Severity::Cosmetic {
                continue;
            }
            let prior = entry.old_id.as_deref().and_then(|id| baseline.outcome_for(id));
            let before = prior.map(|a| a.outcome);

            if let Some(old_id) = &entry.old_id {
                outcomes.retain(|a| &a.criterion_id != old_id);
            }

            let after = match entry.new_criterion() {
                Some(criterion) if entry.change_type != ChangeType::Removed => {
                    let mut assessment = self.evaluator.evaluate(criterion, patient).await?;
                    reevaluated += 1;
                    let undecided = entry.change_type == ChangeType::Modified
                        && assessment.outcome == CriterionOutcome::Undetermined;
                    if let Some(prior) = prior.filter(|_| undecided) {
                        tracing::debug!(
                            criterion = %criterion.id,
                            "Re-evaluation undetermined, keeping baseline outcome"
                        );
                        assessment = CriterionAssessment {
                            criterion_id: criterion.id.clone(),
                            ..prior.clone()
                        };
                    }
                    let outcome = assessment.outcome;
                    outcomes.push(assessment);
                    Some(outcome)
                }
                _ => None,
            };

            affected.push(affected_criterion(entry, before, after));
        }

        let lifted = exclusion_effects(diff, baseline, &mut outcomes, &mut affected);
        indication_effects(diff, patient, &mut outcomes, &mut affected);

        let current = baseline.approval_likelihood;
        let shifted = affected.iter().any(|a| a.before != a.after);
        let (projected_likelihood, projected_status) = if shifted {
            let likelihood = self.likelihood(baseline, &outcomes, &affected, lifted);
            (likelihood, self.config.status_for(likelihood))
        } else {
            (current, baseline.status)
        };

        let risk = self.classify(baseline, projected_status, projected_likelihood, &affected);
        let recommended_action = recommend(risk, patient, diff, &affected, &outcomes);

        tracing::info!(
            patient = %patient.patient_id,
            payer = %diff.payer,
            medication = %diff.medication,
            risk = %risk,
            reevaluated,
            "Impact projected"
        );

        Ok(PatientImpact {
            patient_id: patient.patient_id.clone(),
            payer: diff.payer.clone(),
            medication: diff.medication.clone(),
            old_version: diff.old_version,
            new_version: diff.new_version,
            current_status: baseline.status,
            projected_status,
            current_likelihood: current,
            projected_likelihood,
            risk,
            affected_criteria: affected,
            criteria_reevaluated: reevaluated,
            recommended_action,
        })
    }

    /// Project several patients concurrently and aggregate.
    pub async fn project_many(
        &self,
        diff: &DiffResult,
        cases: &[(CoverageAssessment, PatientRecord)],
    ) -> Result<ImpactReport, ImpactError> {
        let results = join_all(
            cases
                .iter()
                .map(|(baseline, patient)| self.project(diff, baseline, patient)),
        )
        .await;
        let impacts = results.into_iter().collect::<Result<Vec<_>, _>>()?;

        let count = |risk: RiskCategory| impacts.iter().filter(|i| i.risk == risk).count();
        let action_items = impacts
            .iter()
            .filter(|i| matches!(i.risk, RiskCategory::VerdictFlip | RiskCategory::AtRisk))
            .map(|i| format!("{}: {}", i.patient_id, i.recommended_action))
            .collect();

        Ok(ImpactReport {
            payer: diff.payer.clone(),
            medication: diff.medication.clone(),
            old_version: diff.old_version,
            new_version: diff.new_version,
            patients_evaluated: impacts.len(),
            verdict_flips: count(RiskCategory::VerdictFlip),
            at_risk: count(RiskCategory::AtRisk),
            improved: count(RiskCategory::Improved),
            no_impact: count(RiskCategory::NoImpact),
            impacts,
            action_items,
            generated_at: Utc::now(),
        })
    }

    fn likelihood(
        &self,
        baseline: &CoverageAssessment,
        outcomes: &[CriterionAssessment],
        affected: &[AffectedCriterion],
        exclusion_lifted: bool,
    ) -> f64 {
        let mut likelihood = baseline.approval_likelihood;

        for a in affected.iter().filter(|a| !a.required && a.after.is_some()) {
            let became_undetermined = a.after == Some(CriterionOutcome::Undetermined)
                && a.before != Some(CriterionOutcome::Undetermined);
            if a.lost() || became_undetermined {
                likelihood -= self.config.optional_unmet_penalty;
            } else if a.gained() {
                likelihood += self.config.optional_met_bonus;
            }
        }

        let unmet_required = outcomes.iter().any(|o| o.required && !o.is_met());
        if unmet_required {
            likelihood = likelihood.min(self.config.unmet_required_cap);
        } else if baseline.has_unmet_required() || exclusion_lifted {
            let met = outcomes.iter().filter(|o| o.is_met()).count();
            let ratio = if outcomes.is_empty() {
                1.0
            } else {
                met as f64 / outcomes.len() as f64
            };
            likelihood = likelihood.max(ratio);
        }

        likelihood.clamp(0.0, 1.0)
    }

    fn classify(
        &self,
        baseline: &CoverageAssessment,
        projected_status: CoverageStatus,
        projected_likelihood: f64,
        affected: &[AffectedCriterion],
    ) -> RiskCategory {
        let current = baseline.status;
        if current.is_approve_like() && projected_status.is_review_like() {
            return RiskCategory::VerdictFlip;
        }
        if current.is_review_like() && projected_status.is_approve_like() {
            return RiskCategory::Improved;
        }

        let delta = projected_likelihood - baseline.approval_likelihood;
        let lost = affected.iter().any(|a| a.after.is_some() && a.lost());
        if delta <= -self.config.material_drop + EPSILON || lost {
            RiskCategory::AtRisk
        } else if delta >= self.config.material_drop - EPSILON {
            RiskCategory::Improved
        } else {
            RiskCategory::NoImpact
        }
    }
}

fn check_baseline(diff: &DiffResult, baseline: &CoverageAssessment) -> Result<(), ImpactError> {
    if baseline.policy_version != diff.old_version {
        return Err(ImpactError::VersionMismatch {
            baseline: baseline.policy_version,
            diff_old: diff.old_version,
        });
    }
    let same_payer = baseline.payer.trim().eq_ignore_ascii_case(diff.payer.trim());
    let same_medication = baseline.medication.trim().eq_ignore_ascii_case(diff.medication.trim());
    if !(same_payer && same_medication) {
        return Err(ImpactError::PolicyMismatch {
            baseline: format!("{}/{}", baseline.payer, baseline.medication),
            diff: format!("{}/{}", diff.payer, diff.medication),
        });
    }
    Ok(())
}

fn affected_criterion(
    entry: &DiffEntry,
    before: Option<CriterionOutcome>,
    after: Option<CriterionOutcome>,
) -> AffectedCriterion {
    let criterion = entry.new_criterion().or(entry.old_criterion());
    AffectedCriterion {
        criterion_id: entry
            .new_id
            .clone()
            .or_else(|| entry.old_id.clone())
            .unwrap_or_default(),
        name: entry.name().to_string(),
        change_type: entry.change_type,
        severity: entry.severity,
        required: criterion.is_some_and(|c| c.required),
        before,
        after,
    }
}

// ═══════════════════════════════════════════════════════════
// Indications and exclusions
// ═══════════════════════════════════════════════════════════

fn outcome_of(fits: bool) -> CriterionOutcome {
    if fits {
        CriterionOutcome::Met
    } else {
        CriterionOutcome::NotMet
    }
}

/// Required pseudo-criterion standing in for an indication or exclusion.
fn policy_level(
    entry: &DiffEntry,
    before: Option<CriterionOutcome>,
    after: Option<CriterionOutcome>,
) -> AffectedCriterion {
    AffectedCriterion {
        required: true,
        ..affected_criterion(entry, before, after)
    }
}

fn blocking_outcome(id: String, name: &str, gap: String) -> CriterionAssessment {
    CriterionAssessment {
        criterion_id: id,
        criterion_name: name.to_string(),
        outcome: CriterionOutcome::NotMet,
        required: true,
        confidence: 1.0,
        evidence: Vec::new(),
        gaps: vec![gap],
    }
}

fn codes_match(codes: &[ClinicalCode], patient: &PatientRecord) -> Option<bool> {
    if codes.is_empty() || patient.diagnosis_codes.is_empty() {
        return None;
    }
    Some(patient.diagnosis_codes.iter().any(|have| {
        let have = normalize_code(have);
        codes.iter().any(|want| have.starts_with(&normalize_code(&want.code)))
    }))
}

fn age_fits(indication: &Indication, patient: &PatientRecord) -> Option<bool> {
    if indication.min_age_years.is_none() && indication.max_age_years.is_none() {
        return None;
    }
    let age = patient.fact("age")?;
    Some(
        indication.min_age_years.map_or(true, |min| age >= min)
            && indication.max_age_years.map_or(true, |max| age <= max),
    )
}

/// `None` when the record cannot tell.
fn indication_fits(indication: &Indication, patient: &PatientRecord) -> Option<bool> {
    match (codes_match(&indication.codes, patient), age_fits(indication, patient)) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (None, None) => None,
        _ => Some(true),
    }
}

/// The patient's diagnosis codes place them under the indication.
fn diagnosed_with(indication: &Indication, patient: &PatientRecord) -> bool {
    codes_match(&indication.codes, patient) == Some(true)
        && age_fits(indication, patient) != Some(false)
}

fn as_indication(value: Option<&DiffValue>) -> Option<&Indication> {
    match value {
        Some(DiffValue::Indication(indication)) => Some(indication),
        _ => None,
    }
}

/// Removed, narrowed or widened indications the patient falls under.
fn indication_effects(
    diff: &DiffResult,
    patient: &PatientRecord,
    outcomes: &mut Vec<CriterionAssessment>,
    affected: &mut Vec<AffectedCriterion>,
) {
    let entries = diff
        .entries
        .iter()
        .filter(|e| e.subject == DiffSubject::Indication && e.change_type != ChangeType::Unchanged);

    for entry in entries {
        let old = as_indication(entry.old_value.as_ref());
        let new = as_indication(entry.new_value.as_ref());

        let (before, after) = match (entry.change_type, old, new) {
            (ChangeType::Removed, Some(old), _) if diagnosed_with(old, patient) => (true, false),
            (ChangeType::Added, _, Some(new)) if diagnosed_with(new, patient) => (false, true),
            (ChangeType::Modified, Some(old), Some(new)) => {
                match (indication_fits(old, patient), indication_fits(new, patient)) {
                    (Some(before), Some(after)) if before != after => (before, after),
                    _ => continue,
                }
            }
            _ => continue,
        };

        if !after {
            let name = entry.name();
            let gap = format!("{name} no longer covered for this patient under v{}", diff.new_version);
            let id = entry.old_id.clone().or_else(|| entry.new_id.clone()).unwrap_or_default();
            outcomes.push(blocking_outcome(format!("indication:{id}"), name, gap));
        }
        affected.push(policy_level(entry, Some(outcome_of(before)), Some(outcome_of(after))));
    }
}

fn is_met_in(outcomes: &[CriterionAssessment], id: &str) -> bool {
    outcomes.iter().any(|o| o.criterion_id == id && o.is_met())
}

/// Added, changed or lifted exclusions. An exclusion applies when any of its
/// trigger criteria is met. Returns whether an exclusion that applied was lifted.
fn exclusion_effects(
    diff: &DiffResult,
    baseline: &CoverageAssessment,
    outcomes: &mut Vec<CriterionAssessment>,
    affected: &mut Vec<AffectedCriterion>,
) -> bool {
    let renamed: HashMap<&str, &str> = diff
        .criterion_changes()
        .filter_map(|e| Some((e.new_id.as_deref()?, e.old_id.as_deref()?)))
        .collect();

    let met_now = |outcomes: &[CriterionAssessment], id: &str| {
        is_met_in(outcomes, id) || renamed.get(id).is_some_and(|old| is_met_in(outcomes, old))
    };

    let mut lifted = false;
    let entries = diff
        .entries
        .iter()
        .filter(|e| e.subject == DiffSubject::Exclusion && e.change_type != ChangeType::Unchanged);

    for entry in entries {
        let was = match &entry.old_value {
            Some(DiffValue::Exclusion(old)) => old
                .trigger_criteria
                .iter()
                .any(|id| is_met_in(&baseline.criteria, id)),
            _ => false,
        };
        let now = match &entry.new_value {
            Some(DiffValue::Exclusion(new)) if entry.change_type != ChangeType::Removed => {
                new.trigger_criteria.iter().any(|id| met_now(outcomes.as_slice(), id.as_str()))
            }
            _ => false,
        };
        if was == now {
            continue;
        }

        if now {
            let name = entry.name();
            let id = entry.new_id.clone().unwrap_or_default();
            outcomes.push(blocking_outcome(format!("exclusion:{id}"), name, format!("{name} applies")));
        } else {
            lifted = true;
        }
        affected.push(policy_level(entry, Some(outcome_of(!was)), Some(outcome_of(!now))));
    }
    lifted
}

fn recommend(
    risk: RiskCategory,
    patient: &PatientRecord,
    diff: &DiffResult,
    affected: &[AffectedCriterion],
    outcomes: &[CriterionAssessment],
) -> String {
    let unmet: Vec<&str> = affected
        .iter()
        .filter(|a| a.after.is_some() && a.after != Some(CriterionOutcome::Met))
        .map(|a| a.name.as_str())
        .collect();
    let gaps: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.is_met())
        .flat_map(|o| o.gaps.iter().map(String::as_str))
        .collect();

    match risk {
        RiskCategory::VerdictFlip => format!(
            "Re-submit prior authorization for {} before v{} takes effect; address: {}",
            patient.patient_id,
            diff.new_version,
            if gaps.is_empty() { unmet.join(", ") } else { gaps.join("; ") }
        ),
        RiskCategory::AtRisk => format!(
            "Review documentation for {} against changed criteria: {}",
            patient.patient_id,
            unmet.join(", ")
        ),
        RiskCategory::Improved => format!(
            "Re-evaluate {}; coverage outlook improved under v{}",
            patient.patient_id, diff.new_version
        ),
        RiskCategory::NoImpact => "No action needed".to_string(),
    }
}
