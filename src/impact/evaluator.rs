use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::ImpactError;
use crate::gateway::{Gateway, Payload, TaskCategory};
use crate::models::{
    Criterion, CriterionAssessment, CriterionCategory, CriterionOutcome, PatientRecord,
    ThresholdOperator,
};
use crate::pipeline::prompt::{render, TemplateResolver};

/// Decides one criterion for one patient.
#[async_trait]
pub trait CriterionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        criterion: &Criterion,
        patient: &PatientRecord,
    ) -> Result<CriterionAssessment, ImpactError>;
}

fn assessment(
    criterion: &Criterion,
    outcome: CriterionOutcome,
    confidence: f64,
    evidence: Vec<String>,
    gaps: Vec<String>,
) -> CriterionAssessment {
    CriterionAssessment {
        criterion_id: criterion.id.clone(),
        criterion_name: criterion.name.clone(),
        outcome,
        required: criterion.required,
        confidence,
        evidence,
        gaps,
    }
}

// ═══════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════

/// Deterministic checks against patient facts. Returns nothing when the
/// record lacks what the criterion needs.
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn evaluate_rules(criterion: &Criterion, patient: &PatientRecord) -> Option<CriterionAssessment> {
        if let Some(threshold) = &criterion.threshold {
            return match threshold.operator {
                ThresholdOperator::In | ThresholdOperator::NotIn => text_rule(criterion, patient),
                _ => numeric_rule(criterion, patient),
            };
        }
        if !criterion.clinical_codes.is_empty() && criterion.category == CriterionCategory::Diagnosis {
            return diagnosis_rule(criterion, patient);
        }
        if !criterion.drug_names.is_empty() {
            return treatment_rule(criterion, patient);
        }
        if criterion.category == CriterionCategory::Documentation {
            return documentation_rule(criterion, patient);
        }
        None
    }
}

fn numeric_field(criterion: &Criterion) -> Option<String> {
    match &criterion.patient_field {
        Some(field) => Some(field.to_lowercase()),
        None if criterion.category == CriterionCategory::Demographics => Some("age".into()),
        None => None,
    }
}

fn numeric_rule(criterion: &Criterion, patient: &PatientRecord) -> Option<CriterionAssessment> {
    let threshold = criterion.threshold.as_ref()?;
    let field = numeric_field(criterion)?;
    let target = threshold.value.as_number()?;
    let actual = patient.fact(&field)?;

    let met = match threshold.operator {
        ThresholdOperator::Gt => actual > target,
        ThresholdOperator::Gte => actual >= target,
        ThresholdOperator::Lt => actual < target,
        ThresholdOperator::Lte => actual <= target,
        ThresholdOperator::Eq => (actual - target).abs() < f64::EPSILON,
        ThresholdOperator::Ne => (actual - target).abs() >= f64::EPSILON,
        ThresholdOperator::Between => actual >= target && threshold.upper.map_or(true, |upper| actual <= upper),
        ThresholdOperator::In | ThresholdOperator::NotIn => return None,
    };

    let evidence = vec![format!("{field} = {actual} ({threshold})")];
    Some(if met {
        assessment(criterion, CriterionOutcome::Met, 1.0, evidence, Vec::new())
    } else {
        let gap = format!("{} requires {field} {threshold}", criterion.name);
        assessment(criterion, CriterionOutcome::NotMet, 1.0, evidence, vec![gap])
    })
}

fn text_rule(criterion: &Criterion, patient: &PatientRecord) -> Option<CriterionAssessment> {
    let threshold = criterion.threshold.as_ref()?;
    let field = match &criterion.patient_field {
        Some(field) => field.to_lowercase(),
        None if criterion.category == CriterionCategory::Prescriber => "prescriber_specialty".into(),
        None => return None,
    };
    let actual = patient.text_fact(&field)?.trim().to_lowercase();
    let listed = threshold.value.as_set().contains(&actual);
    let met = match threshold.operator {
        ThresholdOperator::In => listed,
        _ => !listed,
    };

    let evidence = vec![format!("{field} = {actual}")];
    let outcome = if met { CriterionOutcome::Met } else { CriterionOutcome::NotMet };
    Some(assessment(criterion, outcome, 1.0, evidence, Vec::new()))
}

pub(super) fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase().replace('.', "")
}

fn diagnosis_rule(criterion: &Criterion, patient: &PatientRecord) -> Option<CriterionAssessment> {
    if patient.diagnosis_codes.is_empty() {
        return None;
    }
    let matched: Vec<String> = patient
        .diagnosis_codes
        .iter()
        .filter(|have| {
            let have = normalize_code(have);
            criterion
                .clinical_codes
                .iter()
                .any(|want| have.starts_with(&normalize_code(&want.code)))
        })
        .cloned()
        .collect();

    Some(if matched.is_empty() {
        let gap = format!("no diagnosis matching {}", criterion.name);
        assessment(criterion, CriterionOutcome::NotMet, 0.9, Vec::new(), vec![gap])
    } else {
        assessment(criterion, CriterionOutcome::Met, 1.0, matched, Vec::new())
    })
}

fn treatment_rule(criterion: &Criterion, patient: &PatientRecord) -> Option<CriterionAssessment> {
    if patient.prior_treatments.is_empty() {
        return None;
    }
    let tried: Vec<String> = patient
        .prior_treatments
        .iter()
        .filter(|drug| {
            let drug = drug.to_lowercase();
            criterion
                .drug_names
                .iter()
                .any(|want| drug.contains(&want.to_lowercase()))
        })
        .cloned()
        .collect();

    Some(if tried.is_empty() {
        let gap = format!("no documented trial of {}", criterion.drug_names.join(" or "));
        assessment(criterion, CriterionOutcome::NotMet, 0.9, Vec::new(), vec![gap])
    } else {
        assessment(criterion, CriterionOutcome::Met, 1.0, tried, Vec::new())
    })
}

/// A document on file counts when its label and the criterion name contain one another.
fn documentation_rule(criterion: &Criterion, patient: &PatientRecord) -> Option<CriterionAssessment> {
    if patient.documents.is_empty() {
        return None;
    }
    let wanted = criterion.name.trim().to_lowercase();
    let on_file: Vec<String> = patient
        .documents
        .iter()
        .filter(|doc| {
            let doc = doc.trim().to_lowercase();
            !doc.is_empty() && (doc.contains(&wanted) || wanted.contains(&doc))
        })
        .cloned()
        .collect();

    Some(if on_file.is_empty() {
        let gap = format!("{} not on file", criterion.name);
        assessment(criterion, CriterionOutcome::NotMet, 0.8, Vec::new(), vec![gap])
    } else {
        assessment(criterion, CriterionOutcome::Met, 1.0, on_file, Vec::new())
    })
}

fn undetermined(criterion: &Criterion) -> CriterionAssessment {
    let gap = format!("insufficient patient data for {}", criterion.name);
    assessment(criterion, CriterionOutcome::Undetermined, 0.0, Vec::new(), vec![gap])
}

#[async_trait]
impl CriterionEvaluator for RuleEvaluator {
    async fn evaluate(
        &self,
        criterion: &Criterion,
        patient: &PatientRecord,
    ) -> Result<CriterionAssessment, ImpactError> {
        Ok(Self::evaluate_rules(criterion, patient).unwrap_or_else(|| undetermined(criterion)))
    }
}

// ═══════════════════════════════════════════════════════════
// Provider
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct ProviderVerdict {
    met: Option<bool>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    evidence: Vec<String>,
    #[serde(default)]
    gaps: Vec<String>,
}

/// `policy_reasoning` call per criterion.
pub struct ProviderEvaluator {
    gateway: Arc<Gateway>,
    templates: Arc<dyn TemplateResolver>,
}

impl ProviderEvaluator {
    pub fn new(gateway: Arc<Gateway>, templates: Arc<dyn TemplateResolver>) -> Self {
        Self { gateway, templates }
    }
}

#[async_trait]
impl CriterionEvaluator for ProviderEvaluator {
    async fn evaluate(
        &self,
        criterion: &Criterion,
        patient: &PatientRecord,
    ) -> Result<CriterionAssessment, ImpactError> {
        let template = self
            .templates
            .template("criterion_evaluation")
            .map_err(|e| ImpactError::SchemaParse(e.to_string()))?;
        let criterion_json =
            serde_json::to_string_pretty(criterion).map_err(|e| ImpactError::SchemaParse(e.to_string()))?;
        let patient_json =
            serde_json::to_string_pretty(patient).map_err(|e| ImpactError::SchemaParse(e.to_string()))?;
        let prompt = render(
            &template,
            &[("criterion", criterion_json.as_str()), ("patient", patient_json.as_str())],
        );

        let dispatched = self
            .gateway
            .dispatch(
                TaskCategory::PolicyReasoning,
                Payload::json("You evaluate patients against coverage criteria.", prompt),
            )
            .await?;
        let verdict: ProviderVerdict = serde_json::from_value(dispatched.json_value())
            .map_err(|e| ImpactError::SchemaParse(e.to_string()))?;

        let outcome = match verdict.met {
            Some(true) => CriterionOutcome::Met,
            Some(false) => CriterionOutcome::NotMet,
            None => CriterionOutcome::Undetermined,
        };
        tracing::debug!(
            criterion = %criterion.id,
            provider = %dispatched.provider,
            outcome = %outcome,
            "Criterion evaluated by provider"
        );
        Ok(assessment(
            criterion,
            outcome,
            verdict.confidence.clamp(0.0, 1.0),
            verdict.evidence,
            verdict.gaps,
        ))
    }
}

/// Rules first; the provider only sees criteria the rules cannot decide.
pub struct RuleFirstEvaluator {
    provider: Option<ProviderEvaluator>,
}

impl RuleFirstEvaluator {
    pub fn new(provider: Option<ProviderEvaluator>) -> Self {
        Self { provider }
    }

    pub fn rules_only() -> Self {
        Self { provider: None }
    }
}

#[async_trait]
impl CriterionEvaluator for RuleFirstEvaluator {
    async fn evaluate(
        &self,
        criterion: &Criterion,
        patient: &PatientRecord,
    ) -> Result<CriterionAssessment, ImpactError> {
        if let Some(decided) = RuleEvaluator::evaluate_rules(criterion, patient) {
            return Ok(decided);
        }
        match &self.provider {
            Some(provider) => provider.evaluate(criterion, patient).await,
            None => Ok(undetermined(criterion)),
        }
    }
}
