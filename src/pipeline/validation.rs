//! Independent re-derivation and reconciliation.
//!
//! A second provider reads the source text without seeing the extraction,
//! then both derivations are paired one-to-one. Disagreements adopt the
//! validator's values; nothing the extraction found is ever dropped.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::document::PolicyDocument;
use super::extraction::RawExtractionResult;
use super::prompt::{render, TemplateResolver, VALIDATION_SYSTEM_PROMPT};
use super::{PipelineError, Stage};
use crate::diff::matching::greedy_match;
use crate::diff::similarity::LexicalSimilarity;
use crate::gateway::{Gateway, Payload, TaskCategory};
use crate::models::{Criterion, Threshold, ValidationAction, ValidationOutcome};
use crate::pipeline_config::PipelineConfig;

#[derive(Debug, Deserialize)]
struct RederivationPayload {
    criteria: Vec<Criterion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationCounts {
    pub confirmed: usize,
    pub corrected: usize,
    pub flagged_missing: usize,
    pub flagged_extra: usize,
}

impl ValidationCounts {
    pub fn flagged(&self) -> usize {
        self.flagged_missing + self.flagged_extra
    }

    pub fn total(&self) -> usize {
        self.confirmed + self.corrected + self.flagged()
    }

    pub fn flagged_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.flagged() as f64 / total as f64,
        }
    }

    fn count(&mut self, action: ValidationAction) {
        match action {
            ValidationAction::Confirmed => self.confirmed += 1,
            ValidationAction::Corrected => self.corrected += 1,
            ValidationAction::FlaggedMissing => self.flagged_missing += 1,
            ValidationAction::FlaggedExtra => self.flagged_extra += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedExtractionResult {
    /// Extraction with every criterion carrying a validation outcome.
    pub extraction: RawExtractionResult,
    pub validation_provider: String,
    pub counts: ValidationCounts,
    pub needs_reextraction: bool,
    /// Extraction and validation ended up on the same provider.
    pub diversity_degraded: bool,
    /// Names of criteria only the validator found.
    pub missing_names: Vec<String>,
}

fn thresholds_agree(a: &Option<Threshold>, b: &Option<Threshold>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            let values_agree = match (a.value.as_number(), b.value.as_number()) {
                (Some(x), Some(y)) => (x - y).abs() < 1e-9,
                _ => a.value.as_set() == b.value.as_set(),
            };
            let units_agree = match (&a.unit, &b.unit) {
                (Some(x), Some(y)) => x.trim().eq_ignore_ascii_case(y.trim()),
                _ => true,
            };
            a.operator == b.operator && values_agree && a.upper == b.upper && units_agree
        }
        _ => false,
    }
}

fn disagreements(extracted: &Criterion, rederived: &Criterion) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if !thresholds_agree(&extracted.threshold, &rederived.threshold) {
        fields.push("threshold");
    }
    if extracted.required != rederived.required {
        fields.push("required");
    }
    if extracted.category != rederived.category {
        fields.push("category");
    }
    fields
}

fn unique_id(base: &str, taken: &HashSet<String>) -> String {
    let base = match base.trim() {
        "" => "criterion",
        trimmed => trimmed,
    };
    if !taken.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}_v{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| format!("{base}_{}", uuid::Uuid::new_v4()))
}

fn mark(criterion: &mut Criterion, action: ValidationAction, rationale: String) {
    criterion.validation = Some(ValidationOutcome { action, rationale });
}

/// Pair the two derivations and assign a validation action to every criterion.
pub fn reconcile(
    document: &PolicyDocument,
    mut raw: RawExtractionResult,
    rederived: Vec<Criterion>,
    validation_provider: &str,
    config: &PipelineConfig,
) -> ValidatedExtractionResult {
    let extracted = std::mem::take(&mut raw.criteria);
    let scores = LexicalSimilarity::criteria_matrix(&extracted, &rederived);
    let assignment = greedy_match(
        &scores,
        extracted.len(),
        rederived.len(),
        config.validation_match_threshold,
        0.0,
    );

    let mut taken: HashSet<String> = extracted.iter().map(|c| c.id.clone()).collect();
    let mut counts = ValidationCounts::default();
    let mut criteria = Vec::with_capacity(extracted.len() + assignment.unmatched_new.len());

    for (index, mut criterion) in extracted.into_iter().enumerate() {
        match assignment.match_for_old(index) {
            Some(pair) => {
                let other = &rederived[pair.new];
                let fields = disagreements(&criterion, other);
                if fields.is_empty() {
                    mark(
                        &mut criterion,
                        ValidationAction::Confirmed,
                        "independently re-derived with the same values".into(),
                    );
                } else {
                    criterion.threshold = other.threshold.clone();
                    criterion.required = other.required;
                    criterion.category = other.category;
                    if criterion.source_page.is_none() {
                        criterion.source_page = other.source_page;
                    }
                    mark(
                        &mut criterion,
                        ValidationAction::Corrected,
                        format!("validator disagreed on {}; adopted its values", fields.join(", ")),
                    );
                }
            }
            None => {
                let excerpt_found = criterion
                    .source_excerpt
                    .as_deref()
                    .and_then(|excerpt| document.locate(excerpt))
                    .is_some();
                let key_terms = format!("{} {}", criterion.name, criterion.description);
                let grounded = excerpt_found
                    || document.grounding_ratio(&key_terms) >= config.grounding_threshold;
                if grounded {
                    mark(
                        &mut criterion,
                        ValidationAction::Confirmed,
                        "not re-derived by the validator but supported by the source text".into(),
                    );
                } else {
                    criterion.confidence =
                        (criterion.confidence * config.flagged_extra_confidence_factor).clamp(0.0, 1.0);
                    mark(
                        &mut criterion,
                        ValidationAction::FlaggedExtra,
                        "not re-derived by the validator and not found in the source text".into(),
                    );
                }
            }
        }
        if let Some(action) = criterion.validation_action() {
            counts.count(action);
        }
        criteria.push(criterion);
    }

    let mut missing_names = Vec::new();
    for index in &assignment.unmatched_new {
        let mut criterion = rederived[*index].clone();
        criterion.id = unique_id(&criterion.id, &taken);
        taken.insert(criterion.id.clone());
        mark(
            &mut criterion,
            ValidationAction::FlaggedMissing,
            "found only by the validator".into(),
        );
        counts.count(ValidationAction::FlaggedMissing);
        missing_names.push(criterion.name.clone());
        criteria.push(criterion);
    }

    raw.criteria = criteria;
    let needs_reextraction = counts.flagged_ratio() > config.reextraction_flag_ratio;
    let diversity_degraded = raw.provider == validation_provider;

    ValidatedExtractionResult {
        extraction: raw,
        validation_provider: validation_provider.to_string(),
        counts,
        needs_reextraction,
        diversity_degraded,
        missing_names,
    }
}

/// Run the validation pass. Failures here are fatal and never masked.
pub async fn validate_extraction(
    gateway: &Gateway,
    templates: &dyn TemplateResolver,
    document: &PolicyDocument,
    raw: RawExtractionResult,
    payer: &str,
    medication: &str,
    config: &PipelineConfig,
) -> Result<ValidatedExtractionResult, PipelineError> {
    let template = templates.template("validation")?;
    let document_text = document.render_for_prompt();
    let prompt = render(
        &template,
        &[
            ("payer", payer),
            ("medication", medication),
            ("document", document_text.as_str()),
        ],
    );

    let dispatched = gateway
        .dispatch(
            TaskCategory::PolicyReasoning,
            Payload::json(VALIDATION_SYSTEM_PROMPT, prompt),
        )
        .await
        .map_err(PipelineError::gateway(Stage::Validation))?;

    let payload: RederivationPayload = serde_json::from_value(dispatched.json_value())
        .map_err(|e| PipelineError::SchemaParse {
            stage: Stage::Validation,
            message: e.to_string(),
        })?;

    let validated = reconcile(document, raw, payload.criteria, &dispatched.provider, config);
    if validated.diversity_degraded {
        tracing::warn!(
            provider = %validated.validation_provider,
            "Extraction and validation served by the same provider"
        );
    }
    tracing::info!(
        confirmed = validated.counts.confirmed,
        corrected = validated.counts.corrected,
        flagged_missing = validated.counts.flagged_missing,
        flagged_extra = validated.counts.flagged_extra,
        "Validation complete"
    );
    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CriterionCategory, ThresholdOperator};

    const SOURCE: &str = "--- Page 1 ---\nAdalimumab is covered for rheumatoid arthritis.\n\
        --- Page 2 ---\nPatient must be 18 years of age or older.\n\
        Patient must have had an inadequate response to methotrexate.";

    fn raw(criteria: Vec<Criterion>) -> RawExtractionResult {
        RawExtractionResult {
            policy_title: None,
            effective_date: None,
            criteria,
            groups: Vec::new(),
            indications: Vec::new(),
            exclusions: Vec::new(),
            safety_screenings: Vec::new(),
            provider: "gemini".into(),
            source_hash: "h".into(),
        }
    }

    fn age(min: f64) -> Criterion {
        Criterion::new("age", CriterionCategory::Demographics, "Minimum age")
            .with_description(&format!("Patient must be at least {min} years old"))
            .with_threshold(ThresholdOperator::Gte, min, Some("years"))
            .on_page(2, "Patient must be 18 years of age or older")
    }

    fn mtx() -> Criterion {
        Criterion::new("mtx", CriterionCategory::StepTherapy, "Methotrexate trial")
            .with_description("Inadequate response to methotrexate")
            .with_drug("methotrexate")
            .on_page(2, "inadequate response to methotrexate")
    }

    fn run(extracted: Vec<Criterion>, rederived: Vec<Criterion>) -> ValidatedExtractionResult {
        let doc = PolicyDocument::parse(SOURCE);
        reconcile(&doc, raw(extracted), rederived, "claude", &PipelineConfig::default())
    }

    fn action(result: &ValidatedExtractionResult, id: &str) -> ValidationAction {
        result
            .extraction
            .criteria
            .iter()
            .find(|c| c.id == id)
            .and_then(Criterion::validation_action)
            .unwrap()
    }

    #[test]
    fn agreeing_derivations_confirm() {
        let result = run(vec![age(18.0), mtx()], vec![mtx(), age(18.0)]);
        assert_eq!(action(&result, "age"), ValidationAction::Confirmed);
        assert_eq!(action(&result, "mtx"), ValidationAction::Confirmed);
        assert_eq!(result.counts.confirmed, 2);
        assert!(!result.needs_reextraction);
    }

    #[test]
    fn disagreement_adopts_validator_values() {
        let result = run(vec![age(21.0)], vec![age(18.0)]);
        assert_eq!(action(&result, "age"), ValidationAction::Corrected);
        let corrected = &result.extraction.criteria[0];
        assert_eq!(corrected.threshold.as_ref().unwrap().value.as_number(), Some(18.0));
        assert!(corrected.validation.as_ref().unwrap().rationale.contains("threshold"));
    }

    #[test]
    fn unsupported_extra_is_flagged_and_kept_with_lower_confidence() {
        let invented = Criterion::new("bio", CriterionCategory::StepTherapy, "Prior biologic failure")
            .with_description("Failure of two prior biologics")
            .on_page(2, "failure of two prior biologics");
        let result = run(vec![age(18.0), invented], vec![age(18.0)]);

        let kept = result.extraction.criteria.iter().find(|c| c.id == "bio").unwrap();
        assert_eq!(kept.validation_action(), Some(ValidationAction::FlaggedExtra));
        assert!((kept.confidence - 0.4).abs() < 1e-9);
        assert_eq!(result.counts.flagged_extra, 1);
        assert_eq!(result.extraction.criteria.len(), 2);
    }

    #[test]
    fn grounded_extra_is_confirmed() {
        let result = run(vec![age(18.0), mtx()], vec![age(18.0)]);
        assert_eq!(action(&result, "mtx"), ValidationAction::Confirmed);
        assert!(result.extraction.criteria[1]
            .validation
            .as_ref()
            .unwrap()
            .rationale
            .contains("supported by the source"));
    }

    #[test]
    fn validator_only_criterion_is_added_with_unique_id() {
        let mut found = mtx();
        found.id = "age".into();
        let result = run(vec![age(18.0)], vec![age(18.0), found]);
        assert_eq!(result.extraction.criteria.len(), 2);
        let added = &result.extraction.criteria[1];
        assert_eq!(added.id, "age_v2");
        assert_eq!(added.validation_action(), Some(ValidationAction::FlaggedMissing));
        assert_eq!(result.missing_names, vec!["Methotrexate trial"]);
    }

    #[test]
    fn heavy_flagging_requests_reextraction() {
        let result = run(vec![age(18.0)], vec![age(18.0), mtx()]);
        assert_eq!(result.counts.flagged_missing, 1);
        assert!(result.counts.flagged_ratio() > 0.3);
        assert!(result.needs_reextraction);
    }

    #[test]
    fn same_provider_degrades_diversity() {
        let doc = PolicyDocument::parse(SOURCE);
        let result = reconcile(&doc, raw(vec![age(18.0)]), vec![age(18.0)], "gemini", &PipelineConfig::default());
        assert!(result.diversity_degraded);
    }
}
