//! Field-level comparison and severity rules.
//!
//! Severity answers one question: could a patient who qualified under the
//! old version fail under the new one? Changes the rules cannot decide
//! (operator swaps, set or range edits) are marked ambiguous and left to a
//! [`SeverityJudge`], or treated as material when none is configured.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::DiffError;
use crate::gateway::{Gateway, Payload, TaskCategory};
use crate::models::{
    ClinicalCode, CodeSystem, Criterion, Exclusion, FieldChange, Indication, Severity, Threshold,
    ThresholdOperator,
};
use crate::pipeline::prompt::{render, TemplateResolver};

#[derive(Debug, Clone, PartialEq)]
pub struct CriterionComparison {
    pub changes: Vec<FieldChange>,
    /// Some change needs judgment; its provisional severity is material.
    pub ambiguous: bool,
}

impl CriterionComparison {
    pub fn severity(&self) -> Severity {
        max_severity(&self.changes)
    }
}

pub fn max_severity(changes: &[FieldChange]) -> Severity {
    changes
        .iter()
        .map(|c| c.severity)
        .max()
        .unwrap_or(Severity::Cosmetic)
}

fn change(field: &str, old: Value, new: Value, severity: Severity, note: &str) -> FieldChange {
    FieldChange {
        field: field.to_string(),
        old,
        new,
        severity,
        note: note.to_string(),
    }
}

fn text_differs(a: &str, b: &str) -> bool {
    a.split_whitespace().ne(b.split_whitespace())
}

fn code_set(codes: &[ClinicalCode]) -> BTreeSet<(CodeSystem, String)> {
    codes.iter().map(|c| c.key()).collect()
}

fn drug_set(drugs: &[String]) -> BTreeSet<String> {
    drugs.iter().map(|d| d.trim().to_lowercase()).collect()
}

fn same_unit(a: &Option<String>, b: &Option<String>) -> bool {
    let norm = |u: &Option<String>| u.as_deref().map(|s| s.trim().to_lowercase()).unwrap_or_default();
    norm(a) == norm(b)
}

/// Threshold comparison. Returns the changes and whether any needs judgment.
fn compare_thresholds(old: &Option<Threshold>, new: &Option<Threshold>) -> (Vec<FieldChange>, bool) {
    let (old, new) = match (old, new) {
        (None, None) => return (Vec::new(), false),
        (None, Some(t)) => {
            return (
                vec![change("threshold", Value::Null, json!(t.to_string()), Severity::Breaking, "threshold introduced")],
                false,
            )
        }
        (Some(t), None) => {
            return (
                vec![change("threshold", json!(t.to_string()), Value::Null, Severity::Minor, "threshold removed")],
                false,
            )
        }
        (Some(a), Some(b)) => (a, b),
    };

    let mut changes = Vec::new();
    let mut ambiguous = false;

    if !same_unit(&old.unit, &new.unit) {
        changes.push(change(
            "threshold.unit",
            json!(old.unit),
            json!(new.unit),
            Severity::Material,
            "unit changed",
        ));
    }

    if old.operator != new.operator {
        ambiguous = true;
        changes.push(change(
            "threshold.operator",
            json!(old.operator),
            json!(new.operator),
            Severity::Material,
            "operator changed",
        ));
        return (changes, ambiguous);
    }

    let value_changed = old.value != new.value || old.upper != new.upper;
    if !value_changed {
        return (changes, ambiguous);
    }

    let old_json = json!(old.to_string());
    let new_json = json!(new.to_string());
    let numeric = old.value.as_number().zip(new.value.as_number());
    let directional = match (old.operator, numeric) {
        (ThresholdOperator::Gt | ThresholdOperator::Gte, Some((a, b))) => Some(b > a),
        (ThresholdOperator::Lt | ThresholdOperator::Lte, Some((a, b))) => Some(b < a),
        _ => None,
    };
    match directional {
        Some(true) => changes.push(change("threshold.value", old_json, new_json, Severity::Breaking, "threshold tightened")),
        Some(false) if numeric.is_some_and(|(a, b)| (a - b).abs() < f64::EPSILON) => {}
        Some(false) => changes.push(change("threshold.value", old_json, new_json, Severity::Minor, "threshold loosened")),
        None => {
            ambiguous = true;
            changes.push(change(
                "threshold.value",
                old_json,
                new_json,
                Severity::Material,
                "value changed for a non-directional operator",
            ));
        }
    }
    (changes, ambiguous)
}

/// Compare two matched criteria field by field.
pub fn compare_criteria(old: &Criterion, new: &Criterion) -> CriterionComparison {
    let mut changes = Vec::new();

    if text_differs(&old.name, &new.name) {
        changes.push(change("name", json!(old.name), json!(new.name), Severity::Cosmetic, "renamed"));
    }
    if text_differs(&old.description, &new.description) {
        changes.push(change(
            "description",
            json!(old.description),
            json!(new.description),
            Severity::Cosmetic,
            "reworded",
        ));
    }
    if old.category != new.category {
        changes.push(change(
            "category",
            json!(old.category),
            json!(new.category),
            Severity::Material,
            "category changed",
        ));
    }
    match (old.required, new.required) {
        (false, true) => changes.push(change("required", json!(false), json!(true), Severity::Breaking, "now required")),
        (true, false) => changes.push(change("required", json!(true), json!(false), Severity::Minor, "now optional")),
        _ => {}
    }

    let (threshold_changes, ambiguous) = compare_thresholds(&old.threshold, &new.threshold);
    changes.extend(threshold_changes);

    if code_set(&old.clinical_codes) != code_set(&new.clinical_codes) {
        let codes = |c: &Criterion| c.clinical_codes.iter().map(|c| c.code.clone()).collect::<Vec<_>>();
        changes.push(change(
            "clinical_codes",
            json!(codes(old)),
            json!(codes(new)),
            Severity::Material,
            "codes changed",
        ));
    }
    if drug_set(&old.drug_names) != drug_set(&new.drug_names) {
        changes.push(change(
            "drug_names",
            json!(old.drug_names),
            json!(new.drug_names),
            Severity::Material,
            "drugs changed",
        ));
    }

    CriterionComparison { changes, ambiguous }
}

/// New requirement for everyone when required; a new path to approval otherwise.
pub fn added_criterion_severity(criterion: &Criterion) -> Severity {
    if criterion.required {
        Severity::Breaking
    } else {
        Severity::Material
    }
}

/// Losing an optional criterion removes an alternative path some patients relied on.
pub fn removed_criterion_severity(criterion: &Criterion) -> Severity {
    if criterion.required {
        Severity::Material
    } else {
        Severity::Breaking
    }
}

// ═══════════════════════════════════════════════════════════
// Indications and exclusions
// ═══════════════════════════════════════════════════════════

fn bound_change(
    field: &str,
    old: Option<f64>,
    new: Option<f64>,
    tighter: impl Fn(f64, f64) -> bool,
) -> Option<FieldChange> {
    let severity = match (old, new) {
        (None, None) => return None,
        (Some(a), Some(b)) if (a - b).abs() < f64::EPSILON => return None,
        (None, Some(_)) => Severity::Breaking,
        (Some(_), None) => Severity::Minor,
        (Some(a), Some(b)) if tighter(a, b) => Severity::Breaking,
        _ => Severity::Minor,
    };
    let note = if severity == Severity::Breaking { "age range narrowed" } else { "age range widened" };
    Some(change(field, json!(old), json!(new), severity, note))
}

pub fn compare_indications(old: &Indication, new: &Indication) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if text_differs(&old.name, &new.name) {
        changes.push(change("name", json!(old.name), json!(new.name), Severity::Cosmetic, "renamed"));
    }
    if code_set(&old.codes) != code_set(&new.codes) {
        let codes = |i: &Indication| i.codes.iter().map(|c| c.code.clone()).collect::<Vec<_>>();
        changes.push(change("codes", json!(codes(old)), json!(codes(new)), Severity::Material, "codes changed"));
    }
    changes.extend(bound_change("min_age_years", old.min_age_years, new.min_age_years, |a, b| b > a));
    changes.extend(bound_change("max_age_years", old.max_age_years, new.max_age_years, |a, b| b < a));
    match (old.approval_duration_months, new.approval_duration_months) {
        (Some(a), Some(b)) if b < a => changes.push(change(
            "approval_duration_months",
            json!(a),
            json!(b),
            Severity::Material,
            "approval period shortened",
        )),
        (a, b) if a != b => changes.push(change(
            "approval_duration_months",
            json!(a),
            json!(b),
            Severity::Minor,
            "approval period changed",
        )),
        _ => {}
    }
    changes
}

/// `criterion_ids` maps old criterion ids to their matched new ids.
pub fn compare_exclusions(
    old: &Exclusion,
    new: &Exclusion,
    criterion_ids: &HashMap<String, String>,
) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if text_differs(&old.name, &new.name) {
        changes.push(change("name", json!(old.name), json!(new.name), Severity::Cosmetic, "renamed"));
    }
    if text_differs(&old.description, &new.description) {
        changes.push(change(
            "description",
            json!(old.description),
            json!(new.description),
            Severity::Material,
            "exclusion wording changed",
        ));
    }
    let mapped: BTreeSet<&str> = old
        .trigger_criteria
        .iter()
        .map(|id| criterion_ids.get(id).map(String::as_str).unwrap_or("<removed>"))
        .collect();
    let current: BTreeSet<&str> = new.trigger_criteria.iter().map(String::as_str).collect();
    if mapped != current {
        changes.push(change(
            "trigger_criteria",
            json!(old.trigger_criteria),
            json!(new.trigger_criteria),
            Severity::Breaking,
            "exclusion triggers changed",
        ));
    }
    changes
}

// ═══════════════════════════════════════════════════════════
// Judgment
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Judgement {
    pub severity: Severity,
    #[serde(default)]
    pub rationale: String,
}

/// Decides severity for changes the rules mark ambiguous.
#[async_trait]
pub trait SeverityJudge: Send + Sync {
    async fn judge(
        &self,
        old: &Criterion,
        new: &Criterion,
        changes: &[FieldChange],
    ) -> Result<Judgement, DiffError>;
}

/// `change_assessment` call per ambiguous criterion.
pub struct ProviderSeverityJudge {
    gateway: Arc<Gateway>,
    templates: Arc<dyn TemplateResolver>,
}

impl ProviderSeverityJudge {
    pub fn new(gateway: Arc<Gateway>, templates: Arc<dyn TemplateResolver>) -> Self {
        Self { gateway, templates }
    }
}

fn describe(c: &Criterion) -> String {
    let threshold = c.threshold.as_ref().map(|t| format!(" [{t}]")).unwrap_or_default();
    let required = if c.required { "required" } else { "optional" };
    format!("{} ({required}): {}{threshold}", c.name, c.description)
}

#[async_trait]
impl SeverityJudge for ProviderSeverityJudge {
    async fn judge(
        &self,
        old: &Criterion,
        new: &Criterion,
        changes: &[FieldChange],
    ) -> Result<Judgement, DiffError> {
        let template = self
            .templates
            .template("change_assessment")
            .map_err(|e| DiffError::SchemaParse {
                what: "change_assessment template",
                message: e.to_string(),
            })?;
        let listing = changes
            .iter()
            .map(|c| format!("{}: {} -> {}", c.field, c.old, c.new))
            .collect::<Vec<_>>()
            .join("; ");
        let old_text = describe(old);
        let new_text = describe(new);
        let prompt = render(
            &template,
            &[
                ("old", old_text.as_str()),
                ("new", new_text.as_str()),
                ("changes", listing.as_str()),
            ],
        );

        let dispatched = self
            .gateway
            .dispatch(
                TaskCategory::ChangeAssessment,
                Payload::json("You assess coverage policy changes.", prompt),
            )
            .await?;
        serde_json::from_value(dispatched.json_value()).map_err(|e| DiffError::SchemaParse {
            what: "change_assessment",
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CategoryRoute, InMemoryMetricsSink, ReasoningProvider, RoutingConfig, ScriptedProvider};
    use crate::models::{CriterionCategory, ThresholdValue};
    use crate::pipeline::prompt::BuiltinTemplates;

    fn age(op: ThresholdOperator, value: f64) -> Criterion {
        Criterion::new("age", CriterionCategory::Demographics, "Minimum age")
            .with_threshold(op, value, Some("years"))
    }

    #[test]
    fn raised_minimum_is_breaking() {
        let cmp = compare_criteria(&age(ThresholdOperator::Gte, 18.0), &age(ThresholdOperator::Gte, 21.0));
        assert_eq!(cmp.severity(), Severity::Breaking);
        assert!(!cmp.ambiguous);
        assert_eq!(cmp.changes[0].field, "threshold.value");
    }

    #[test]
    fn lowered_minimum_is_minor() {
        let cmp = compare_criteria(&age(ThresholdOperator::Gte, 21.0), &age(ThresholdOperator::Gte, 18.0));
        assert_eq!(cmp.severity(), Severity::Minor);
    }

    #[test]
    fn lowered_maximum_is_breaking() {
        let cmp = compare_criteria(&age(ThresholdOperator::Lte, 7.5), &age(ThresholdOperator::Lte, 7.0));
        assert_eq!(cmp.severity(), Severity::Breaking);
    }

    #[test]
    fn operator_change_is_ambiguous() {
        let cmp = compare_criteria(&age(ThresholdOperator::Gte, 18.0), &age(ThresholdOperator::Gt, 18.0));
        assert!(cmp.ambiguous);
        assert_eq!(cmp.severity(), Severity::Material);
    }

    #[test]
    fn set_edit_is_ambiguous() {
        let mut old = age(ThresholdOperator::In, 0.0);
        let mut new = old.clone();
        if let Some(t) = old.threshold.as_mut() {
            t.value = ThresholdValue::List(vec!["rheumatology".into()]);
        }
        if let Some(t) = new.threshold.as_mut() {
            t.value = ThresholdValue::List(vec!["rheumatology".into(), "dermatology".into()]);
        }
        assert!(compare_criteria(&old, &new).ambiguous);
    }

    #[test]
    fn required_flip_and_wording() {
        let old = age(ThresholdOperator::Gte, 18.0).optional();
        let new = age(ThresholdOperator::Gte, 18.0).with_description("Adults only");
        let cmp = compare_criteria(&old, &new);
        assert_eq!(cmp.severity(), Severity::Breaking);
        assert!(cmp.changes.iter().any(|c| c.field == "description" && c.severity == Severity::Cosmetic));
    }

    #[test]
    fn wording_only_is_cosmetic() {
        let old = age(ThresholdOperator::Gte, 18.0).with_description("At least 18");
        let new = age(ThresholdOperator::Gte, 18.0).with_description("At least  18 years");
        assert_eq!(compare_criteria(&old, &new).severity(), Severity::Cosmetic);
        assert!(compare_criteria(&old, &old.clone()).changes.is_empty());
    }

    #[test]
    fn code_and_drug_changes_are_material() {
        let old = age(ThresholdOperator::Gte, 18.0).with_code(CodeSystem::Icd10, "M06.9");
        let new = age(ThresholdOperator::Gte, 18.0).with_code(CodeSystem::Icd10Cm, "m06.9").with_drug("methotrexate");
        let cmp = compare_criteria(&old, &new);
        assert_eq!(cmp.changes.len(), 1);
        assert_eq!(cmp.changes[0].field, "drug_names");
        assert_eq!(cmp.severity(), Severity::Material);
    }

    #[test]
    fn added_and_removed_rules() {
        let required = age(ThresholdOperator::Gte, 18.0);
        let optional = required.clone().optional();
        assert_eq!(added_criterion_severity(&required), Severity::Breaking);
        assert_eq!(added_criterion_severity(&optional), Severity::Material);
        assert_eq!(removed_criterion_severity(&optional), Severity::Breaking);
        assert_eq!(removed_criterion_severity(&required), Severity::Material);
    }

    fn indication(min_age: Option<f64>) -> Indication {
        Indication {
            id: "ra".into(),
            name: "Rheumatoid arthritis".into(),
            codes: Vec::new(),
            initial_group: None,
            continuation_group: None,
            approval_duration_months: Some(12),
            min_age_years: min_age,
            max_age_years: None,
        }
    }

    #[test]
    fn indication_age_floor_raised_is_breaking() {
        let changes = compare_indications(&indication(Some(18.0)), &indication(Some(21.0)));
        assert_eq!(max_severity(&changes), Severity::Breaking);
        let changes = compare_indications(&indication(Some(18.0)), &indication(None));
        assert_eq!(max_severity(&changes), Severity::Minor);
    }

    #[test]
    fn exclusion_triggers_follow_criterion_matching() {
        let old = Exclusion {
            id: "tb".into(),
            name: "Active TB".into(),
            description: String::new(),
            trigger_criteria: vec!["tb_test".into()],
        };
        let mut new = old.clone();
        new.trigger_criteria = vec!["tb_screen".into()];
        let ids = HashMap::from([("tb_test".to_string(), "tb_screen".to_string())]);
        assert!(compare_exclusions(&old, &new, &ids).is_empty());
        assert_eq!(
            max_severity(&compare_exclusions(&old, &new, &HashMap::new())),
            Severity::Breaking
        );
    }

    #[tokio::test]
    async fn provider_judge_parses_verdict() {
        let provider = Arc::new(
            ScriptedProvider::new("judge").reply(r#"{"severity": "minor", "rationale": "gt vs gte at same bound"}"#),
        );
        let config = RoutingConfig::empty().with_route(TaskCategory::ChangeAssessment, CategoryRoute::new(&["judge"]));
        let gateway = Gateway::new(
            config,
            vec![provider.clone() as Arc<dyn ReasoningProvider>],
            Arc::new(InMemoryMetricsSink::new()),
        )
        .unwrap();
        let judge = ProviderSeverityJudge::new(Arc::new(gateway), Arc::new(BuiltinTemplates));

        let old = age(ThresholdOperator::Gte, 18.0);
        let new = age(ThresholdOperator::Gt, 18.0);
        let cmp = compare_criteria(&old, &new);
        let verdict = judge.judge(&old, &new, &cmp.changes).await.unwrap();
        assert_eq!(verdict.severity, Severity::Minor);
        assert!(provider.requests()[0].prompt.contains("threshold.operator"));
    }
}
