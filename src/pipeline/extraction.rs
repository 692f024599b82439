use serde::Deserialize;
use serde_json::Value;

use super::document::PolicyDocument;
use super::prompt::{render, TemplateResolver, EXTRACTION_SYSTEM_PROMPT};
use super::{PipelineError, Stage};
use crate::gateway::{Gateway, Payload, TaskCategory};
use crate::models::{Criterion, CriterionGroup, Exclusion, Indication, SafetyScreening};

/// Wire schema of an extraction response. `criteria` is mandatory.
#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    policy_title: Option<String>,
    #[serde(default)]
    effective_date: Option<String>,
    criteria: Vec<Criterion>,
    #[serde(default)]
    groups: Vec<CriterionGroup>,
    #[serde(default)]
    indications: Vec<Indication>,
    #[serde(default)]
    exclusions: Vec<Exclusion>,
    #[serde(default)]
    safety_screenings: Vec<SafetyScreening>,
}

/// Extraction output before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExtractionResult {
    pub policy_title: Option<String>,
    pub effective_date: Option<String>,
    pub criteria: Vec<Criterion>,
    pub groups: Vec<CriterionGroup>,
    pub indications: Vec<Indication>,
    pub exclusions: Vec<Exclusion>,
    pub safety_screenings: Vec<SafetyScreening>,
    /// Provider that actually served the extraction.
    pub provider: String,
    pub source_hash: String,
}

/// Strictly parse an extraction response.
pub fn parse_extraction(
    json: Value,
    provider: &str,
    source_hash: &str,
) -> Result<RawExtractionResult, PipelineError> {
    let payload: ExtractionPayload =
        serde_json::from_value(json).map_err(|e| PipelineError::SchemaParse {
            stage: Stage::Extraction,
            message: e.to_string(),
        })?;

    if payload.criteria.is_empty() && payload.indications.is_empty() {
        return Err(PipelineError::EmptyExtraction);
    }

    let mut criteria = payload.criteria;
    for criterion in &mut criteria {
        criterion.id = criterion.id.trim().to_string();
        if criterion.id.is_empty() {
            return Err(PipelineError::SchemaParse {
                stage: Stage::Extraction,
                message: format!("criterion '{}' has an empty id", criterion.name),
            });
        }
        criterion.confidence = criterion.confidence.clamp(0.0, 1.0);
        criterion.validation = None;
    }

    Ok(RawExtractionResult {
        policy_title: payload.policy_title,
        effective_date: payload.effective_date,
        criteria,
        groups: payload.groups,
        indications: payload.indications,
        exclusions: payload.exclusions,
        safety_screenings: payload.safety_screenings,
        provider: provider.to_string(),
        source_hash: source_hash.to_string(),
    })
}

/// Run one extraction pass. `hint` names criteria a previous pass missed.
pub async fn extract_policy(
    gateway: &Gateway,
    templates: &dyn TemplateResolver,
    document: &PolicyDocument,
    payer: &str,
    medication: &str,
    hint: Option<&str>,
) -> Result<RawExtractionResult, PipelineError> {
    let template = templates.template("extraction")?;
    let hint = hint
        .map(|h| format!("NOTE: a previous pass missed these criteria, check for them: {h}\n"))
        .unwrap_or_default();
    let document_text = document.render_for_prompt();
    let prompt = render(
        &template,
        &[
            ("payer", payer),
            ("medication", medication),
            ("hint", hint.as_str()),
            ("document", document_text.as_str()),
        ],
    );

    let dispatched = gateway
        .dispatch(
            TaskCategory::DataExtraction,
            Payload::json(EXTRACTION_SYSTEM_PROMPT, prompt),
        )
        .await
        .map_err(PipelineError::gateway(Stage::Extraction))?;

    let result = parse_extraction(dispatched.json_value(), &dispatched.provider, document.source_hash())?;
    tracing::info!(
        provider = %result.provider,
        criteria = result.criteria.len(),
        groups = result.groups.len(),
        indications = result.indications.len(),
        "Extraction complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_payload() {
        let json = json!({
            "policy_title": "Adalimumab",
            "criteria": [
                {"id": " ra_age ", "category": "demographics", "name": "Adult",
                 "threshold": {"operator": "gte", "value": 18, "unit": "years"},
                 "source_page": 1, "confidence": 1.7}
            ],
            "groups": [{"id": "g1", "operator": "AND", "criteria": ["ra_age"]}]
        });
        let raw = parse_extraction(json, "gemini", "abcd").unwrap();
        assert_eq!(raw.criteria[0].id, "ra_age");
        assert_eq!(raw.criteria[0].confidence, 1.0);
        assert_eq!(raw.groups.len(), 1);
        assert_eq!(raw.provider, "gemini");
        assert_eq!(raw.policy_title.as_deref(), Some("Adalimumab"));
    }

    #[test]
    fn missing_criteria_key_is_schema_error() {
        let err = parse_extraction(json!({"groups": []}), "p", "h").unwrap_err();
        assert!(matches!(err, PipelineError::SchemaParse { stage: Stage::Extraction, .. }));
    }

    #[test]
    fn wrong_field_type_is_schema_error() {
        let json = json!({"criteria": [{"id": "c", "category": "lab", "name": "x", "required": "sometimes"}]});
        assert!(matches!(
            parse_extraction(json, "p", "h"),
            Err(PipelineError::SchemaParse { .. })
        ));
    }

    #[test]
    fn empty_extraction_is_rejected() {
        let err = parse_extraction(json!({"criteria": []}), "p", "h").unwrap_err();
        assert!(matches!(err, PipelineError::EmptyExtraction));
    }

    #[test]
    fn indications_alone_are_enough() {
        let json = json!({"criteria": [], "indications": [{"id": "ra", "name": "RA"}]});
        assert!(parse_extraction(json, "p", "h").is_ok());
    }

    #[test]
    fn blank_id_is_schema_error() {
        let json = json!({"criteria": [{"id": "  ", "category": "lab", "name": "x"}]});
        assert!(matches!(
            parse_extraction(json, "p", "h"),
            Err(PipelineError::SchemaParse { .. })
        ));
    }
}
