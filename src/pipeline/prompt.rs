//! Prompt templates and `{name}` substitution.
//!
//! Templates are resolved by name through [`TemplateResolver`]. The built-in
//! set ships with the crate; [`FileTemplateResolver`] lets a deployment
//! override any of them with `<dir>/<name>.txt`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex, PoisonError};

use regex::Regex;
use thiserror::Error;

pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are an insurance coverage policy analyst. Your ONLY role is to convert the
text of a payer's drug coverage policy into structured criteria.

RULES (ABSOLUTE, NO EXCEPTIONS):
1. Extract ONLY criteria explicitly stated in the document.
2. Every criterion MUST cite the page it came from and a short verbatim excerpt.
3. Preserve exact thresholds, units, codes and drug names.
4. Output MUST be a single JSON object, no commentary.
"#;

pub const VALIDATION_SYSTEM_PROMPT: &str = r#"
You are an independent reviewer of insurance coverage policies. Derive the
coverage criteria from the source text yourself. Do not assume any prior
extraction exists. Output MUST be a single JSON object, no commentary.
"#;

const EXTRACTION_TEMPLATE: &str = r#"
Payer: {payer}
Medication: {medication}
{hint}
<document>
{document}
</document>

Extract every coverage criterion, criterion group, indication, exclusion and
safety screening into this JSON structure:

```json
{
  "policy_title": "title or null",
  "effective_date": "YYYY-MM-DD or null",
  "criteria": [
    {
      "id": "short unique id, e.g. ra_age",
      "category": "diagnosis | lab | step_therapy | prescriber | safety | documentation | exclusion | demographics | other",
      "name": "short name",
      "description": "full requirement",
      "threshold": {"operator": "eq | ne | gt | gte | lt | lte | between | in | not_in", "value": 18, "upper": null, "unit": "years"} ,
      "required": true,
      "clinical_codes": [{"system": "ICD-10 | HCPCS | CPT | NDC | LOINC", "code": "M05.79", "display": "optional"}],
      "drug_names": ["methotrexate"],
      "patient_field": "age | bmi | hba1c | ... or null",
      "source_page": 1,
      "source_excerpt": "verbatim text"
    }
  ],
  "groups": [{"id": "ra_initial", "name": "RA initial approval", "operator": "AND | OR | NOT", "criteria": ["ra_age"], "subgroups": []}],
  "indications": [{"id": "ra", "name": "Rheumatoid arthritis", "codes": [], "initial_group": "ra_initial", "continuation_group": null, "approval_duration_months": 12, "min_age_years": 18, "max_age_years": null}],
  "exclusions": [{"id": "active_tb", "name": "Active tuberculosis", "description": "...", "trigger_criteria": []}],
  "safety_screenings": [{"name": "TB screening", "description": "...", "required": true}]
}
```
Use null for a missing threshold. Every id referenced by a group, indication
or exclusion must be defined in the same response.
"#;

const VALIDATION_TEMPLATE: &str = r#"
Payer: {payer}
Medication: {medication}

<document>
{document}
</document>

Independently list every coverage criterion this document states, as JSON:

```json
{
  "criteria": [
    {
      "id": "short id",
      "category": "diagnosis | lab | step_therapy | prescriber | safety | documentation | exclusion | demographics | other",
      "name": "short name",
      "description": "full requirement",
      "threshold": {"operator": "gte", "value": 18, "unit": "years"},
      "required": true,
      "clinical_codes": [],
      "drug_names": [],
      "source_page": 1,
      "source_excerpt": "verbatim text"
    }
  ]
}
```
"#;

const REFERENCE_LOOKUP_TEMPLATE: &str = r#"
For each clinical or billing code below, state whether it is a currently valid
code in its system, a deprecated one, or unknown to you.

{codes}

Respond with JSON: {"codes": [{"system": "ICD-10", "code": "M05.79", "status": "valid | deprecated | unknown"}]}
"#;

const CRITERION_MATCHING_TEMPLATE: &str = r#"
Two versions of the same coverage policy were extracted independently, so their
criterion ids are unrelated. Score how likely each OLD criterion is the same
rule as each NEW criterion, from 0.0 (unrelated) to 1.0 (same rule, possibly
with changed values).

OLD:
{old_criteria}

NEW:
{new_criteria}

Respond with JSON: {"scores": [[...one score per NEW criterion...], ...one row per OLD criterion...]}
"#;

const CHANGE_ASSESSMENT_TEMPLATE: &str = r#"
A coverage criterion changed between policy versions.

OLD: {old}
NEW: {new}
CHANGED FIELDS: {changes}

Classify how this affects patients who previously qualified:
- breaking: some previously approved patients would no longer qualify
- material: requirements changed but prior approvals are not clearly invalidated
- minor: the rule became easier to satisfy
- cosmetic: wording only

Respond with JSON: {"severity": "breaking | material | minor | cosmetic", "rationale": "one sentence"}
"#;

const CRITERION_EVALUATION_TEMPLATE: &str = r#"
Coverage criterion:
{criterion}

Patient record:
{patient}

Decide whether the patient meets this criterion using only the record above.

Respond with JSON: {"met": true | false | null, "confidence": 0.0-1.0, "evidence": ["..."], "gaps": ["missing documentation ..."]}
"#;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").unwrap());

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("prompt template not found: {0}")]
    NotFound(String),

    #[error("invalid template name: {0}")]
    InvalidName(String),

    #[error("I/O error reading template: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves a template body by name.
pub trait TemplateResolver: Send + Sync {
    fn template(&self, name: &str) -> Result<String, TemplateError>;
}

/// Templates compiled into the crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTemplates;

impl TemplateResolver for BuiltinTemplates {
    fn template(&self, name: &str) -> Result<String, TemplateError> {
        let body = match name {
            "extraction" => EXTRACTION_TEMPLATE,
            "validation" => VALIDATION_TEMPLATE,
            "reference_lookup" => REFERENCE_LOOKUP_TEMPLATE,
            "criterion_matching" => CRITERION_MATCHING_TEMPLATE,
            "change_assessment" => CHANGE_ASSESSMENT_TEMPLATE,
            "criterion_evaluation" => CRITERION_EVALUATION_TEMPLATE,
            _ => return Err(TemplateError::NotFound(name.to_string())),
        };
        Ok(body.to_string())
    }
}

/// Reads `<dir>/<name>.txt`, caching bodies; falls back to the built-ins.
pub struct FileTemplateResolver {
    dir: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileTemplateResolver {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl TemplateResolver for FileTemplateResolver {
    fn template(&self, name: &str) -> Result<String, TemplateError> {
        if !is_safe_name(name) {
            return Err(TemplateError::InvalidName(name.to_string()));
        }
        if let Some(body) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(body.clone());
        }

        let path = self.dir.join(format!("{name}.txt"));
        let body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BuiltinTemplates.template(name)?,
            Err(e) => return Err(TemplateError::Io(e)),
        };

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), body.clone());
        Ok(body)
    }
}

/// Substitute `{name}` placeholders in one pass. Unknown placeholders and
/// literal JSON braces are left untouched; values are never re-scanned.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_placeholders() {
        let out = render("Hi {name}, {unknown} {\"json\": 1}", &[("name", "Ada")]);
        assert_eq!(out, "Hi Ada, {unknown} {\"json\": 1}");
    }

    #[test]
    fn render_does_not_rescan_values() {
        let out = render("{a} {b}", &[("a", "{b}"), ("b", "x")]);
        assert_eq!(out, "{b} x");
    }

    #[test]
    fn builtins_cover_every_stage() {
        for name in [
            "extraction",
            "validation",
            "reference_lookup",
            "criterion_matching",
            "change_assessment",
            "criterion_evaluation",
        ] {
            assert!(BuiltinTemplates.template(name).is_ok(), "{name}");
        }
        assert!(matches!(
            BuiltinTemplates.template("nope"),
            Err(TemplateError::NotFound(_))
        ));
    }

    #[test]
    fn extraction_template_keeps_json_example() {
        let body = BuiltinTemplates.template("extraction").unwrap();
        let out = render(&body, &[("document", "TEXT"), ("payer", "P"), ("medication", "M"), ("hint", "")]);
        assert!(out.contains("<document>\nTEXT\n</document>"));
        assert!(out.contains("\"criteria\": ["));
    }

    #[test]
    fn file_resolver_overrides_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("validation.txt"), "custom {document}").unwrap();
        let resolver = FileTemplateResolver::new(dir.path().to_path_buf());
        assert_eq!(resolver.template("validation").unwrap(), "custom {document}");
        assert!(resolver.template("extraction").unwrap().contains("<document>"));
    }

    #[test]
    fn file_resolver_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileTemplateResolver::new(dir.path().to_path_buf());
        assert!(matches!(
            resolver.template("../secrets"),
            Err(TemplateError::InvalidName(_))
        ));
    }
}
