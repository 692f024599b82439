//! Clinical and billing code verification.
//!
//! Codes are checked against a local reference table first. A code the
//! table does not know may optionally be put to the `reference_lookup`
//! provider. Nothing in this stage aborts a run: the worst outcome for a
//! code is `unknown`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::prompt::{render, TemplateResolver};
use crate::gateway::{Gateway, Payload, TaskCategory};
use crate::models::{ClinicalCode, CodeStatus, CodeSystem, Criterion, Indication};

const BUNDLED_REFERENCE: &str = include_str!("../../resources/reference_codes.json");

static ICD10_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]\d{2}(\.[0-9A-Z]{1,4})?$").unwrap());
static HCPCS_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z]\d{4}$").unwrap());
static CPT_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}[0-9A-Z]$").unwrap());
static NDC_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4,5}-\d{3,4}-\d{1,2}|\d{11})$").unwrap());
static LOINC_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,7}-\d$").unwrap());

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("I/O error reading reference table: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid reference table: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub system: CodeSystem,
    pub code: String,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Deserialize)]
struct ReferenceFile {
    codes: Vec<ReferenceEntry>,
}

/// Known codes keyed by (system family, uppercase code).
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    entries: HashMap<(CodeSystem, String), ReferenceEntry>,
}

impl ReferenceTable {
    /// The table compiled into the crate. Empty if it fails to parse.
    pub fn bundled() -> Self {
        Self::from_json(BUNDLED_REFERENCE).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Bundled reference table is invalid, starting empty");
            Self::default()
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ReferenceError> {
        let file: ReferenceFile = serde_json::from_str(json)?;
        Ok(Self::from_entries(file.codes))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ReferenceEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| ((e.system.family(), e.code.trim().to_uppercase()), e))
            .collect();
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, ReferenceError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, code: &ClinicalCode) -> Option<&ReferenceEntry> {
        self.entries.get(&code.key())
    }

    /// Status from the table alone. Malformed codes are never valid.
    pub fn status(&self, code: &ClinicalCode) -> CodeStatus {
        if !is_well_formed(code) {
            return CodeStatus::Unknown;
        }
        match self.lookup(code) {
            Some(entry) if entry.deprecated => CodeStatus::Deprecated,
            Some(_) => CodeStatus::Valid,
            None => CodeStatus::Unknown,
        }
    }
}

/// Syntactic check for the systems with a fixed code shape.
pub fn is_well_formed(code: &ClinicalCode) -> bool {
    let value = code.code.trim().to_uppercase();
    match code.system.family() {
        CodeSystem::Icd10 => ICD10_CODE.is_match(&value),
        CodeSystem::Hcpcs => HCPCS_CODE.is_match(&value),
        CodeSystem::Cpt => CPT_CODE.is_match(&value),
        CodeSystem::Ndc => NDC_CODE.is_match(&value),
        CodeSystem::Loinc => LOINC_CODE.is_match(&value),
        _ => !value.is_empty(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReferenceSummary {
    pub valid: usize,
    pub unknown: usize,
    pub deprecated: usize,
}

impl ReferenceSummary {
    fn count(&mut self, status: CodeStatus) {
        match status {
            CodeStatus::Valid => self.valid += 1,
            CodeStatus::Unknown => self.unknown += 1,
            CodeStatus::Deprecated => self.deprecated += 1,
        }
    }

    pub fn has_problems(&self) -> bool {
        self.unknown > 0 || self.deprecated > 0
    }
}

fn all_codes_mut<'a>(
    criteria: &'a mut [Criterion],
    indications: &'a mut [Indication],
) -> impl Iterator<Item = &'a mut ClinicalCode> {
    criteria
        .iter_mut()
        .flat_map(|c| c.clinical_codes.iter_mut())
        .chain(indications.iter_mut().flat_map(|i| i.codes.iter_mut()))
}

/// Write a table-derived status onto every code.
pub fn annotate_codes(
    criteria: &mut [Criterion],
    indications: &mut [Indication],
    table: &ReferenceTable,
) -> ReferenceSummary {
    let mut summary = ReferenceSummary::default();
    for code in all_codes_mut(criteria, indications) {
        let status = table.status(code);
        if code.display.is_none() {
            code.display = table.lookup(code).and_then(|e| e.display.clone());
        }
        code.status = Some(status);
        summary.count(status);
    }
    summary
}

#[derive(Deserialize)]
struct LookupResponse {
    codes: Vec<LookupResult>,
}

#[derive(Deserialize)]
struct LookupResult {
    system: CodeSystem,
    code: String,
    status: CodeStatus,
}

async fn provider_statuses(
    gateway: &Gateway,
    templates: &dyn TemplateResolver,
    codes: &[ClinicalCode],
) -> BTreeMap<(CodeSystem, String), CodeStatus> {
    let template = match templates.template("reference_lookup") {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "Reference lookup template unavailable");
            return BTreeMap::new();
        }
    };
    let listing = codes
        .iter()
        .map(|c| format!("- {} {}", c.system, c.code))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = render(&template, &[("codes", listing.as_str())]);

    let dispatched = match gateway
        .dispatch(
            TaskCategory::ReferenceLookup,
            Payload::json("You verify clinical and billing codes.", prompt),
        )
        .await
    {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "Reference lookup failed, codes stay unknown");
            return BTreeMap::new();
        }
    };

    match serde_json::from_value::<LookupResponse>(dispatched.json_value()) {
        Ok(response) => response
            .codes
            .into_iter()
            .map(|r| ((r.system.family(), r.code.trim().to_uppercase()), r.status))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Reference lookup response malformed");
            BTreeMap::new()
        }
    }
}

/// Table annotation, then an optional provider lookup for codes still unknown.
/// Never fails.
pub async fn annotate_with_lookup(
    criteria: &mut [Criterion],
    indications: &mut [Indication],
    table: &ReferenceTable,
    lookup: Option<(&Gateway, &dyn TemplateResolver)>,
) -> ReferenceSummary {
    let summary = annotate_codes(criteria, indications, table);
    let Some((gateway, templates)) = lookup else {
        return summary;
    };

    // Only well-formed codes are worth asking about.
    let mut pending: Vec<ClinicalCode> = all_codes_mut(criteria, indications)
        .filter(|c| c.status == Some(CodeStatus::Unknown) && is_well_formed(c))
        .map(|c| c.clone())
        .collect();
    pending.sort_by_key(ClinicalCode::key);
    pending.dedup_by_key(|c| c.key());
    if pending.is_empty() {
        return summary;
    }

    let resolved = provider_statuses(gateway, templates, &pending).await;
    if resolved.is_empty() {
        return summary;
    }

    let mut summary = ReferenceSummary::default();
    for code in all_codes_mut(criteria, indications) {
        if code.status == Some(CodeStatus::Unknown) {
            if let Some(status) = resolved.get(&code.key()) {
                code.status = Some(*status);
            }
        }
        summary.count(code.status.unwrap_or(CodeStatus::Unknown));
    }
    tracing::debug!(
        resolved = resolved.len(),
        unknown = summary.unknown,
        "Provider reference lookup applied"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        CategoryRoute, InMemoryMetricsSink, ProviderError, ReasoningProvider, RoutingConfig,
        ScriptedProvider,
    };
    use crate::models::CriterionCategory;
    use crate::pipeline::prompt::BuiltinTemplates;
    use std::sync::Arc;

    fn criteria() -> Vec<Criterion> {
        vec![Criterion::new("dx", CriterionCategory::Diagnosis, "RA diagnosis")
            .with_code(CodeSystem::Icd10Cm, "m05.79")
            .with_code(CodeSystem::Icd10, "Z99.999")
            .with_code(CodeSystem::Cpt, "99201")
            .with_code(CodeSystem::Hcpcs, "JUNK")]
    }

    fn statuses(criteria: &[Criterion]) -> Vec<Option<CodeStatus>> {
        criteria[0].clinical_codes.iter().map(|c| c.status).collect()
    }

    #[test]
    fn bundled_table_loads() {
        let table = ReferenceTable::bundled();
        assert!(!table.is_empty());
        let code = ClinicalCode::new(CodeSystem::Hcpcs, "J0135");
        assert_eq!(table.status(&code), CodeStatus::Valid);
    }

    #[test]
    fn table_annotation_marks_every_code() {
        let mut criteria = criteria();
        let summary = annotate_codes(&mut criteria, &mut [], &ReferenceTable::bundled());
        assert_eq!(
            statuses(&criteria),
            vec![
                Some(CodeStatus::Valid),
                Some(CodeStatus::Unknown),
                Some(CodeStatus::Deprecated),
                Some(CodeStatus::Unknown),
            ]
        );
        assert_eq!(summary, ReferenceSummary { valid: 1, unknown: 2, deprecated: 1 });
        assert!(criteria[0].clinical_codes[0].display.is_some());
    }

    #[test]
    fn indication_codes_are_annotated() {
        let mut indications = vec![Indication {
            id: "ra".into(),
            name: "RA".into(),
            codes: vec![ClinicalCode::new(CodeSystem::Icd10, "M06.9")],
            initial_group: None,
            continuation_group: None,
            approval_duration_months: None,
            min_age_years: None,
            max_age_years: None,
        }];
        annotate_codes(&mut [], &mut indications, &ReferenceTable::bundled());
        assert_eq!(indications[0].codes[0].status, Some(CodeStatus::Valid));
    }

    #[test]
    fn code_shapes() {
        assert!(is_well_formed(&ClinicalCode::new(CodeSystem::Icd10, "E11.9")));
        assert!(!is_well_formed(&ClinicalCode::new(CodeSystem::Icd10, "11.9")));
        assert!(is_well_formed(&ClinicalCode::new(CodeSystem::Ndc, "00074-4339-02")));
        assert!(is_well_formed(&ClinicalCode::new(CodeSystem::Loinc, "4548-4")));
        assert!(!is_well_formed(&ClinicalCode::new(CodeSystem::Cpt, "865")));
    }

    fn gateway(provider: ScriptedProvider) -> Gateway {
        let config = RoutingConfig::empty()
            .with_route(TaskCategory::ReferenceLookup, CategoryRoute::new(&["ref"]));
        Gateway::new(
            config,
            vec![Arc::new(provider) as Arc<dyn ReasoningProvider>],
            Arc::new(InMemoryMetricsSink::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn provider_lookup_resolves_unknown_codes() {
        let gw = gateway(ScriptedProvider::new("ref").reply(
            r#"{"codes": [{"system": "ICD-10", "code": "Z99.999", "status": "valid"}]}"#,
        ));
        let mut criteria = criteria();
        let summary = annotate_with_lookup(
            &mut criteria,
            &mut [],
            &ReferenceTable::bundled(),
            Some((&gw, &BuiltinTemplates)),
        )
        .await;
        assert_eq!(criteria[0].clinical_codes[1].status, Some(CodeStatus::Valid));
        // Malformed code is never sent and stays unknown.
        assert_eq!(criteria[0].clinical_codes[3].status, Some(CodeStatus::Unknown));
        assert_eq!(summary, ReferenceSummary { valid: 2, unknown: 1, deprecated: 1 });
    }

    #[tokio::test]
    async fn provider_failure_leaves_codes_unknown() {
        let gw = gateway(ScriptedProvider::new("ref").always_fail(ProviderError::RateLimited));
        let mut criteria = criteria();
        let summary = annotate_with_lookup(
            &mut criteria,
            &mut [],
            &ReferenceTable::bundled(),
            Some((&gw, &BuiltinTemplates)),
        )
        .await;
        assert_eq!(summary.unknown, 2);
        assert_eq!(criteria[0].clinical_codes[1].status, Some(CodeStatus::Unknown));
    }
}
