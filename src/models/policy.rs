use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{
    CodeStatus, CodeSystem, CriterionCategory, ExtractionQuality, GroupOperator,
    ThresholdOperator, ValidationAction,
};

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.8
}

// ═══════════════════════════════════════════════════════════
// Criteria
// ═══════════════════════════════════════════════════════════

/// Threshold operand. Numbers stay numeric; providers sometimes quote them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl ThresholdValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ThresholdValue::Number(n) => Some(*n),
            ThresholdValue::Text(s) => s.trim().parse().ok(),
            ThresholdValue::List(_) => None,
        }
    }

    /// Values as lowercase strings, for set membership checks.
    pub fn as_set(&self) -> Vec<String> {
        match self {
            ThresholdValue::Number(n) => vec![n.to_string()],
            ThresholdValue::Text(s) => s
                .split(',')
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect(),
            ThresholdValue::List(items) => items.iter().map(|v| v.trim().to_lowercase()).collect(),
        }
    }
}

impl std::fmt::Display for ThresholdValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThresholdValue::Number(n) => write!(f, "{n}"),
            ThresholdValue::Text(s) => f.write_str(s),
            ThresholdValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub operator: ThresholdOperator,
    pub value: ThresholdValue,
    /// Upper bound for `between`.
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.operator, self.value)?;
        if let Some(upper) = self.upper {
            write!(f, "..{upper}")?;
        }
        if let Some(unit) = &self.unit {
            write!(f, " {unit}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalCode {
    pub system: CodeSystem,
    pub code: String,
    #[serde(default)]
    pub display: Option<String>,
    /// Written by the reference stage.
    #[serde(default)]
    pub status: Option<CodeStatus>,
}

impl ClinicalCode {
    pub fn new(system: CodeSystem, code: &str) -> Self {
        Self {
            system,
            code: code.trim().to_string(),
            display: None,
            status: None,
        }
    }

    /// Identity used for comparisons: system family plus uppercase code.
    pub fn key(&self) -> (CodeSystem, String) {
        (self.system.family(), self.code.trim().to_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub action: ValidationAction,
    #[serde(default)]
    pub rationale: String,
}

/// One atomic coverage rule.
///
/// `id` is only stable within a single policy version; cross-version identity
/// is established by the diff engine's matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub category: CriterionCategory,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub threshold: Option<Threshold>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub clinical_codes: Vec<ClinicalCode>,
    #[serde(default)]
    pub drug_names: Vec<String>,
    /// Patient fact the criterion tests, e.g. `age` or `hba1c`.
    #[serde(default)]
    pub patient_field: Option<String>,
    #[serde(default)]
    pub source_page: Option<u32>,
    #[serde(default)]
    pub source_excerpt: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub validation: Option<ValidationOutcome>,
}

impl Criterion {
    pub fn new(id: &str, category: CriterionCategory, name: &str) -> Self {
        Self {
            id: id.to_string(),
            category,
            name: name.to_string(),
            description: String::new(),
            threshold: None,
            required: true,
            clinical_codes: Vec::new(),
            drug_names: Vec::new(),
            patient_field: None,
            source_page: None,
            source_excerpt: None,
            confidence: default_confidence(),
            validation: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_threshold(mut self, operator: ThresholdOperator, value: f64, unit: Option<&str>) -> Self {
        self.threshold = Some(Threshold {
            operator,
            value: ThresholdValue::Number(value),
            upper: None,
            unit: unit.map(str::to_string),
        });
        self
    }

    pub fn with_code(mut self, system: CodeSystem, code: &str) -> Self {
        self.clinical_codes.push(ClinicalCode::new(system, code));
        self
    }

    pub fn with_drug(mut self, drug: &str) -> Self {
        self.drug_names.push(drug.to_string());
        self
    }

    pub fn with_field(mut self, field: &str) -> Self {
        self.patient_field = Some(field.to_string());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn on_page(mut self, page: u32, excerpt: &str) -> Self {
        self.source_page = Some(page);
        self.source_excerpt = Some(excerpt.to_string());
        self
    }

    pub fn validation_action(&self) -> Option<ValidationAction> {
        self.validation.as_ref().map(|v| v.action)
    }
}

// ═══════════════════════════════════════════════════════════
// Logical structure
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub operator: GroupOperator,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub subgroups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indication {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub codes: Vec<ClinicalCode>,
    /// Root group for initial approval.
    #[serde(default)]
    pub initial_group: Option<String>,
    #[serde(default)]
    pub continuation_group: Option<String>,
    #[serde(default)]
    pub approval_duration_months: Option<u32>,
    #[serde(default)]
    pub min_age_years: Option<f64>,
    #[serde(default)]
    pub max_age_years: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub trigger_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyScreening {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

// ═══════════════════════════════════════════════════════════
// Digitized policy
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_page: u32,
    #[serde(default)]
    pub source_excerpt: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub validation_action: Option<ValidationAction>,
    /// Code → reference status.
    #[serde(default)]
    pub code_results: BTreeMap<String, CodeStatus>,
}

/// Canonical structured form of one policy document.
///
/// Immutable once assembled. `version` is assigned by the store; later
/// versions of the same (payer, medication) supersede it, nothing deletes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitizedPolicy {
    pub payer: String,
    pub medication: String,
    pub version: u32,
    #[serde(default)]
    pub policy_title: Option<String>,
    #[serde(default)]
    pub effective_date: Option<String>,
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub groups: Vec<CriterionGroup>,
    #[serde(default)]
    pub indications: Vec<Indication>,
    #[serde(default)]
    pub exclusions: Vec<Exclusion>,
    #[serde(default)]
    pub safety_screenings: Vec<SafetyScreening>,
    pub extraction_quality: ExtractionQuality,
    pub provenance: BTreeMap<String, Provenance>,
    pub source_hash: String,
    pub extraction_provider: String,
    pub validation_provider: String,
    pub created_at: DateTime<Utc>,
}

impl DigitizedPolicy {
    pub fn criterion(&self, id: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.id == id)
    }

    pub fn group(&self, id: &str) -> Option<&CriterionGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Same payer and medication, compared case-insensitively.
    pub fn same_subject(&self, other: &DigitizedPolicy) -> bool {
        self.payer.trim().eq_ignore_ascii_case(other.payer.trim())
            && self.medication.trim().eq_ignore_ascii_case(other.medication.trim())
    }

    pub fn label(&self) -> String {
        format!("{}/{} v{}", self.payer, self.medication, self.version)
    }
}
