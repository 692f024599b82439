use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{ChangeType, DiffSubject, ImpactLevel, Severity};
use super::policy::{Criterion, Exclusion, Indication};

/// Cache key for a computed diff.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiffKey {
    pub payer: String,
    pub medication: String,
    pub old_version: u32,
    pub new_version: u32,
}

impl DiffKey {
    pub fn new(payer: &str, medication: &str, old_version: u32, new_version: u32) -> Self {
        Self {
            payer: payer.trim().to_lowercase(),
            medication: medication.trim().to_lowercase(),
            old_version,
            new_version,
        }
    }
}

impl std::fmt::Display for DiffKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} v{}→v{}",
            self.payer, self.medication, self.old_version, self.new_version
        )
    }
}

/// Snapshot of the item on one side of a diff entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffValue {
    Criterion(Criterion),
    Indication(Indication),
    Exclusion(Exclusion),
}

impl DiffValue {
    pub fn name(&self) -> &str {
        match self {
            DiffValue::Criterion(c) => &c.name,
            DiffValue::Indication(i) => &i.name,
            DiffValue::Exclusion(e) => &e.name,
        }
    }

    pub fn as_criterion(&self) -> Option<&Criterion> {
        match self {
            DiffValue::Criterion(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
    pub severity: Severity,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub subject: DiffSubject,
    pub change_type: ChangeType,
    pub severity: Severity,
    pub old_id: Option<String>,
    pub new_id: Option<String>,
    pub old_value: Option<DiffValue>,
    pub new_value: Option<DiffValue>,
    #[serde(default)]
    pub field_changes: Vec<FieldChange>,
    pub rationale: String,
    #[serde(default)]
    pub match_score: Option<f64>,
    /// The match had a near-equal competing candidate.
    #[serde(default)]
    pub low_confidence: bool,
}

impl DiffEntry {
    pub fn name(&self) -> &str {
        self.new_value
            .as_ref()
            .or(self.old_value.as_ref())
            .map(DiffValue::name)
            .unwrap_or_default()
    }

    /// The criterion on the new side, if this entry is about a criterion.
    pub fn new_criterion(&self) -> Option<&Criterion> {
        self.new_value.as_ref().and_then(DiffValue::as_criterion)
    }

    pub fn old_criterion(&self) -> Option<&Criterion> {
        self.old_value.as_ref().and_then(DiffValue::as_criterion)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub total_changes: usize,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub breaking: usize,
    pub material: usize,
    pub minor: usize,
    pub cosmetic: usize,
    pub low_confidence: usize,
    pub impact: ImpactLevel,
    pub executive_summary: String,
}

impl Default for ImpactLevel {
    fn default() -> Self {
        ImpactLevel::Low
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub payer: String,
    pub medication: String,
    pub old_version: u32,
    pub new_version: u32,
    pub entries: Vec<DiffEntry>,
    pub summary: DiffSummary,
    pub computed_at: DateTime<Utc>,
}

impl DiffResult {
    pub fn key(&self) -> DiffKey {
        DiffKey::new(&self.payer, &self.medication, self.old_version, self.new_version)
    }

    pub fn criterion_changes(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter().filter(|e| {
            e.subject == DiffSubject::Criterion && e.change_type != ChangeType::Unchanged
        })
    }
}
