use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Patient facts needed to re-evaluate changed criteria.
///
/// Keys of `facts` and `text_facts` are lowercase field names (`age`,
/// `hba1c`, `bmi`, `prescriber_specialty` ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    #[serde(default)]
    pub facts: BTreeMap<String, f64>,
    #[serde(default)]
    pub text_facts: BTreeMap<String, String>,
    #[serde(default)]
    pub diagnosis_codes: Vec<String>,
    #[serde(default)]
    pub prior_treatments: Vec<String>,
    #[serde(default)]
    pub prescriber_specialty: Option<String>,
    /// Labels of documents on file (chart notes, lab reports ...).
    #[serde(default)]
    pub documents: Vec<String>,
}

impl PatientRecord {
    pub fn new(patient_id: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_fact(mut self, field: &str, value: f64) -> Self {
        self.facts.insert(field.to_lowercase(), value);
        self
    }

    pub fn with_text_fact(mut self, field: &str, value: &str) -> Self {
        self.text_facts.insert(field.to_lowercase(), value.to_string());
        self
    }

    pub fn with_diagnosis(mut self, code: &str) -> Self {
        self.diagnosis_codes.push(code.to_string());
        self
    }

    pub fn with_prior_treatment(mut self, drug: &str) -> Self {
        self.prior_treatments.push(drug.to_string());
        self
    }

    pub fn with_document(mut self, label: &str) -> Self {
        self.documents.push(label.to_string());
        self
    }

    pub fn fact(&self, field: &str) -> Option<f64> {
        self.facts.get(&field.to_lowercase()).copied()
    }

    pub fn text_fact(&self, field: &str) -> Option<&str> {
        let key = field.to_lowercase();
        if key == "prescriber_specialty" {
            if let Some(specialty) = &self.prescriber_specialty {
                return Some(specialty);
            }
        }
        self.text_facts.get(&key).map(String::as_str)
    }
}
