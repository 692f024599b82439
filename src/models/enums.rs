use crate::db::DatabaseError;

/// Macro to generate enum with as_str + std::str::FromStr pattern.
///
/// Parsing is case-insensitive and accepts extra aliases, since most of these
/// values arrive from provider output. Serde goes through the same string form.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal $(| $alias:literal)*),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::db::DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_ascii_lowercase();
                $(
                    if normalized == $s.to_ascii_lowercase() $(|| normalized == $alias)* {
                        return Ok(Self::$variant);
                    }
                )+
                Err($crate::db::DatabaseError::InvalidEnum {
                    field: stringify!($name).into(),
                    value: s.into(),
                })
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use str_enum;

str_enum!(CriterionCategory {
    Diagnosis => "diagnosis" | "indication",
    Lab => "lab" | "lab_value" | "laboratory",
    StepTherapy => "step_therapy" | "prior_therapy" | "prior_treatment",
    Prescriber => "prescriber" | "prescriber_requirement",
    Safety => "safety" | "safety_screening",
    Documentation => "documentation",
    Exclusion => "exclusion" | "contraindication",
    Demographics => "demographics" | "age" | "demographic",
    Other => "other",
});

str_enum!(ThresholdOperator {
    Eq => "eq" | "=" | "==" | "equals",
    Ne => "ne" | "!=" | "not_equals",
    Gt => "gt" | ">" | "greater_than",
    Gte => "gte" | ">=" | "at_least" | "min",
    Lt => "lt" | "<" | "less_than",
    Lte => "lte" | "<=" | "at_most" | "max",
    Between => "between" | "range",
    In => "in" | "one_of",
    NotIn => "not_in" | "none_of",
});

str_enum!(GroupOperator {
    And => "AND" | "all",
    Or => "OR" | "any",
    Not => "NOT" | "none",
});

str_enum!(CodeSystem {
    Icd10 => "ICD-10" | "icd10" | "icd_10",
    Icd10Cm => "ICD-10-CM" | "icd10cm" | "icd10_cm" | "icd_10_cm",
    Hcpcs => "HCPCS" | "hcpcs_level_ii",
    Cpt => "CPT" | "cpt4" | "cpt-4",
    Ndc => "NDC",
    Loinc => "LOINC",
    Snomed => "SNOMED" | "snomed-ct" | "snomed_ct",
    RxNorm => "RxNorm" | "rx_norm",
    Npi => "NPI",
    Other => "other",
});

impl CodeSystem {
    /// Systems that share one code space for lookup purposes.
    pub fn family(&self) -> CodeSystem {
        match self {
            CodeSystem::Icd10Cm => CodeSystem::Icd10,
            other => *other,
        }
    }
}

str_enum!(CodeStatus {
    Valid => "valid",
    Unknown => "unknown" | "unverified",
    Deprecated => "deprecated" | "retired",
});

str_enum!(ValidationAction {
    Confirmed => "confirmed",
    Corrected => "corrected",
    FlaggedMissing => "flagged_missing",
    FlaggedExtra => "flagged_extra",
});

str_enum!(ExtractionQuality {
    Good => "good",
    NeedsReview => "needs_review",
    Poor => "poor",
});

str_enum!(CriterionOutcome {
    Met => "met" | "true" | "yes",
    NotMet => "not_met" | "false" | "no" | "unmet",
    Undetermined => "undetermined" | "unknown" | "insufficient_data",
});

str_enum!(DiffSubject {
    Criterion => "criterion",
    Indication => "indication",
    Exclusion => "exclusion",
});

str_enum!(ChangeType {
    Added => "added",
    Removed => "removed",
    Modified => "modified",
    Unchanged => "unchanged",
});

str_enum!(
    /// Declaration order is severity order: `Breaking` compares greatest.
    Severity {
        Cosmetic => "cosmetic",
        Minor => "minor",
        Material => "material",
        Breaking => "breaking",
    }
);

str_enum!(ImpactLevel {
    Low => "low",
    Moderate => "moderate",
    High => "high",
});

str_enum!(RiskCategory {
    VerdictFlip => "verdict_flip",
    AtRisk => "at_risk",
    Improved => "improved",
    NoImpact => "no_impact",
});

/// Parse an optional label, falling back when absent or unrecognized.
pub fn parse_or<T: std::str::FromStr<Err = DatabaseError>>(raw: Option<&str>, fallback: T) -> T {
    raw.and_then(|s| s.parse().ok()).unwrap_or(fallback)
}
