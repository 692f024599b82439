use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::matching::{has_shape, ScoreMatrix};
use super::DiffError;
use crate::gateway::{Gateway, Payload, TaskCategory};
use crate::models::{Criterion, Exclusion, Indication};
use crate::pipeline::prompt::{render, TemplateResolver};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "must", "of", "on", "or", "the", "to", "with", "within", "patient", "patients",
];

/// Scores every old criterion against every new one.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    async fn score(&self, old: &[Criterion], new: &[Criterion]) -> Result<ScoreMatrix, DiffError>;
}

// ═══════════════════════════════════════════════════════════
// Lexical
// ═══════════════════════════════════════════════════════════

/// Token-set similarity. Deterministic and free.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalSimilarity;

impl LexicalSimilarity {
    pub fn tokens(text: &str) -> BTreeSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|t| !t.is_empty())
            .filter(|t| t.len() > 1 || t.chars().all(|c| c.is_ascii_digit()))
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .collect()
    }

    pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let shared = a.intersection(b).count();
        let union = a.union(b).count();
        shared as f64 / union as f64
    }

    pub fn text_score(a: &str, b: &str) -> f64 {
        Self::jaccard(&Self::tokens(a), &Self::tokens(b))
    }

    fn criterion_body(c: &Criterion) -> String {
        let mut body = format!("{} {}", c.name, c.description);
        for code in &c.clinical_codes {
            body.push(' ');
            body.push_str(&code.code);
        }
        for drug in &c.drug_names {
            body.push(' ');
            body.push_str(drug);
        }
        body
    }

    /// 0.4 name overlap + 0.4 full-text overlap + 0.2 category agreement.
    pub fn criterion_score(a: &Criterion, b: &Criterion) -> f64 {
        let name = Self::text_score(&a.name, &b.name);
        let body = Self::text_score(&Self::criterion_body(a), &Self::criterion_body(b));
        let category = if a.category == b.category { 1.0 } else { 0.0 };
        0.4 * name + 0.4 * body + 0.2 * category
    }

    pub fn criteria_matrix(old: &[Criterion], new: &[Criterion]) -> ScoreMatrix {
        old.iter()
            .map(|a| new.iter().map(|b| Self::criterion_score(a, b)).collect())
            .collect()
    }

    pub fn indication_matrix(old: &[Indication], new: &[Indication]) -> ScoreMatrix {
        let text = |i: &Indication| {
            let codes: Vec<&str> = i.codes.iter().map(|c| c.code.as_str()).collect();
            format!("{} {}", i.name, codes.join(" "))
        };
        old.iter()
            .map(|a| new.iter().map(|b| Self::text_score(&text(a), &text(b))).collect())
            .collect()
    }

    pub fn exclusion_matrix(old: &[Exclusion], new: &[Exclusion]) -> ScoreMatrix {
        old.iter()
            .map(|a| {
                new.iter()
                    .map(|b| {
                        0.6 * Self::text_score(&a.name, &b.name)
                            + 0.4 * Self::text_score(&a.description, &b.description)
                    })
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl SimilarityScorer for LexicalSimilarity {
    async fn score(&self, old: &[Criterion], new: &[Criterion]) -> Result<ScoreMatrix, DiffError> {
        Ok(Self::criteria_matrix(old, new))
    }
}

// ═══════════════════════════════════════════════════════════
// Provider-judged
// ═══════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct ScoresResponse {
    scores: Vec<Vec<f64>>,
}

/// One `criterion_matching` call scores the whole matrix.
pub struct ProviderSimilarity {
    gateway: Arc<Gateway>,
    templates: Arc<dyn TemplateResolver>,
}

impl ProviderSimilarity {
    pub fn new(gateway: Arc<Gateway>, templates: Arc<dyn TemplateResolver>) -> Self {
        Self { gateway, templates }
    }
}

fn criteria_listing(criteria: &[Criterion]) -> String {
    criteria
        .iter()
        .enumerate()
        .map(|(index, c)| {
            let threshold = c
                .threshold
                .as_ref()
                .map(|t| format!(" [{t}]"))
                .unwrap_or_default();
            format!("{index}. ({}) {}: {}{threshold}", c.category, c.name, c.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl SimilarityScorer for ProviderSimilarity {
    async fn score(&self, old: &[Criterion], new: &[Criterion]) -> Result<ScoreMatrix, DiffError> {
        if old.is_empty() || new.is_empty() {
            return Ok(vec![Vec::new(); old.len()]);
        }
        let template = self
            .templates
            .template("criterion_matching")
            .map_err(|e| DiffError::SchemaParse {
                what: "criterion_matching template",
                message: e.to_string(),
            })?;
        let old_listing = criteria_listing(old);
        let new_listing = criteria_listing(new);
        let prompt = render(
            &template,
            &[
                ("old_criteria", old_listing.as_str()),
                ("new_criteria", new_listing.as_str()),
            ],
        );

        let dispatched = self
            .gateway
            .dispatch(
                TaskCategory::CriterionMatching,
                Payload::json("You compare insurance coverage criteria.", prompt),
            )
            .await?;
        let parsed: ScoresResponse =
            serde_json::from_value(dispatched.json_value()).map_err(|e| DiffError::SchemaParse {
                what: "criterion_matching",
                message: e.to_string(),
            })?;

        if !has_shape(&parsed.scores, old.len(), new.len()) {
            return Err(DiffError::SchemaParse {
                what: "criterion_matching",
                message: format!("expected a {}x{} score matrix", old.len(), new.len()),
            });
        }
        Ok(parsed
            .scores
            .into_iter()
            .map(|row| row.into_iter().map(|s| s.clamp(0.0, 1.0)).collect())
            .collect())
    }
}
