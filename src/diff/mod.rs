//! Semantic diff between two versions of a digitized policy.
//!
//! Criterion ids are not stable across versions, so items are paired by a
//! pluggable similarity score and a deterministic one-to-one matcher before
//! any field is compared.

pub mod cache;
pub mod engine;
pub mod matching;
pub mod service;
pub mod severity;
pub mod similarity;

pub use cache::SingleFlightCache;
pub use engine::DiffEngine;
pub use matching::{greedy_match, Assignment, Match, ScoreMatrix};
pub use service::DiffService;
pub use severity::{Judgement, ProviderSeverityJudge, SeverityJudge};
pub use similarity::{LexicalSimilarity, ProviderSimilarity, SimilarityScorer};

use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiffError {
    #[error("policy not found: {payer}/{medication} v{version}")]
    PolicyNotFound {
        payer: String,
        medication: String,
        version: u32,
    },

    #[error("cannot diff {old} against {new}: different payer or medication")]
    MismatchedPolicies { old: String, new: String },

    #[error("provider call failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("{what} output did not match the expected schema: {message}")]
    SchemaParse { what: &'static str, message: String },

    #[error("policy store error: {0}")]
    Store(String),

    #[error("diff computation was abandoned before completing")]
    Cancelled,
}

impl DiffError {
    /// Analysis failed in a way a later request may not repeat.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiffError::Gateway(_)
                | DiffError::SchemaParse { .. }
                | DiffError::Store(_)
                | DiffError::Cancelled
        )
    }
}

impl From<crate::db::DatabaseError> for DiffError {
    fn from(err: crate::db::DatabaseError) -> Self {
        DiffError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::TaskCategory;

    #[test]
    fn missing_policy_is_not_retryable() {
        let err = DiffError::PolicyNotFound {
            payer: "aetna".into(),
            medication: "humira".into(),
            version: 3,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "policy not found: aetna/humira v3");
    }

    #[test]
    fn provider_failure_is_retryable() {
        let err: DiffError = GatewayError::NoRoute(TaskCategory::CriterionMatching).into();
        assert!(err.is_retryable());
    }
}
