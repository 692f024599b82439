//! Patient impact projection.
//!
//! Given a diff and a patient's assessment against the old version, only the
//! criteria the diff touched are re-evaluated. Everything else carries over
//! from the baseline.

pub mod evaluator;
pub mod projector;

pub use evaluator::{CriterionEvaluator, ProviderEvaluator, RuleEvaluator, RuleFirstEvaluator};
pub use projector::ImpactProjector;

use thiserror::Error;

use crate::gateway::GatewayError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImpactError {
    #[error("baseline assessment is for v{baseline}, diff starts at v{diff_old}")]
    VersionMismatch { baseline: u32, diff_old: u32 },

    #[error("baseline assessment is for {baseline}, diff is for {diff}")]
    PolicyMismatch { baseline: String, diff: String },

    #[error("provider call failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("criterion evaluation output did not match the expected schema: {0}")]
    SchemaParse(String),
}
