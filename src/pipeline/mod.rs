//! Document-to-policy pipeline.
//!
//! Extraction → Validation → Reference → Assembly. Stages run sequentially
//! for one document; any stage error aborts the run and nothing is stored.
//! Reference annotation cannot fail, so it carries no `Stage`.

pub mod assembler;
pub mod document;
pub mod extraction;
pub mod orchestrator;
pub mod prompt;
pub mod reference;
pub mod validation;

pub use assembler::*;
pub use document::*;
pub use extraction::*;
pub use orchestrator::*;
pub use prompt::*;
pub use reference::*;
pub use validation::*;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::gateway::GatewayError;
use crate::models::enums::str_enum;

str_enum!(Stage {
    Extraction => "extraction",
    Validation => "validation",
    Assembly => "assembly",
});

/// Violations found while assembling a policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineInvariantError {
    #[error("duplicate criterion id '{0}'")]
    DuplicateCriterionId(String),

    #[error("duplicate group id '{0}'")]
    DuplicateGroupId(String),

    #[error("group '{group}' references unknown criterion '{criterion}'")]
    UnresolvedCriterion { group: String, criterion: String },

    #[error("group '{group}' references unknown subgroup '{subgroup}'")]
    UnresolvedSubgroup { group: String, subgroup: String },

    #[error("group '{0}' is part of a cycle")]
    GroupCycle(String),

    #[error("indication '{indication}' references unknown group '{group}'")]
    UnresolvedIndicationGroup { indication: String, group: String },

    #[error("exclusion '{exclusion}' references unknown criterion '{criterion}'")]
    UnresolvedExclusionTrigger { exclusion: String, criterion: String },

    #[error("criterion '{0}' has no source page")]
    MissingProvenance(String),

    #[error("criterion '{criterion}' cites page {page}, which the document does not have")]
    PageOutOfRange { criterion: String, page: u32 },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("input text too short ({chars} characters, minimum {min})")]
    InputTooShort { chars: usize, min: usize },

    #[error("{stage} stage provider call failed: {source}")]
    Gateway { stage: Stage, source: GatewayError },

    #[error("{stage} output did not match the expected schema: {message}")]
    SchemaParse { stage: Stage, message: String },

    #[error("extraction produced no criteria and no indications")]
    EmptyExtraction,

    #[error("policy invariant violated: {0}")]
    Invariant(#[from] PipelineInvariantError),

    #[error("extraction and validation both route to provider '{0}'")]
    ProviderDiversity(String),

    #[error("policy store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("prompt template error: {0}")]
    Template(#[from] prompt::TemplateError),
}

impl PipelineError {
    pub fn gateway(stage: Stage) -> impl FnOnce(GatewayError) -> PipelineError {
        move |source| PipelineError::Gateway { stage, source }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Gateway { stage, .. } | PipelineError::SchemaParse { stage, .. } => {
                Some(*stage)
            }
            PipelineError::InputTooShort { .. } | PipelineError::EmptyExtraction => {
                Some(Stage::Extraction)
            }
            PipelineError::Invariant(_) => Some(Stage::Assembly),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failing_stages_are_labelled() {
        assert_eq!(Stage::ALL, &[Stage::Extraction, Stage::Validation, Stage::Assembly]);
        assert!("reference".parse::<Stage>().is_err());
    }

    #[test]
    fn errors_map_to_their_stage() {
        let invariant = PipelineError::from(PipelineInvariantError::DuplicateCriterionId("c1".into()));
        assert_eq!(invariant.stage(), Some(Stage::Assembly));
        assert_eq!(PipelineError::EmptyExtraction.stage(), Some(Stage::Extraction));
        assert_eq!(PipelineError::ProviderDiversity("claude".into()).stage(), None);
    }
}
