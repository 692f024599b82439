pub mod coverage;
pub mod diff;
pub mod enums;
pub mod impact;
pub mod patient;
pub mod policy;

pub use coverage::*;
pub use diff::*;
pub use enums::{
    ChangeType, CodeStatus, CodeSystem, CriterionCategory, CriterionOutcome, DiffSubject,
    ExtractionQuality, GroupOperator, ImpactLevel, RiskCategory, Severity, ThresholdOperator,
    ValidationAction,
};
pub use impact::*;
pub use patient::*;
pub use policy::*;
