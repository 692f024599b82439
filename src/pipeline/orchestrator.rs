use std::sync::Arc;

use tracing::Instrument;

use super::assembler::{assemble, AssemblyInput};
use super::document::PolicyDocument;
use super::extraction::extract_policy;
use super::prompt::TemplateResolver;
use super::reference::{annotate_with_lookup, ReferenceTable};
use super::validation::{validate_extraction, ValidatedExtractionResult};
use super::PipelineError;
use crate::gateway::{Gateway, TaskCategory};
use crate::models::DigitizedPolicy;
use crate::pipeline_config::PipelineConfig;

/// Runs one document through every stage. Holds no per-run state, so a
/// single instance can serve concurrent runs.
pub struct PolicyPipeline {
    gateway: Arc<Gateway>,
    templates: Arc<dyn TemplateResolver>,
    reference: Arc<ReferenceTable>,
    config: PipelineConfig,
}

impl PolicyPipeline {
    /// Fails when extraction and validation would share a primary provider.
    pub fn new(
        gateway: Arc<Gateway>,
        templates: Arc<dyn TemplateResolver>,
        reference: Arc<ReferenceTable>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let routing = gateway.routing();
        if let (Some(extractor), Some(validator)) = (
            routing.primary(TaskCategory::DataExtraction),
            routing.primary(TaskCategory::PolicyReasoning),
        ) {
            if extractor == validator {
                return Err(PipelineError::ProviderDiversity(extractor.to_string()));
            }
        }
        Ok(Self {
            gateway,
            templates,
            reference,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Digitize one policy document. Nothing is persisted here.
    pub async fn run(
        &self,
        text: &str,
        payer: &str,
        medication: &str,
    ) -> Result<DigitizedPolicy, PipelineError> {
        let span = tracing::info_span!("digitalize", payer = %payer, medication = %medication);
        self.run_stages(text, payer, medication).instrument(span).await
    }

    async fn run_stages(
        &self,
        text: &str,
        payer: &str,
        medication: &str,
    ) -> Result<DigitizedPolicy, PipelineError> {
        let document = PolicyDocument::parse(text);
        if document.char_count() < self.config.min_input_chars {
            return Err(PipelineError::InputTooShort {
                chars: document.char_count(),
                min: self.config.min_input_chars,
            });
        }
        tracing::debug!(
            pages = document.pages().len(),
            source_hash = %document.source_hash(),
            "Document parsed"
        );

        let mut validated = self.extract_and_validate(&document, payer, medication, None).await?;

        let mut attempts = 0;
        while validated.needs_reextraction && attempts < self.config.max_reextractions {
            attempts += 1;
            let hint = validated.missing_names.join("; ");
            tracing::info!(
                attempt = attempts,
                flagged = validated.counts.flagged(),
                "Validation flagged too much, re-extracting"
            );
            let hint = (!hint.is_empty()).then_some(hint);
            let retry = self
                .extract_and_validate(&document, payer, medication, hint.as_deref())
                .await?;
            if retry.counts.flagged() < validated.counts.flagged() {
                validated = retry;
            }
        }

        let lookup = self
            .config
            .reference_provider_lookup
            .then(|| (self.gateway.as_ref(), self.templates.as_ref()));
        let extraction = &mut validated.extraction;
        let reference = annotate_with_lookup(
            &mut extraction.criteria,
            &mut extraction.indications,
            &self.reference,
            lookup,
        )
        .await;
        if reference.has_problems() {
            tracing::warn!(
                unknown = reference.unknown,
                deprecated = reference.deprecated,
                "Some clinical codes could not be verified"
            );
        }

        let policy = assemble(AssemblyInput {
            payer,
            medication,
            validated,
            document: &document,
            reference,
            config: &self.config,
        })?;

        tracing::info!(
            criteria = policy.criteria.len(),
            quality = %policy.extraction_quality,
            extraction_provider = %policy.extraction_provider,
            validation_provider = %policy.validation_provider,
            "Policy digitized"
        );
        Ok(policy)
    }

    async fn extract_and_validate(
        &self,
        document: &PolicyDocument,
        payer: &str,
        medication: &str,
        hint: Option<&str>,
    ) -> Result<ValidatedExtractionResult, PipelineError> {
        let raw = extract_policy(
            &self.gateway,
            self.templates.as_ref(),
            document,
            payer,
            medication,
            hint,
        )
        .await?;
        validate_extraction(
            &self.gateway,
            self.templates.as_ref(),
            document,
            raw,
            payer,
            medication,
            &self.config,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        CategoryRoute, GatewayError, InMemoryMetricsSink, ProviderError, ReasoningProvider,
        RoutingConfig, ScriptedProvider,
    };
    use crate::models::{ExtractionQuality, ValidationAction};
    use crate::pipeline::prompt::BuiltinTemplates;
    use crate::pipeline::Stage;

    const POLICY: &str = "--- Page 1 ---\nAdalimumab (Humira) is covered for moderate to severe rheumatoid arthritis.\n\
        --- Page 2 ---\nPatient must be 18 years of age or older.\n\
        Patient must have had an inadequate response to methotrexate.";

    const EXTRACTION: &str = r#"{
        "policy_title": "Adalimumab",
        "criteria": [
            {"id": "age", "category": "demographics", "name": "Minimum age",
             "description": "Patient must be 18 years of age or older",
             "threshold": {"operator": "gte", "value": 18, "unit": "years"},
             "patient_field": "age", "source_page": 2,
             "source_excerpt": "Patient must be 18 years of age or older"},
            {"id": "mtx", "category": "step_therapy", "name": "Methotrexate trial",
             "description": "Inadequate response to methotrexate",
             "drug_names": ["methotrexate"], "source_page": 2}
        ],
        "groups": [{"id": "initial", "operator": "AND", "criteria": ["age", "mtx"]}],
        "indications": [{"id": "ra", "name": "Rheumatoid arthritis",
                         "codes": [{"system": "ICD-10", "code": "M06.9"}],
                         "initial_group": "initial"}]
    }"#;

    const REDERIVED: &str = r#"{
        "criteria": [
            {"id": "adult", "category": "demographics", "name": "Minimum age",
             "description": "Patient must be 18 years of age or older",
             "threshold": {"operator": "gte", "value": 18, "unit": "years"}, "source_page": 2},
            {"id": "methotrexate", "category": "step_therapy", "name": "Methotrexate trial",
             "description": "Inadequate response to methotrexate",
             "drug_names": ["methotrexate"], "source_page": 2}
        ]
    }"#;

    fn pipeline(extractor: Arc<ScriptedProvider>, validator: ScriptedProvider) -> PolicyPipeline {
        let config = RoutingConfig::empty()
            .with_route(TaskCategory::DataExtraction, CategoryRoute::new(&["gemini"]))
            .with_route(
                TaskCategory::PolicyReasoning,
                CategoryRoute::new(&["claude"]).no_fallback().deterministic(),
            );
        let gateway = Gateway::new(
            config,
            vec![
                extractor as Arc<dyn ReasoningProvider>,
                Arc::new(validator) as Arc<dyn ReasoningProvider>,
            ],
            Arc::new(InMemoryMetricsSink::new()),
        )
        .unwrap();
        PolicyPipeline::new(
            Arc::new(gateway),
            Arc::new(BuiltinTemplates),
            Arc::new(ReferenceTable::bundled()),
            PipelineConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn digitizes_agreeing_extraction() {
        let p = pipeline(
            Arc::new(ScriptedProvider::new("gemini").reply(EXTRACTION)),
            ScriptedProvider::new("claude").reply(REDERIVED),
        );
        let policy = p.run(POLICY, "Aetna", "Humira").await.unwrap();
        assert_eq!(policy.criteria.len(), 2);
        assert_eq!(policy.extraction_quality, ExtractionQuality::Good);
        assert_eq!(policy.extraction_provider, "gemini");
        assert_eq!(policy.validation_provider, "claude");
        assert!(policy
            .criteria
            .iter()
            .all(|c| c.validation_action() == Some(ValidationAction::Confirmed)));
        assert_eq!(policy.provenance["mtx"].source_page, 2);
    }

    #[tokio::test]
    async fn short_input_is_rejected_before_any_call() {
        let extractor = Arc::new(ScriptedProvider::new("gemini").always(EXTRACTION));
        let p = pipeline(extractor.clone(), ScriptedProvider::new("claude"));
        let err = p.run("too short", "Aetna", "Humira").await.unwrap_err();
        assert!(matches!(err, PipelineError::InputTooShort { .. }));
        assert_eq!(extractor.calls(), 0);
    }

    #[tokio::test]
    async fn validation_failure_is_fatal() {
        let p = pipeline(
            Arc::new(ScriptedProvider::new("gemini").reply(EXTRACTION)),
            ScriptedProvider::new("claude").always_fail(ProviderError::Timeout(10)),
        );
        let err = p.run(POLICY, "Aetna", "Humira").await.unwrap_err();
        match err {
            PipelineError::Gateway { stage, source } => {
                assert_eq!(stage, Stage::Validation);
                assert!(matches!(source, GatewayError::Provider { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_extraction_is_schema_error() {
        let p = pipeline(
            Arc::new(ScriptedProvider::new("gemini").reply(r#"{"title": "no criteria key"}"#)),
            ScriptedProvider::new("claude").reply(REDERIVED),
        );
        let err = p.run(POLICY, "Aetna", "Humira").await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Extraction));
        assert!(matches!(err, PipelineError::SchemaParse { .. }));
    }

    #[tokio::test]
    async fn heavy_flagging_triggers_one_reextraction() {
        let only_age = r#"{"criteria": [
            {"id": "age", "category": "demographics", "name": "Minimum age",
             "description": "Patient must be 18 years of age or older",
             "threshold": {"operator": "gte", "value": 18, "unit": "years"}, "source_page": 2}
        ]}"#;
        let extractor = Arc::new(ScriptedProvider::new("gemini").reply(only_age).reply(EXTRACTION));
        let p = pipeline(extractor.clone(), ScriptedProvider::new("claude").always(REDERIVED));

        let policy = p.run(POLICY, "Aetna", "Humira").await.unwrap();
        assert_eq!(extractor.calls(), 2);
        assert!(extractor.requests()[1].prompt.contains("Methotrexate trial"));
        assert_eq!(policy.extraction_quality, ExtractionQuality::Good);
    }

    #[test]
    fn shared_primary_provider_is_rejected() {
        let config = RoutingConfig::empty()
            .with_route(TaskCategory::DataExtraction, CategoryRoute::new(&["claude"]))
            .with_route(TaskCategory::PolicyReasoning, CategoryRoute::new(&["claude"]));
        let gateway = Gateway::new(
            config,
            vec![Arc::new(ScriptedProvider::new("claude")) as Arc<dyn ReasoningProvider>],
            Arc::new(InMemoryMetricsSink::new()),
        )
        .unwrap();
        let result = PolicyPipeline::new(
            Arc::new(gateway),
            Arc::new(BuiltinTemplates),
            Arc::new(ReferenceTable::bundled()),
            PipelineConfig::default(),
        );
        assert!(matches!(result, Err(PipelineError::ProviderDiversity(_))));
    }
}
