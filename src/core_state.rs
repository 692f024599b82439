//! Entry point shared by every caller of the library.
//!
//! `PolicyCore` owns the provider router, the digitization pipeline, the
//! policy store, the diff service and the impact projector. Collaborators
//! are injected through `PolicyCoreBuilder`; `from_environment` wires the
//! production defaults.

use std::sync::Arc;

use thiserror::Error;

use crate::config;
use crate::db::{DatabaseError, PolicyStore, SqlitePolicyStore};
use crate::diff::{
    DiffEngine, DiffError, DiffService, LexicalSimilarity, ProviderSeverityJudge,
    ProviderSimilarity, SeverityJudge, SimilarityScorer,
};
use crate::gateway::{
    providers_from_env, Dispatched, Gateway, GatewayError, Payload, RoutingConfig, TaskCategory,
    TracingMetricsSink,
};
use crate::impact::{CriterionEvaluator, ImpactError, ImpactProjector, ProviderEvaluator, RuleFirstEvaluator};
use crate::models::{CoverageAssessment, DiffResult, DigitizedPolicy, ImpactReport, PatientImpact, PatientRecord};
use crate::pipeline::prompt::{BuiltinTemplates, FileTemplateResolver, TemplateResolver};
use crate::pipeline::reference::ReferenceTable;
use crate::pipeline::{PipelineError, PolicyPipeline};
use crate::pipeline_config::CoreConfig;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

// ═══════════════════════════════════════════════════════════
// PolicyCore
// ═══════════════════════════════════════════════════════════

pub struct PolicyCore {
    gateway: Arc<Gateway>,
    pipeline: PolicyPipeline,
    store: Arc<dyn PolicyStore>,
    diffs: DiffService,
    projector: ImpactProjector,
}

impl PolicyCore {
    pub fn builder(gateway: Arc<Gateway>, store: Arc<dyn PolicyStore>) -> PolicyCoreBuilder {
        PolicyCoreBuilder {
            gateway,
            store,
            templates: Arc::new(BuiltinTemplates),
            reference: Arc::new(ReferenceTable::bundled()),
            config: CoreConfig::default(),
            scorer: None,
            judge: None,
            evaluator: None,
        }
    }

    /// Wire providers, routing, store, settings and prompts from the
    /// environment and the data directory.
    pub fn from_environment() -> Result<Self, CoreError> {
        let providers = providers_from_env();
        let registered: Vec<&str> = providers.iter().map(|p| p.id()).collect();
        let routing = RoutingConfig::load(&config::routing_config_path()).retain_providers(&registered);
        let gateway = Arc::new(Gateway::new(
            routing,
            providers.clone(),
            Arc::new(TracingMetricsSink),
        )?);

        let store = Arc::new(SqlitePolicyStore::open(&config::database_path())?);
        let templates: Arc<dyn TemplateResolver> = Arc::new(FileTemplateResolver::new(config::templates_dir()));
        let reference = match ReferenceTable::load(&config::reference_codes_path()) {
            Ok(table) => table,
            Err(e) => {
                tracing::debug!(reason = %e, "Using bundled reference codes");
                ReferenceTable::bundled()
            }
        };

        let routed = |category| gateway.routing().route(category).is_some();
        let mut builder = PolicyCore::builder(gateway.clone(), store)
            .templates(templates.clone())
            .reference(reference)
            .config(CoreConfig::load(&config::settings_path()));
        if routed(TaskCategory::CriterionMatching) {
            builder = builder.scorer(Arc::new(ProviderSimilarity::new(gateway.clone(), templates.clone())));
        }
        if routed(TaskCategory::ChangeAssessment) {
            builder = builder.judge(Arc::new(ProviderSeverityJudge::new(gateway.clone(), templates.clone())));
        }
        if routed(TaskCategory::PolicyReasoning) {
            let provider = ProviderEvaluator::new(gateway.clone(), templates);
            builder = builder.evaluator(Arc::new(RuleFirstEvaluator::new(Some(provider))));
        }

        tracing::info!(
            version = config::APP_VERSION,
            providers = registered.len(),
            "{} core ready",
            config::APP_NAME
        );
        builder.build()
    }

    /// Digitize a document and store it as the next version.
    pub async fn digitalize(
        &self,
        document_text: &str,
        payer: &str,
        medication: &str,
    ) -> Result<DigitizedPolicy, PipelineError> {
        let policy = self.pipeline.run(document_text, payer, medication).await?;
        Ok(self.store.insert_next_version(&policy)?)
    }

    pub async fn diff(
        &self,
        payer: &str,
        medication: &str,
        old_version: u32,
        new_version: u32,
    ) -> Result<Arc<DiffResult>, DiffError> {
        self.diffs.diff(payer, medication, old_version, new_version).await
    }

    pub async fn project_impact(
        &self,
        diff: &DiffResult,
        baseline: &CoverageAssessment,
        patient: &PatientRecord,
    ) -> Result<PatientImpact, ImpactError> {
        self.projector.project(diff, baseline, patient).await
    }

    pub async fn project_many(
        &self,
        diff: &DiffResult,
        cases: &[(CoverageAssessment, PatientRecord)],
    ) -> Result<ImpactReport, ImpactError> {
        self.projector.project_many(diff, cases).await
    }

    /// Raw category dispatch for callers outside the pipeline.
    pub async fn dispatch(&self, category: TaskCategory, payload: Payload) -> Result<Dispatched, GatewayError> {
        self.gateway.dispatch(category, payload).await
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

// ═══════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════

pub struct PolicyCoreBuilder {
    gateway: Arc<Gateway>,
    store: Arc<dyn PolicyStore>,
    templates: Arc<dyn TemplateResolver>,
    reference: Arc<ReferenceTable>,
    config: CoreConfig,
    scorer: Option<Arc<dyn SimilarityScorer>>,
    judge: Option<Arc<dyn SeverityJudge>>,
    evaluator: Option<Arc<dyn CriterionEvaluator>>,
}

impl PolicyCoreBuilder {
    pub fn templates(mut self, templates: Arc<dyn TemplateResolver>) -> Self {
        self.templates = templates;
        self
    }

    pub fn reference(mut self, reference: ReferenceTable) -> Self {
        self.reference = Arc::new(reference);
        self
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to lexical similarity.
    pub fn scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Without a judge, ambiguous changes keep their rule severity.
    pub fn judge(mut self, judge: Arc<dyn SeverityJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Defaults to rules only.
    pub fn evaluator(mut self, evaluator: Arc<dyn CriterionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn build(self) -> Result<PolicyCore, CoreError> {
        let CoreConfig { pipeline, diff, impact } = self.config;

        let pipeline = PolicyPipeline::new(self.gateway.clone(), self.templates, self.reference, pipeline)?;

        let scorer = self
            .scorer
            .unwrap_or_else(|| Arc::new(LexicalSimilarity) as Arc<dyn SimilarityScorer>);
        let mut engine = DiffEngine::new(scorer, diff);
        if let Some(judge) = self.judge {
            engine = engine.with_judge(judge);
        }

        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(RuleFirstEvaluator::rules_only()) as Arc<dyn CriterionEvaluator>);

        Ok(PolicyCore {
            gateway: self.gateway,
            pipeline,
            store: self.store.clone(),
            diffs: DiffService::new(engine, self.store),
            projector: ImpactProjector::new(evaluator, impact),
        })
    }
}
