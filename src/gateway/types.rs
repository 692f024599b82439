use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ProviderError;
use crate::models::enums::str_enum;

str_enum!(
    /// Kind of reasoning work. Routing is configured per category.
    TaskCategory {
        DataExtraction => "data_extraction",
        PolicyReasoning => "policy_reasoning",
        CriterionMatching => "criterion_matching",
        ChangeAssessment => "change_assessment",
        ReferenceLookup => "reference_lookup",
        PolicyQa => "policy_qa",
        SummaryGeneration => "summary_generation",
        AppealStrategy => "appeal_strategy",
        AppealDrafting => "appeal_drafting",
        Notification => "notification",
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    Json,
}

/// What the caller wants done; routing policy is applied by the router.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub system: String,
    pub prompt: String,
    pub format: ResponseFormat,
    /// Correlates usage records across the calls of one logical request.
    pub request_id: Option<String>,
}

impl Payload {
    pub fn json(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            format: ResponseFormat::Json,
            request_id: None,
        }
    }

    pub fn text(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            format: ResponseFormat::Text,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Request as seen by a provider, after routing policy is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderRequest {
    pub request_id: String,
    pub category: TaskCategory,
    pub system: String,
    pub prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub json_output: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: Option<String>,
}

impl ProviderResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// An external reasoning service. Implementations must be cancel-safe:
/// the router drops the future on timeout or caller disconnect.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub request_id: String,
    pub category: TaskCategory,
    pub provider: String,
    pub text: String,
    /// Parsed JSON when the payload asked for JSON.
    pub json: Option<serde_json::Value>,
    /// Providers tried before this one succeeded.
    pub fallbacks: usize,
}

impl Dispatched {
    /// Parsed JSON body, or `Null` for text payloads.
    pub fn json_value(&self) -> serde_json::Value {
        self.json.clone().unwrap_or(serde_json::Value::Null)
    }
}
