//! HTTP provider adapters.
//!
//! `AnthropicProvider` speaks the Messages API. `OpenAiCompatibleProvider`
//! speaks chat completions, which covers Azure OpenAI, Gemini's compatible
//! endpoint and local inference servers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ProviderError, ProviderRequest, ProviderResponse, ReasoningProvider};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5";
const GEMINI_OPENAI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-pro";

/// Map a reqwest send failure. Connection failures are transient.
fn map_send_error(error: reqwest::Error) -> ProviderError {
    ProviderError::Transport {
        retryable: error.is_connect(),
        message: error.to_string(),
    }
}

/// Map a non-success HTTP status.
fn map_status(status: u16, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited,
        500..=599 => ProviderError::Transport {
            message: format!("server error {status}: {body}"),
            retryable: true,
        },
        _ => ProviderError::Status { status, body },
    }
}

async fn send_json<B: Serialize>(
    request: reqwest::RequestBuilder,
    body: &B,
) -> Result<reqwest::Response, ProviderError> {
    let response = request.json(body).send().await.map_err(map_send_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(map_status(status.as_u16(), body));
    }
    Ok(response)
}

// ═══════════════════════════════════════════════════════════
// Anthropic
// ═══════════════════════════════════════════════════════════

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(id: &str, api_key: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Reads `ANTHROPIC_API_KEY` and optionally `ANTHROPIC_MODEL`.
    pub fn from_env(id: &str) -> Result<Self, ProviderError> {
        let key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::NotConfigured("ANTHROPIC_API_KEY is not set".into()))?;
        let model =
            std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_ANTHROPIC_MODEL.to_string());
        Ok(Self::new(id, &key, &model))
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn body<'a>(&'a self, request: &'a ProviderRequest) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        }
    }
}

fn parse_messages_response(parsed: MessagesResponse) -> Result<ProviderResponse, ProviderError> {
    let text: String = parsed
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();
    if text.trim().is_empty() {
        return Err(ProviderError::Malformed("empty message content".into()));
    }
    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or_default();
    Ok(ProviderResponse {
        text,
        input_tokens,
        output_tokens,
        model: parsed.model,
    })
}

#[async_trait]
impl ReasoningProvider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        let response = send_json(builder, &self.body(request)).await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parse_messages_response(parsed)
    }
}

// ═══════════════════════════════════════════════════════════
// OpenAI-compatible chat completions
// ═══════════════════════════════════════════════════════════

/// How the API key is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    /// Azure OpenAI `api-key` header.
    ApiKeyHeader,
    None,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatSpec>,
}

#[derive(Serialize)]
struct ResponseFormatSpec {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

pub struct OpenAiCompatibleProvider {
    id: String,
    endpoint: String,
    api_key: Option<String>,
    auth: AuthStyle,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    /// `endpoint` is the full chat-completions URL.
    pub fn new(id: &str, endpoint: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            api_key: None,
            auth: AuthStyle::None,
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: &str, auth: AuthStyle) -> Self {
        self.api_key = Some(api_key.to_string());
        self.auth = auth;
        self
    }

    /// Gemini through its OpenAI-compatible endpoint. Reads `GEMINI_API_KEY`.
    pub fn gemini_from_env(id: &str) -> Result<Self, ProviderError> {
        let key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| ProviderError::NotConfigured("GEMINI_API_KEY is not set".into()))?;
        let model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
        Ok(Self::new(id, &format!("{GEMINI_OPENAI_BASE_URL}/chat/completions"), &model)
            .with_api_key(&key, AuthStyle::Bearer))
    }

    /// Azure OpenAI deployment. Reads `AZURE_OPENAI_ENDPOINT`, `AZURE_OPENAI_API_KEY`,
    /// `AZURE_OPENAI_DEPLOYMENT` and optionally `AZURE_OPENAI_API_VERSION`.
    pub fn azure_from_env(id: &str) -> Result<Self, ProviderError> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| ProviderError::NotConfigured(format!("{name} is not set")))
        };
        let base = var("AZURE_OPENAI_ENDPOINT")?;
        let key = var("AZURE_OPENAI_API_KEY")?;
        let deployment = var("AZURE_OPENAI_DEPLOYMENT")?;
        let api_version = std::env::var("AZURE_OPENAI_API_VERSION")
            .unwrap_or_else(|_| "2024-10-21".to_string());
        let endpoint = format!(
            "{}/openai/deployments/{deployment}/chat/completions?api-version={api_version}",
            base.trim_end_matches('/')
        );
        Ok(Self::new(id, &endpoint, &deployment).with_api_key(&key, AuthStyle::ApiKeyHeader))
    }

    fn body<'a>(&'a self, request: &'a ProviderRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            response_format: request
                .json_output
                .then_some(ResponseFormatSpec { kind: "json_object" }),
        }
    }
}

fn parse_chat_response(parsed: ChatResponse) -> Result<ProviderResponse, ProviderError> {
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| ProviderError::Malformed("no completion choices".into()))?;
    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();
    Ok(ProviderResponse {
        text,
        input_tokens,
        output_tokens,
        model: parsed.model,
    })
}

#[async_trait]
impl ReasoningProvider for OpenAiCompatibleProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut builder = self.client.post(&self.endpoint);
        if let Some(key) = &self.api_key {
            builder = match self.auth {
                AuthStyle::Bearer => builder.bearer_auth(key),
                AuthStyle::ApiKeyHeader => builder.header("api-key", key),
                AuthStyle::None => builder,
            };
        }
        let response = send_json(builder, &self.body(request)).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parse_chat_response(parsed)
    }
}

/// Providers that can be built from the environment, keyed `claude`, `gemini`
/// and `azure`. Missing credentials are logged and skipped.
pub fn providers_from_env() -> Vec<Arc<dyn ReasoningProvider>> {
    let mut providers: Vec<Arc<dyn ReasoningProvider>> = Vec::new();

    match AnthropicProvider::from_env("claude") {
        Ok(p) => providers.push(Arc::new(p)),
        Err(e) => tracing::info!(provider = "claude", reason = %e, "Provider unavailable"),
    }
    match OpenAiCompatibleProvider::gemini_from_env("gemini") {
        Ok(p) => providers.push(Arc::new(p)),
        Err(e) => tracing::info!(provider = "gemini", reason = %e, "Provider unavailable"),
    }
    match OpenAiCompatibleProvider::azure_from_env("azure") {
        Ok(p) => providers.push(Arc::new(p)),
        Err(e) => tracing::info!(provider = "azure", reason = %e, "Provider unavailable"),
    }

    providers
}
