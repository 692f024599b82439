use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::json::extract_json;
use super::{
    CallOutcome, CategoryRoute, Dispatched, GatewayError, MetricsSink, Payload, ProviderError,
    ProviderFailure, ProviderRequest, ProviderResponse, ReasoningProvider, ResponseFormat,
    RoutingConfig, TaskCategory, UsageRecord,
};

/// Stateless dispatcher over a fixed provider registry.
pub struct Gateway {
    config: RoutingConfig,
    providers: HashMap<String, Arc<dyn ReasoningProvider>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Gateway {
    /// Build a gateway. Every provider id named by the routing config must be registered.
    pub fn new(
        config: RoutingConfig,
        providers: Vec<Arc<dyn ReasoningProvider>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, GatewayError> {
        let providers: HashMap<String, Arc<dyn ReasoningProvider>> = providers
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();

        for (category, route) in &config.routes {
            if let Some(missing) = route.providers.iter().find(|id| !providers.contains_key(*id)) {
                return Err(GatewayError::UnknownProvider {
                    category: *category,
                    provider: missing.clone(),
                });
            }
        }

        Ok(Self {
            config,
            providers,
            metrics,
        })
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.config
    }

    /// Dispatch one task: primary first, then fallbacks unless the category forbids it.
    pub async fn dispatch(
        &self,
        category: TaskCategory,
        payload: Payload,
    ) -> Result<Dispatched, GatewayError> {
        let route = self
            .config
            .route(category)
            .filter(|route| !route.providers.is_empty())
            .ok_or(GatewayError::NoRoute(category))?;

        let request_id = payload
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let request = ProviderRequest {
            request_id: request_id.clone(),
            category,
            system: payload.system,
            prompt: payload.prompt,
            max_output_tokens: route.max_output_tokens,
            temperature: route.effective_temperature(),
            json_output: payload.format == ResponseFormat::Json,
        };

        let mut failures = Vec::new();
        for (position, provider_id) in route.providers.iter().enumerate() {
            let provider = self.providers.get(provider_id).ok_or_else(|| {
                GatewayError::UnknownProvider {
                    category,
                    provider: provider_id.clone(),
                }
            })?;

            match self.call_with_retry(provider.as_ref(), &request, route).await {
                Ok((response, json)) => {
                    if position > 0 {
                        tracing::info!(
                            category = %category,
                            provider = %provider_id,
                            fallbacks = position,
                            "Served by fallback provider"
                        );
                    }
                    return Ok(Dispatched {
                        request_id,
                        category,
                        provider: provider_id.clone(),
                        text: response.text,
                        json,
                        fallbacks: position,
                    });
                }
                Err(error) if route.no_fallback => {
                    tracing::warn!(
                        category = %category,
                        provider = %provider_id,
                        error = %error,
                        "Provider failed and category allows no fallback"
                    );
                    return Err(GatewayError::Provider {
                        category,
                        provider: provider_id.clone(),
                        source: error,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        category = %category,
                        provider = %provider_id,
                        error = %error,
                        "Provider failed, advancing chain"
                    );
                    failures.push(ProviderFailure {
                        provider: provider_id.clone(),
                        error,
                    });
                }
            }
        }

        tracing::error!(category = %category, attempts = failures.len(), "All providers failed");
        Err(GatewayError::AllProvidersFailed { category, failures })
    }

    async fn call_with_retry(
        &self,
        provider: &dyn ReasoningProvider,
        request: &ProviderRequest,
        route: &CategoryRoute,
    ) -> Result<(ProviderResponse, Option<Value>), ProviderError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();

            let result = match tokio::time::timeout(
                Duration::from_millis(route.timeout_ms),
                provider.complete(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(route.timeout_ms)),
            };
            let result = result.and_then(|response| parse_output(request, response));

            self.record(request, provider.id(), attempt, started.elapsed(), &result);

            match result {
                Err(error) if error.is_retryable() && attempt <= route.transient_retries => {
                    tracing::warn!(
                        provider = provider.id(),
                        attempt,
                        error = %error,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(route.backoff(attempt)).await;
                }
                other => return other,
            }
        }
    }

    fn record(
        &self,
        request: &ProviderRequest,
        provider: &str,
        attempt: u32,
        elapsed: Duration,
        result: &Result<(ProviderResponse, Option<Value>), ProviderError>,
    ) {
        let (outcome, input_tokens, output_tokens) = match result {
            Ok((response, _)) => (CallOutcome::Success, response.input_tokens, response.output_tokens),
            Err(error) => (CallOutcome::from(error), 0, 0),
        };
        self.metrics.record(UsageRecord {
            request_id: request.request_id.clone(),
            category: request.category,
            provider: provider.to_string(),
            attempt,
            input_tokens,
            output_tokens,
            latency_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            outcome,
            recorded_at: Utc::now(),
        });
    }
}

/// JSON payloads must carry recoverable JSON; anything else is a provider failure.
fn parse_output(
    request: &ProviderRequest,
    response: ProviderResponse,
) -> Result<(ProviderResponse, Option<Value>), ProviderError> {
    if !request.json_output {
        return Ok((response, None));
    }
    match extract_json(&response.text) {
        Some(json) => Ok((response, Some(json))),
        None => {
            let preview: String = response.text.chars().take(120).collect();
            Err(ProviderError::Malformed(format!("expected JSON, got: {preview}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryMetricsSink, ScriptedProvider};

    fn gateway(
        route: CategoryRoute,
        providers: Vec<Arc<ScriptedProvider>>,
    ) -> (Gateway, Arc<InMemoryMetricsSink>) {
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let config = RoutingConfig::empty().with_route(TaskCategory::DataExtraction, route);
        let providers = providers
            .into_iter()
            .map(|p| p as Arc<dyn ReasoningProvider>)
            .collect();
        let gateway = Gateway::new(config, providers, metrics.clone()).unwrap();
        (gateway, metrics)
    }

    fn transient() -> ProviderError {
        ProviderError::Transport {
            message: "connection reset".into(),
            retryable: true,
        }
    }

    #[tokio::test]
    async fn primary_serves_request() {
        let primary = Arc::new(ScriptedProvider::new("a").reply("{\"ok\": true}"));
        let backup = Arc::new(ScriptedProvider::new("b"));
        let (gw, metrics) = gateway(CategoryRoute::new(&["a", "b"]), vec![primary, backup.clone()]);

        let out = gw
            .dispatch(TaskCategory::DataExtraction, Payload::json("sys", "go"))
            .await
            .unwrap();
        assert_eq!(out.provider, "a");
        assert_eq!(out.fallbacks, 0);
        assert_eq!(out.json.unwrap()["ok"], true);
        assert_eq!(backup.calls(), 0);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics.records()[0].outcome, CallOutcome::Success);
    }

    #[tokio::test]
    async fn timeout_falls_back_without_retry() {
        let primary = Arc::new(ScriptedProvider::new("a").always_hang());
        let backup = Arc::new(ScriptedProvider::new("b").reply("done"));
        let (gw, metrics) = gateway(
            CategoryRoute::new(&["a", "b"]).timeout_ms(30),
            vec![primary.clone(), backup],
        );

        let out = gw
            .dispatch(TaskCategory::DataExtraction, Payload::text("sys", "go"))
            .await
            .unwrap();
        assert_eq!(out.provider, "b");
        assert_eq!(out.fallbacks, 1);
        assert_eq!(primary.calls(), 1);
        let records = metrics.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, CallOutcome::Timeout);
        assert_eq!(records[1].outcome, CallOutcome::Success);
    }

    #[tokio::test]
    async fn no_fallback_timeout_fails_immediately_with_one_record() {
        let primary = Arc::new(ScriptedProvider::new("a").always_hang());
        let backup = Arc::new(ScriptedProvider::new("b").always("never"));
        let (gw, metrics) = gateway(
            CategoryRoute::new(&["a", "b"]).no_fallback().timeout_ms(30),
            vec![primary, backup.clone()],
        );

        let err = gw
            .dispatch(TaskCategory::DataExtraction, Payload::text("sys", "go"))
            .await
            .unwrap_err();
        match err {
            GatewayError::Provider { provider, source, .. } => {
                assert_eq!(provider, "a");
                assert_eq!(source, ProviderError::Timeout(30));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backup.calls(), 0);
        assert_eq!(metrics.len(), 1);
    }

    #[tokio::test]
    async fn transient_error_retried_once_on_same_provider() {
        let primary = Arc::new(ScriptedProvider::new("a").fail(transient()).reply("second try"));
        let (gw, metrics) = gateway(CategoryRoute::new(&["a"]), vec![primary.clone()]);

        let out = gw
            .dispatch(TaskCategory::DataExtraction, Payload::text("sys", "go"))
            .await
            .unwrap();
        assert_eq!(out.text, "second try");
        assert_eq!(primary.calls(), 2);
        let attempts: Vec<u32> = metrics.records().iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn transient_retry_waits_for_backoff() {
        let primary = Arc::new(ScriptedProvider::new("a").fail(transient()).reply("later"));
        let (gw, _) = gateway(CategoryRoute::new(&["a"]).retry_backoff_ms(40), vec![primary]);

        let started = Instant::now();
        let out = gw
            .dispatch(TaskCategory::DataExtraction, Payload::text("sys", "go"))
            .await
            .unwrap();
        assert_eq!(out.text, "later");
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let route = CategoryRoute::new(&["a"]).retry_backoff_ms(100);
        assert_eq!(route.backoff(1), Duration::from_millis(100));
        assert_eq!(route.backoff(2), Duration::from_millis(200));
        assert_eq!(route.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn persistent_transient_error_advances_after_one_retry() {
        let primary = Arc::new(ScriptedProvider::new("a").always_fail(transient()));
        let backup = Arc::new(ScriptedProvider::new("b").reply("ok"));
        let (gw, _) = gateway(CategoryRoute::new(&["a", "b"]), vec![primary.clone(), backup]);

        let out = gw
            .dispatch(TaskCategory::DataExtraction, Payload::text("sys", "go"))
            .await
            .unwrap();
        assert_eq!(out.provider, "b");
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn rate_limit_is_not_retried() {
        let primary = Arc::new(ScriptedProvider::new("a").always_fail(ProviderError::RateLimited));
        let backup = Arc::new(ScriptedProvider::new("b").reply("ok"));
        let (gw, _) = gateway(CategoryRoute::new(&["a", "b"]), vec![primary.clone(), backup]);

        gw.dispatch(TaskCategory::DataExtraction, Payload::text("sys", "go"))
            .await
            .unwrap();
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_json_counts_as_failure() {
        let primary = Arc::new(ScriptedProvider::new("a").reply("I cannot help with that."));
        let backup = Arc::new(ScriptedProvider::new("b").reply("```json\n{\"criteria\": []}\n```"));
        let (gw, metrics) = gateway(CategoryRoute::new(&["a", "b"]), vec![primary, backup]);

        let out = gw
            .dispatch(TaskCategory::DataExtraction, Payload::json("sys", "go"))
            .await
            .unwrap();
        assert_eq!(out.provider, "b");
        assert!(out.json.unwrap()["criteria"].is_array());
        assert_eq!(metrics.records()[0].outcome, CallOutcome::Malformed);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_failure() {
        let a = Arc::new(ScriptedProvider::new("a").always_fail(ProviderError::RateLimited));
        let b = Arc::new(ScriptedProvider::new("b").always_fail(ProviderError::Status {
            status: 400,
            body: "bad request".into(),
        }));
        let (gw, metrics) = gateway(CategoryRoute::new(&["a", "b"]), vec![a, b]);

        let err = gw
            .dispatch(TaskCategory::DataExtraction, Payload::text("sys", "go"))
            .await
            .unwrap_err();
        match err {
            GatewayError::AllProvidersFailed { category, failures } => {
                assert_eq!(category, TaskCategory::DataExtraction);
                let names: Vec<&str> = failures.iter().map(|f| f.provider.as_str()).collect();
                assert_eq!(names, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(metrics.len(), 2);
    }

    #[tokio::test]
    async fn unrouted_category_is_rejected() {
        let (gw, _) = gateway(CategoryRoute::new(&["a"]), vec![Arc::new(ScriptedProvider::new("a"))]);
        let err = gw
            .dispatch(TaskCategory::Notification, Payload::text("s", "p"))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NoRoute(TaskCategory::Notification));
    }

    #[test]
    fn unregistered_provider_rejected_at_build() {
        let config = RoutingConfig::empty()
            .with_route(TaskCategory::PolicyQa, CategoryRoute::new(&["ghost"]));
        let result = Gateway::new(config, Vec::new(), Arc::new(InMemoryMetricsSink::new()));
        assert!(matches!(result, Err(GatewayError::UnknownProvider { .. })));
    }

    #[tokio::test]
    async fn routing_policy_shapes_request() {
        let provider = Arc::new(ScriptedProvider::new("a").always("ok"));
        let (gw, metrics) = gateway(
            CategoryRoute::new(&["a"]).deterministic().max_output_tokens(321),
            vec![provider.clone()],
        );

        gw.dispatch(
            TaskCategory::DataExtraction,
            Payload::text("sys", "go").with_request_id("req-42"),
        )
        .await
        .unwrap();

        let request = &provider.requests()[0];
        assert_eq!(request.temperature, 0.0);
        assert_eq!(request.max_output_tokens, 321);
        assert_eq!(request.request_id, "req-42");
        assert_eq!(metrics.for_request("req-42").len(), 1);
    }
}
