use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::TaskCategory;

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_transient_retries() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_temperature() -> f32 {
    0.2
}

/// Routing policy for one task category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRoute {
    /// Provider ids in fallback order; the first is the primary.
    pub providers: Vec<String>,
    /// Fail immediately when the primary fails.
    #[serde(default)]
    pub no_fallback: bool,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Forces temperature 0.
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    /// First retry delay; doubles on each further retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl CategoryRoute {
    pub fn new(providers: &[&str]) -> Self {
        Self {
            providers: providers.iter().map(|p| p.to_string()).collect(),
            no_fallback: false,
            max_output_tokens: default_max_output_tokens(),
            deterministic: false,
            timeout_ms: default_timeout_ms(),
            transient_retries: default_transient_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            temperature: default_temperature(),
        }
    }

    pub fn no_fallback(mut self) -> Self {
        self.no_fallback = true;
        self
    }

    pub fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> std::time::Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(6);
        std::time::Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub fn max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn effective_temperature(&self) -> f32 {
        if self.deterministic {
            0.0
        } else {
            self.temperature
        }
    }

    pub fn primary(&self) -> Option<&str> {
        self.providers.first().map(String::as_str)
    }
}

/// Task category → route table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub routes: BTreeMap<TaskCategory, CategoryRoute>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        use TaskCategory::*;

        let routes = [
            (
                DataExtraction,
                CategoryRoute::new(&["gemini", "azure"])
                    .max_output_tokens(16_384)
                    .timeout_ms(180_000),
            ),
            (
                PolicyReasoning,
                CategoryRoute::new(&["claude"])
                    .no_fallback()
                    .deterministic()
                    .max_output_tokens(8192)
                    .timeout_ms(120_000),
            ),
            (
                CriterionMatching,
                CategoryRoute::new(&["claude", "azure"]).deterministic(),
            ),
            (
                ChangeAssessment,
                CategoryRoute::new(&["claude", "azure"]).deterministic(),
            ),
            (
                ReferenceLookup,
                CategoryRoute::new(&["gemini", "azure"]).deterministic(),
            ),
            (PolicyQa, CategoryRoute::new(&["claude"])),
            (SummaryGeneration, CategoryRoute::new(&["gemini", "azure"])),
            (AppealStrategy, CategoryRoute::new(&["claude"]).no_fallback()),
            (AppealDrafting, CategoryRoute::new(&["gemini", "azure"])),
            (Notification, CategoryRoute::new(&["gemini", "azure"]).max_output_tokens(1024)),
        ];

        Self {
            routes: routes.into_iter().collect(),
        }
    }
}

impl RoutingConfig {
    pub fn empty() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    pub fn with_route(mut self, category: TaskCategory, route: CategoryRoute) -> Self {
        self.routes.insert(category, route);
        self
    }

    /// Parse a routing file. Categories present in the file replace the
    /// defaults; absent ones keep the default route.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let overrides: RoutingConfig = serde_json::from_str(json)?;
        let mut config = Self::default();
        config.routes.extend(overrides.routes);
        Ok(config)
    }

    /// Load from disk, falling back to defaults when the file is missing or invalid.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(json) => match Self::from_json(&json) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded provider routing");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Invalid routing file, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "No routing file, using defaults");
                Self::default()
            }
        }
    }

    pub fn route(&self, category: TaskCategory) -> Option<&CategoryRoute> {
        self.routes.get(&category)
    }

    pub fn primary(&self, category: TaskCategory) -> Option<&str> {
        self.route(category).and_then(CategoryRoute::primary)
    }

    /// Drop provider ids that are not registered; routes left empty are removed.
    pub fn retain_providers(mut self, registered: &[&str]) -> Self {
        for (category, route) in self.routes.iter_mut() {
            route.providers.retain(|p| {
                let keep = registered.contains(&p.as_str());
                if !keep {
                    tracing::warn!(category = %category, provider = %p, "Provider not available, removed from route");
                }
                keep
            });
        }
        self.routes.retain(|_, route| !route.providers.is_empty());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_category() {
        let config = RoutingConfig::default();
        for category in TaskCategory::ALL {
            assert!(config.route(*category).is_some(), "{category}");
        }
    }

    #[test]
    fn validation_route_is_strict_and_deterministic() {
        let config = RoutingConfig::default();
        let route = config.route(TaskCategory::PolicyReasoning).unwrap();
        assert!(route.no_fallback);
        assert_eq!(route.effective_temperature(), 0.0);
    }

    #[test]
    fn extraction_and_validation_primaries_differ() {
        let config = RoutingConfig::default();
        assert_ne!(
            config.primary(TaskCategory::DataExtraction),
            config.primary(TaskCategory::PolicyReasoning)
        );
    }

    #[test]
    fn file_overrides_merge_with_defaults() {
        let json = r#"{"routes": {"data_extraction": {"providers": ["local"], "timeout_ms": 500}}}"#;
        let config = RoutingConfig::from_json(json).unwrap();
        let route = config.route(TaskCategory::DataExtraction).unwrap();
        assert_eq!(route.providers, vec!["local"]);
        assert_eq!(route.timeout_ms, 500);
        assert_eq!(route.transient_retries, 1);
        assert_eq!(route.retry_backoff_ms, 250);
        assert!(config.route(TaskCategory::PolicyReasoning).is_some());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RoutingConfig::load(&dir.path().join("absent.json"));
        assert_eq!(config, RoutingConfig::default());
    }

    #[test]
    fn load_invalid_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(RoutingConfig::load(&path), RoutingConfig::default());
    }

    #[test]
    fn retain_providers_prunes_routes() {
        let config = RoutingConfig::default().retain_providers(&["claude"]);
        assert_eq!(config.primary(TaskCategory::PolicyReasoning), Some("claude"));
        assert_eq!(
            config.route(TaskCategory::CriterionMatching).unwrap().providers,
            vec!["claude"]
        );
        assert!(config.route(TaskCategory::DataExtraction).is_none());
    }
}
