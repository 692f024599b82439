//! Provider router: task-category dispatch to external reasoning providers.
//!
//! Each task category maps to an ordered provider chain plus policy flags
//! (no-fallback, output token cap, determinism, timeout). The router walks the
//! chain, retries only transient transport failures, and records one usage
//! record per provider call.

pub mod config;
pub mod http;
pub mod json;
pub mod metrics;
pub mod mock;
pub mod router;
pub mod types;

pub use config::*;
pub use http::providers_from_env;
pub use metrics::*;
pub use mock::*;
pub use router::*;
pub use types::*;

use thiserror::Error;

/// Failure of a single provider call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider output: {0}")]
    Malformed(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Only transient transport failures are worth retrying on the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transport { retryable: true, .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("no provider route configured for {0}")]
    NoRoute(TaskCategory),

    #[error("route for {category} names unregistered provider '{provider}'")]
    UnknownProvider {
        category: TaskCategory,
        provider: String,
    },

    #[error("{category} call to {provider} failed: {source}")]
    Provider {
        category: TaskCategory,
        provider: String,
        source: ProviderError,
    },

    #[error("all providers failed for {category}: {}", join_failures(.failures))]
    AllProvidersFailed {
        category: TaskCategory,
        failures: Vec<ProviderFailure>,
    },
}

impl GatewayError {
    pub fn category(&self) -> TaskCategory {
        match self {
            GatewayError::NoRoute(category)
            | GatewayError::UnknownProvider { category, .. }
            | GatewayError::Provider { category, .. }
            | GatewayError::AllProvidersFailed { category, .. } => *category,
        }
    }
}
