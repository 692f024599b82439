use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ProviderError, TaskCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Timeout,
    TransportError,
    RateLimited,
    HttpError,
    Malformed,
    NotConfigured,
}

impl From<&ProviderError> for CallOutcome {
    fn from(error: &ProviderError) -> Self {
        match error {
            ProviderError::Timeout(_) => CallOutcome::Timeout,
            ProviderError::Transport { .. } => CallOutcome::TransportError,
            ProviderError::RateLimited => CallOutcome::RateLimited,
            ProviderError::Status { .. } => CallOutcome::HttpError,
            ProviderError::Malformed(_) => CallOutcome::Malformed,
            ProviderError::NotConfigured(_) => CallOutcome::NotConfigured,
        }
    }
}

/// One provider call attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub category: TaskCategory,
    pub provider: String,
    /// 1-based attempt number on this provider.
    pub attempt: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub outcome: CallOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only telemetry sink. Never consulted for control flow.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

// ──────────────────────────────────────────────
// In-memory sink
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderUsage {
    pub calls: usize,
    pub failures: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_latency_ms: u64,
}

/// Keeps every record in memory, per process instance.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_request(&self, request_id: &str) -> Vec<UsageRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .collect()
    }

    pub fn usage_by_provider(&self) -> BTreeMap<String, ProviderUsage> {
        let mut usage: BTreeMap<String, ProviderUsage> = BTreeMap::new();
        for record in self.records() {
            let entry = usage.entry(record.provider.clone()).or_default();
            entry.calls += 1;
            if record.outcome != CallOutcome::Success {
                entry.failures += 1;
            }
            entry.input_tokens += u64::from(record.input_tokens);
            entry.output_tokens += u64::from(record.output_tokens);
            entry.total_latency_ms += record.latency_ms;
        }
        usage
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, record: UsageRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

// ──────────────────────────────────────────────
// Tracing sink
// ──────────────────────────────────────────────

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, record: UsageRecord) {
        tracing::info!(
            target: "payerlens::usage",
            request_id = %record.request_id,
            category = %record.category,
            provider = %record.provider,
            attempt = record.attempt,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            latency_ms = record.latency_ms,
            outcome = ?record.outcome,
            "provider call"
        );
    }
}
