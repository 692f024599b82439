use std::sync::Arc;

use super::cache::{Abandoned, SingleFlightCache};
use super::engine::DiffEngine;
use super::DiffError;
use crate::db::PolicyStore;
use crate::models::{DiffKey, DiffResult, DigitizedPolicy};

impl From<Abandoned> for DiffError {
    fn from(_: Abandoned) -> Self {
        DiffError::Cancelled
    }
}

/// Cache-aware diffs by (payer, medication, old version, new version).
///
/// Lookup order: in-memory cache, persisted row, fresh computation. Fresh
/// results are written back to both and the persisted rows are pruned to
/// the cache capacity.
pub struct DiffService {
    engine: DiffEngine,
    store: Arc<dyn PolicyStore>,
    cache: SingleFlightCache<DiffKey, DiffResult, DiffError>,
}

impl DiffService {
    pub fn new(engine: DiffEngine, store: Arc<dyn PolicyStore>) -> Self {
        let capacity = engine.config().cache_capacity;
        Self {
            engine,
            store,
            cache: SingleFlightCache::new(capacity),
        }
    }

    pub fn engine(&self) -> &DiffEngine {
        &self.engine
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub async fn diff(
        &self,
        payer: &str,
        medication: &str,
        old_version: u32,
        new_version: u32,
    ) -> Result<Arc<DiffResult>, DiffError> {
        let key = DiffKey::new(payer, medication, old_version, new_version);
        self.cache
            .get_or_compute(key.clone(), || self.load_or_compute(key))
            .await
    }

    fn load(&self, payer: &str, medication: &str, version: u32) -> Result<DigitizedPolicy, DiffError> {
        self.store
            .load_policy(payer, medication, version)?
            .ok_or_else(|| DiffError::PolicyNotFound {
                payer: payer.to_string(),
                medication: medication.to_string(),
                version,
            })
    }

    async fn load_or_compute(&self, key: DiffKey) -> Result<DiffResult, DiffError> {
        if let Some(stored) = self.store.load_diff(&key)? {
            tracing::debug!(key = %key, "Diff served from store");
            return Ok(stored);
        }

        let old = self.load(&key.payer, &key.medication, key.old_version)?;
        let new = self.load(&key.payer, &key.medication, key.new_version)?;
        let result = self.engine.compute(&old, &new).await?;

        // A persistence failure should not discard a good result.
        if let Err(e) = self.store.store_diff(&result) {
            tracing::warn!(key = %key, error = %e, "Failed to persist diff");
        } else if let Err(e) = self.store.prune_diffs(self.engine.config().cache_capacity) {
            tracing::warn!(error = %e, "Failed to prune persisted diffs");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqlitePolicyStore;
    use crate::diff::matching::ScoreMatrix;
    use crate::diff::similarity::{LexicalSimilarity, SimilarityScorer};
    use crate::models::{Criterion, CriterionCategory, ExtractionQuality, ThresholdOperator};
    use crate::pipeline_config::DiffConfig;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingScorer(AtomicUsize);

    #[async_trait]
    impl SimilarityScorer for CountingScorer {
        async fn score(&self, old: &[Criterion], new: &[Criterion]) -> Result<ScoreMatrix, DiffError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(LexicalSimilarity::criteria_matrix(old, new))
        }
    }

    fn policy(min_age: f64) -> DigitizedPolicy {
        DigitizedPolicy {
            payer: "Aetna".into(),
            medication: "Humira".into(),
            version: 0,
            policy_title: None,
            effective_date: None,
            criteria: vec![Criterion::new("age", CriterionCategory::Demographics, "Minimum age")
                .with_threshold(ThresholdOperator::Gte, min_age, Some("years"))],
            groups: Vec::new(),
            indications: Vec::new(),
            exclusions: Vec::new(),
            safety_screenings: Vec::new(),
            extraction_quality: ExtractionQuality::Good,
            provenance: BTreeMap::new(),
            source_hash: String::new(),
            extraction_provider: "gemini".into(),
            validation_provider: "claude".into(),
            created_at: Utc::now(),
        }
    }

    fn service() -> (DiffService, Arc<CountingScorer>, Arc<SqlitePolicyStore>) {
        let store = Arc::new(SqlitePolicyStore::in_memory().unwrap());
        store.insert_next_version(&policy(18.0)).unwrap();
        store.insert_next_version(&policy(21.0)).unwrap();
        let scorer = Arc::new(CountingScorer(AtomicUsize::new(0)));
        let engine = DiffEngine::new(scorer.clone(), DiffConfig::default());
        (DiffService::new(engine, store.clone()), scorer, store)
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_computation() {
        let (service, scorer, store) = service();
        let (a, b) = tokio::join!(
            service.diff("Aetna", "Humira", 1, 2),
            service.diff("aetna", "humira", 1, 2)
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(scorer.0.load(Ordering::SeqCst), 1);
        assert!(store.load_diff(&DiffKey::new("aetna", "humira", 1, 2)).unwrap().is_some());
    }

    #[tokio::test]
    async fn persisted_row_is_reused_across_instances() {
        let (service, scorer, store) = service();
        service.diff("Aetna", "Humira", 1, 2).await.unwrap();

        let engine = DiffEngine::new(scorer.clone(), DiffConfig::default());
        let second = DiffService::new(engine, store);
        let diff = second.diff("Aetna", "Humira", 1, 2).await.unwrap();
        assert_eq!(diff.entries.len(), 1);
        assert_eq!(scorer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_version_is_not_found_and_not_cached() {
        let (service, _, _) = service();
        let err = service.diff("Aetna", "Humira", 1, 9).await.unwrap_err();
        assert!(matches!(err, DiffError::PolicyNotFound { version: 9, .. }));
        assert_eq!(service.cached(), 0);
    }
}
