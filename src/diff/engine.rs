use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use super::matching::{greedy_match, has_shape, Assignment, ScoreMatrix};
use super::severity::{
    added_criterion_severity, compare_criteria, compare_exclusions, compare_indications,
    max_severity, removed_criterion_severity, SeverityJudge,
};
use super::similarity::{LexicalSimilarity, SimilarityScorer};
use super::DiffError;
use crate::models::{
    ChangeType, DiffEntry, DiffResult, DiffSubject, DiffSummary, DiffValue, DigitizedPolicy,
    FieldChange, ImpactLevel, Severity,
};
use crate::pipeline_config::DiffConfig;

/// Computes a [`DiffResult`] for two versions of one policy.
///
/// Deterministic for a deterministic scorer and judge: entries follow old
/// extraction order, with additions appended in new extraction order.
pub struct DiffEngine {
    scorer: Arc<dyn SimilarityScorer>,
    judge: Option<Arc<dyn SeverityJudge>>,
    config: DiffConfig,
}

fn entry(subject: DiffSubject, change_type: ChangeType, severity: Severity) -> DiffEntry {
    DiffEntry {
        subject,
        change_type,
        severity,
        old_id: None,
        new_id: None,
        old_value: None,
        new_value: None,
        field_changes: Vec::new(),
        rationale: String::new(),
        match_score: None,
        low_confidence: false,
    }
}

fn rationale_from(changes: &[FieldChange]) -> String {
    changes
        .iter()
        .map(|c| format!("{} ({})", c.note, c.severity))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DiffEngine {
    pub fn new(scorer: Arc<dyn SimilarityScorer>, config: DiffConfig) -> Self {
        Self {
            scorer,
            judge: None,
            config,
        }
    }

    pub fn lexical(config: DiffConfig) -> Self {
        Self::new(Arc::new(LexicalSimilarity), config)
    }

    pub fn with_judge(mut self, judge: Arc<dyn SeverityJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    fn assign(&self, scores: &ScoreMatrix, old_len: usize, new_len: usize) -> Assignment {
        greedy_match(
            scores,
            old_len,
            new_len,
            self.config.similarity_threshold,
            self.config.ambiguity_margin,
        )
    }

    pub async fn compute(
        &self,
        old: &DigitizedPolicy,
        new: &DigitizedPolicy,
    ) -> Result<DiffResult, DiffError> {
        if !old.same_subject(new) {
            return Err(DiffError::MismatchedPolicies {
                old: old.label(),
                new: new.label(),
            });
        }

        let scores = self.scorer.score(&old.criteria, &new.criteria).await?;
        if !has_shape(&scores, old.criteria.len(), new.criteria.len()) {
            return Err(DiffError::SchemaParse {
                what: "similarity matrix",
                message: format!(
                    "expected {}x{} scores",
                    old.criteria.len(),
                    new.criteria.len()
                ),
            });
        }
        let criteria = self.assign(&scores, old.criteria.len(), new.criteria.len());

        let mut entries = self.criterion_entries(old, new, &criteria).await?;
        entries.extend(self.indication_entries(old, new));
        entries.extend(self.exclusion_entries(old, new, &criteria));

        let summary = summarize(&entries, old.version, new.version);
        tracing::info!(
            payer = %new.payer,
            medication = %new.medication,
            old_version = old.version,
            new_version = new.version,
            changes = summary.total_changes,
            breaking = summary.breaking,
            "Diff computed"
        );

        Ok(DiffResult {
            payer: new.payer.clone(),
            medication: new.medication.clone(),
            old_version: old.version,
            new_version: new.version,
            entries,
            summary,
            computed_at: Utc::now(),
        })
    }

    async fn criterion_entries(
        &self,
        old: &DigitizedPolicy,
        new: &DigitizedPolicy,
        assignment: &Assignment,
    ) -> Result<Vec<DiffEntry>, DiffError> {
        let mut entries = Vec::new();

        for (index, before) in old.criteria.iter().enumerate() {
            let Some(pair) = assignment.match_for_old(index) else {
                let severity = removed_criterion_severity(before);
                let mut e = entry(DiffSubject::Criterion, ChangeType::Removed, severity);
                e.old_id = Some(before.id.clone());
                e.old_value = Some(DiffValue::Criterion(before.clone()));
                e.rationale = if before.required {
                    "required criterion removed".into()
                } else {
                    "optional criterion removed; an alternative path to approval is gone".into()
                };
                entries.push(e);
                continue;
            };

            let after = &new.criteria[pair.new];
            let mut comparison = compare_criteria(before, after);
            let mut rationale = rationale_from(&comparison.changes);

            if comparison.ambiguous {
                if let Some(judge) = &self.judge {
                    let verdict = judge.judge(before, after, &comparison.changes).await?;
                    for change in comparison.changes.iter_mut().filter(|c| c.severity == Severity::Material) {
                        if change.field.starts_with("threshold.") && change.field != "threshold.unit" {
                            change.severity = verdict.severity;
                        }
                    }
                    rationale = format!("{rationale}; judged {}: {}", verdict.severity, verdict.rationale);
                }
            }

            let change_type = if comparison.changes.is_empty() {
                ChangeType::Unchanged
            } else {
                ChangeType::Modified
            };
            if change_type == ChangeType::Unchanged && !self.config.include_unchanged {
                continue;
            }

            let mut e = entry(DiffSubject::Criterion, change_type, max_severity(&comparison.changes));
            e.old_id = Some(before.id.clone());
            e.new_id = Some(after.id.clone());
            e.old_value = Some(DiffValue::Criterion(before.clone()));
            e.new_value = Some(DiffValue::Criterion(after.clone()));
            e.field_changes = comparison.changes;
            e.rationale = rationale;
            e.match_score = Some(pair.score);
            e.low_confidence = pair.ambiguous;
            entries.push(e);
        }

        for &index in &assignment.unmatched_new {
            let added = &new.criteria[index];
            let mut e = entry(DiffSubject::Criterion, ChangeType::Added, added_criterion_severity(added));
            e.new_id = Some(added.id.clone());
            e.new_value = Some(DiffValue::Criterion(added.clone()));
            e.rationale = if added.required {
                "new required criterion".into()
            } else {
                "new optional criterion".into()
            };
            entries.push(e);
        }
        Ok(entries)
    }

    fn indication_entries(&self, old: &DigitizedPolicy, new: &DigitizedPolicy) -> Vec<DiffEntry> {
        let scores = LexicalSimilarity::indication_matrix(&old.indications, &new.indications);
        let assignment = self.assign(&scores, old.indications.len(), new.indications.len());
        let mut entries = Vec::new();

        for (index, before) in old.indications.iter().enumerate() {
            match assignment.match_for_old(index) {
                Some(pair) => {
                    let after = &new.indications[pair.new];
                    let changes = compare_indications(before, after);
                    if changes.is_empty() && !self.config.include_unchanged {
                        continue;
                    }
                    let change_type = if changes.is_empty() {
                        ChangeType::Unchanged
                    } else {
                        ChangeType::Modified
                    };
                    let mut e = entry(DiffSubject::Indication, change_type, max_severity(&changes));
                    e.old_id = Some(before.id.clone());
                    e.new_id = Some(after.id.clone());
                    e.old_value = Some(DiffValue::Indication(before.clone()));
                    e.new_value = Some(DiffValue::Indication(after.clone()));
                    e.rationale = rationale_from(&changes);
                    e.field_changes = changes;
                    e.match_score = Some(pair.score);
                    e.low_confidence = pair.ambiguous;
                    entries.push(e);
                }
                None => {
                    let mut e = entry(DiffSubject::Indication, ChangeType::Removed, Severity::Breaking);
                    e.old_id = Some(before.id.clone());
                    e.old_value = Some(DiffValue::Indication(before.clone()));
                    e.rationale = "indication no longer covered".into();
                    entries.push(e);
                }
            }
        }
        for &index in &assignment.unmatched_new {
            let added = &new.indications[index];
            let mut e = entry(DiffSubject::Indication, ChangeType::Added, Severity::Material);
            e.new_id = Some(added.id.clone());
            e.new_value = Some(DiffValue::Indication(added.clone()));
            e.rationale = "new covered indication".into();
            entries.push(e);
        }
        entries
    }

    fn exclusion_entries(
        &self,
        old: &DigitizedPolicy,
        new: &DigitizedPolicy,
        criteria: &Assignment,
    ) -> Vec<DiffEntry> {
        let criterion_ids: HashMap<String, String> = criteria
            .matches
            .iter()
            .map(|m| (old.criteria[m.old].id.clone(), new.criteria[m.new].id.clone()))
            .collect();
        let scores = LexicalSimilarity::exclusion_matrix(&old.exclusions, &new.exclusions);
        let assignment = self.assign(&scores, old.exclusions.len(), new.exclusions.len());
        let mut entries = Vec::new();

        for (index, before) in old.exclusions.iter().enumerate() {
            match assignment.match_for_old(index) {
                Some(pair) => {
                    let after = &new.exclusions[pair.new];
                    let changes = compare_exclusions(before, after, &criterion_ids);
                    if changes.is_empty() && !self.config.include_unchanged {
                        continue;
                    }
                    let change_type = if changes.is_empty() {
                        ChangeType::Unchanged
                    } else {
                        ChangeType::Modified
                    };
                    let mut e = entry(DiffSubject::Exclusion, change_type, max_severity(&changes));
                    e.old_id = Some(before.id.clone());
                    e.new_id = Some(after.id.clone());
                    e.old_value = Some(DiffValue::Exclusion(before.clone()));
                    e.new_value = Some(DiffValue::Exclusion(after.clone()));
                    e.rationale = rationale_from(&changes);
                    e.field_changes = changes;
                    e.match_score = Some(pair.score);
                    e.low_confidence = pair.ambiguous;
                    entries.push(e);
                }
                None => {
                    let mut e = entry(DiffSubject::Exclusion, ChangeType::Removed, Severity::Material);
                    e.old_id = Some(before.id.clone());
                    e.old_value = Some(DiffValue::Exclusion(before.clone()));
                    e.rationale = "exclusion lifted".into();
                    entries.push(e);
                }
            }
        }
        for &index in &assignment.unmatched_new {
            let added = &new.exclusions[index];
            let mut e = entry(DiffSubject::Exclusion, ChangeType::Added, Severity::Breaking);
            e.new_id = Some(added.id.clone());
            e.new_value = Some(DiffValue::Exclusion(added.clone()));
            e.rationale = "new exclusion".into();
            entries.push(e);
        }
        entries
    }
}

fn summarize(entries: &[DiffEntry], old_version: u32, new_version: u32) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for e in entries {
        match e.change_type {
            ChangeType::Added => summary.added += 1,
            ChangeType::Removed => summary.removed += 1,
            ChangeType::Modified => summary.modified += 1,
            ChangeType::Unchanged => {
                summary.unchanged += 1;
                continue;
            }
        }
        match e.severity {
            Severity::Breaking => summary.breaking += 1,
            Severity::Material => summary.material += 1,
            Severity::Minor => summary.minor += 1,
            Severity::Cosmetic => summary.cosmetic += 1,
        }
        if e.low_confidence {
            summary.low_confidence += 1;
        }
    }
    summary.total_changes = summary.added + summary.removed + summary.modified;
    summary.impact = if summary.breaking > 0 {
        ImpactLevel::High
    } else if summary.material > 0 {
        ImpactLevel::Moderate
    } else {
        ImpactLevel::Low
    };

    summary.executive_summary = if summary.total_changes == 0 {
        format!("No substantive changes between v{old_version} and v{new_version}.")
    } else {
        let mut text = format!(
            "{} change(s) between v{old_version} and v{new_version}: {} breaking, {} material, {} minor, {} cosmetic.",
            summary.total_changes, summary.breaking, summary.material, summary.minor, summary.cosmetic
        );
        let breaking: Vec<&str> = entries
            .iter()
            .filter(|e| e.change_type != ChangeType::Unchanged && e.severity == Severity::Breaking)
            .map(DiffEntry::name)
            .collect();
        if !breaking.is_empty() {
            text.push_str(&format!(" Breaking: {}.", breaking.join(", ")));
        }
        if summary.low_confidence > 0 {
            text.push_str(&format!(" {} match(es) need review.", summary.low_confidence));
        }
        text
    };
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::severity::Judgement;
    use crate::models::{Criterion, CriterionCategory, Exclusion, ExtractionQuality, ThresholdOperator};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    fn policy(version: u32, criteria: Vec<Criterion>) -> DigitizedPolicy {
        DigitizedPolicy {
            payer: "Aetna".into(),
            medication: "Humira".into(),
            version,
            policy_title: None,
            effective_date: None,
            criteria,
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

    fn age(id: &str, min: f64) -> Criterion {
        Criterion::new(id, CriterionCategory::Demographics, "Minimum age")
            .with_description("Patient must be an adult")
            .with_threshold(ThresholdOperator::Gte, min, Some("years"))
    }

    fn mtx(id: &str) -> Criterion {
        Criterion::new(id, CriterionCategory::StepTherapy, "Methotrexate trial")
            .with_description("Inadequate response to methotrexate")
            .with_drug("methotrexate")
    }

    fn tb(id: &str) -> Criterion {
        Criterion::new(id, CriterionCategory::Safety, "TB screening")
            .with_description("Negative tuberculosis test within 12 months")
    }

    #[tokio::test]
    async fn age_increase_is_breaking_modification() {
        let engine = DiffEngine::lexical(DiffConfig::default());
        let old = policy(1, vec![age("a1", 18.0), mtx("m1")]);
        let new = policy(2, vec![mtx("x9"), age("z7", 21.0)]);
        let diff = engine.compute(&old, &new).await.unwrap();

        assert_eq!(diff.entries.len(), 1);
        let e = &diff.entries[0];
        assert_eq!(e.change_type, ChangeType::Modified);
        assert_eq!(e.severity, Severity::Breaking);
        assert_eq!(e.old_id.as_deref(), Some("a1"));
        assert_eq!(e.new_id.as_deref(), Some("z7"));
        assert_eq!(diff.summary.impact, ImpactLevel::High);
        assert!(diff.summary.executive_summary.contains("Breaking: Minimum age"));
    }

    #[tokio::test]
    async fn additions_and_removals() {
        let engine = DiffEngine::lexical(DiffConfig::default());
        let old = policy(1, vec![age("a", 18.0), mtx("m").optional()]);
        let new = policy(2, vec![age("a", 18.0), tb("t")]);
        let diff = engine.compute(&old, &new).await.unwrap();

        let kinds: Vec<(ChangeType, Severity)> =
            diff.entries.iter().map(|e| (e.change_type, e.severity)).collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeType::Removed, Severity::Breaking),
                (ChangeType::Added, Severity::Breaking),
            ]
        );
        assert_eq!(diff.summary.added, 1);
        assert_eq!(diff.summary.removed, 1);
    }

    #[tokio::test]
    async fn unchanged_entries_are_opt_in() {
        let config = DiffConfig {
            include_unchanged: true,
            ..Default::default()
        };
        let engine = DiffEngine::lexical(config);
        let old = policy(1, vec![age("a", 18.0)]);
        let new = policy(2, vec![age("b", 18.0)]);
        let diff = engine.compute(&old, &new).await.unwrap();
        assert_eq!(diff.entries[0].change_type, ChangeType::Unchanged);
        assert_eq!(diff.summary.total_changes, 0);
        assert_eq!(diff.summary.unchanged, 1);
        assert_eq!(diff.summary.impact, ImpactLevel::Low);
    }

    #[tokio::test]
    async fn repeated_diff_is_identical() {
        let engine = DiffEngine::lexical(DiffConfig::default());
        let old = policy(1, vec![age("a", 18.0), mtx("m"), tb("t")]);
        let new = policy(2, vec![tb("t2"), age("a2", 21.0), mtx("m2").optional()]);
        let first = engine.compute(&old, &new).await.unwrap();
        let second = engine.compute(&old, &new).await.unwrap();
        assert_eq!(first.entries, second.entries);
        assert_eq!(first.summary, second.summary);
    }

    #[tokio::test]
    async fn mismatched_policies_are_rejected() {
        let engine = DiffEngine::lexical(DiffConfig::default());
        let old = policy(1, vec![]);
        let mut new = policy(2, vec![]);
        new.medication = "Enbrel".into();
        assert!(matches!(
            engine.compute(&old, &new).await,
            Err(DiffError::MismatchedPolicies { .. })
        ));
    }

    struct FixedJudge(Severity);

    #[async_trait]
    impl SeverityJudge for FixedJudge {
        async fn judge(
            &self,
            _old: &Criterion,
            _new: &Criterion,
            _changes: &[FieldChange],
        ) -> Result<Judgement, DiffError> {
            Ok(Judgement {
                severity: self.0,
                rationale: "fixed".into(),
            })
        }
    }

    #[tokio::test]
    async fn judge_decides_ambiguous_changes() {
        let old = policy(1, vec![age("a", 18.0)]);
        let mut changed = age("a", 18.0);
        if let Some(t) = changed.threshold.as_mut() {
            t.operator = ThresholdOperator::Gt;
        }
        let new = policy(2, vec![changed]);

        let unjudged = DiffEngine::lexical(DiffConfig::default()).compute(&old, &new).await.unwrap();
        assert_eq!(unjudged.entries[0].severity, Severity::Material);

        let judged = DiffEngine::lexical(DiffConfig::default())
            .with_judge(Arc::new(FixedJudge(Severity::Breaking)))
            .compute(&old, &new)
            .await
            .unwrap();
        assert_eq!(judged.entries[0].severity, Severity::Breaking);
        assert!(judged.entries[0].rationale.contains("judged breaking"));
    }

    #[tokio::test]
    async fn exclusion_added_is_breaking() {
        let engine = DiffEngine::lexical(DiffConfig::default());
        let old = policy(1, vec![tb("t")]);
        let mut new = policy(2, vec![tb("t")]);
        new.exclusions.push(Exclusion {
            id: "tb_active".into(),
            name: "Active tuberculosis".into(),
            description: "Active TB infection".into(),
            trigger_criteria: vec!["t".into()],
        });
        let diff = engine.compute(&old, &new).await.unwrap();
        assert_eq!(diff.entries.len(), 1);
        assert_eq!(diff.entries[0].subject, DiffSubject::Exclusion);
        assert_eq!(diff.entries[0].severity, Severity::Breaking);
    }
}
