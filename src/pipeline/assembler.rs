//! Final assembly: structural checks, provenance, quality label.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;

use super::document::PolicyDocument;
use super::reference::ReferenceSummary;
use super::validation::ValidatedExtractionResult;
use super::PipelineInvariantError;
use crate::models::{
    Criterion, CriterionGroup, DigitizedPolicy, Exclusion, ExtractionQuality, Indication,
    Provenance,
};
use crate::pipeline_config::PipelineConfig;

pub struct AssemblyInput<'a> {
    pub payer: &'a str,
    pub medication: &'a str,
    pub validated: ValidatedExtractionResult,
    pub document: &'a PolicyDocument,
    pub reference: ReferenceSummary,
    pub config: &'a PipelineConfig,
}

// ═══════════════════════════════════════════════════════════
// Structure
// ═══════════════════════════════════════════════════════════

/// Group references form a DAG.
fn check_acyclic(groups: &[CriterionGroup]) -> Result<(), PipelineInvariantError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let by_id: HashMap<&str, &CriterionGroup> = groups.iter().map(|g| (g.id.as_str(), g)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for root in groups {
        if marks.contains_key(root.id.as_str()) {
            continue;
        }
        // Iterative DFS: (group id, next child index).
        let mut stack: Vec<(&str, usize)> = vec![(root.id.as_str(), 0)];
        marks.insert(root.id.as_str(), Mark::Visiting);
        while let Some((id, child)) = stack.pop() {
            let Some(&group) = by_id.get(id) else { continue };
            match group.subgroups.get(child) {
                Some(next) => {
                    stack.push((id, child + 1));
                    match marks.get(next.as_str()) {
                        Some(Mark::Visiting) => {
                            return Err(PipelineInvariantError::GroupCycle(next.clone()))
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(next.as_str(), Mark::Visiting);
                            stack.push((next.as_str(), 0));
                        }
                    }
                }
                None => {
                    marks.insert(id, Mark::Done);
                }
            }
        }
    }
    Ok(())
}

pub fn check_structure(
    criteria: &[Criterion],
    groups: &[CriterionGroup],
    indications: &[Indication],
    exclusions: &[Exclusion],
) -> Result<(), PipelineInvariantError> {
    let mut criterion_ids = HashSet::new();
    for c in criteria {
        if !criterion_ids.insert(c.id.as_str()) {
            return Err(PipelineInvariantError::DuplicateCriterionId(c.id.clone()));
        }
    }
    let mut group_ids = HashSet::new();
    for g in groups {
        if !group_ids.insert(g.id.as_str()) {
            return Err(PipelineInvariantError::DuplicateGroupId(g.id.clone()));
        }
    }

    for g in groups {
        if let Some(missing) = g.criteria.iter().find(|id| !criterion_ids.contains(id.as_str())) {
            return Err(PipelineInvariantError::UnresolvedCriterion {
                group: g.id.clone(),
                criterion: missing.clone(),
            });
        }
        if let Some(missing) = g.subgroups.iter().find(|id| !group_ids.contains(id.as_str())) {
            return Err(PipelineInvariantError::UnresolvedSubgroup {
                group: g.id.clone(),
                subgroup: missing.clone(),
            });
        }
    }
    check_acyclic(groups)?;

    for i in indications {
        let referenced = i.initial_group.iter().chain(i.continuation_group.iter());
        for group in referenced {
            if !group_ids.contains(group.as_str()) {
                return Err(PipelineInvariantError::UnresolvedIndicationGroup {
                    indication: i.id.clone(),
                    group: group.clone(),
                });
            }
        }
    }

    for e in exclusions {
        if let Some(missing) = e
            .trigger_criteria
            .iter()
            .find(|id| !criterion_ids.contains(id.as_str()))
        {
            return Err(PipelineInvariantError::UnresolvedExclusionTrigger {
                exclusion: e.id.clone(),
                criterion: missing.clone(),
            });
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Provenance
// ═══════════════════════════════════════════════════════════

fn resolve_page(criterion: &Criterion, document: &PolicyDocument) -> Result<u32, PipelineInvariantError> {
    if let Some(page) = criterion.source_page {
        if document.has_page(page) {
            return Ok(page);
        }
    }
    if let Some(page) = criterion
        .source_excerpt
        .as_deref()
        .and_then(|excerpt| document.locate(excerpt))
    {
        return Ok(page);
    }
    match (criterion.source_page, document.pages()) {
        (Some(page), _) => Err(PipelineInvariantError::PageOutOfRange {
            criterion: criterion.id.clone(),
            page,
        }),
        (None, [only]) => Ok(only.number),
        (None, _) => Err(PipelineInvariantError::MissingProvenance(criterion.id.clone())),
    }
}

fn provenance_for(criterion: &Criterion, page: u32) -> Provenance {
    Provenance {
        source_page: page,
        source_excerpt: criterion.source_excerpt.clone(),
        confidence: criterion.confidence,
        validation_action: criterion.validation_action(),
        code_results: criterion
            .clinical_codes
            .iter()
            .filter_map(|code| code.status.map(|s| (code.code.clone(), s)))
            .collect(),
    }
}

pub fn assess_quality(
    validated: &ValidatedExtractionResult,
    reference: &ReferenceSummary,
    config: &PipelineConfig,
) -> ExtractionQuality {
    let counts = &validated.counts;
    if counts.flagged_ratio() > config.poor_flag_ratio {
        ExtractionQuality::Poor
    } else if counts.corrected > 0
        || counts.flagged() > 0
        || reference.has_problems()
        || validated.diversity_degraded
    {
        ExtractionQuality::NeedsReview
    } else {
        ExtractionQuality::Good
    }
}

/// Build the immutable policy. Version is left at 0 for the store to assign.
pub fn assemble(input: AssemblyInput<'_>) -> Result<DigitizedPolicy, PipelineInvariantError> {
    let quality = assess_quality(&input.validated, &input.reference, input.config);
    let AssemblyInput {
        payer,
        medication,
        validated,
        document,
        ..
    } = input;
    let extraction = validated.extraction;
    let mut criteria = extraction.criteria;

    check_structure(&criteria, &extraction.groups, &extraction.indications, &extraction.exclusions)?;

    let mut provenance = BTreeMap::new();
    for criterion in &mut criteria {
        let page = resolve_page(criterion, document)?;
        criterion.source_page = Some(page);
        provenance.insert(criterion.id.clone(), provenance_for(criterion, page));
    }

    Ok(DigitizedPolicy {
        payer: payer.trim().to_string(),
        medication: medication.trim().to_string(),
        version: 0,
        policy_title: extraction.policy_title,
        effective_date: extraction.effective_date,
        criteria,
        groups: extraction.groups,
        indications: extraction.indications,
        exclusions: extraction.exclusions,
        safety_screenings: extraction.safety_screenings,
        extraction_quality: quality,
        provenance,
        source_hash: extraction.source_hash,
        extraction_provider: extraction.provider,
        validation_provider: validated.validation_provider,
        created_at: Utc::now(),
    })
}
