//! One-to-one assignment of old items to new items from a score matrix.
//!
//! Greedy by descending score. Ties go to the lower old index, then the
//! lower new index, so the result depends only on the scores and order.

/// Row per old item, column per new item, scores in 0..=1.
pub type ScoreMatrix = Vec<Vec<f64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub old: usize,
    pub new: usize,
    pub score: f64,
    /// Another candidate sharing an endpoint scored within the ambiguity margin.
    pub ambiguous: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    /// Sorted by old index.
    pub matches: Vec<Match>,
    pub unmatched_old: Vec<usize>,
    pub unmatched_new: Vec<usize>,
}

impl Assignment {
    pub fn match_for_old(&self, old: usize) -> Option<&Match> {
        self.matches.iter().find(|m| m.old == old)
    }
}

/// Check the matrix has `old_len` rows of `new_len` columns.
pub fn has_shape(scores: &ScoreMatrix, old_len: usize, new_len: usize) -> bool {
    scores.len() == old_len && scores.iter().all(|row| row.len() == new_len)
}

pub fn greedy_match(
    scores: &ScoreMatrix,
    old_len: usize,
    new_len: usize,
    threshold: f64,
    ambiguity_margin: f64,
) -> Assignment {
    let score_at = |i: usize, j: usize| -> Option<f64> {
        scores
            .get(i)
            .and_then(|row| row.get(j))
            .copied()
            .filter(|s| s.is_finite())
    };

    let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
    for i in 0..old_len {
        for j in 0..new_len {
            if let Some(score) = score_at(i, j) {
                if score >= threshold {
                    candidates.push((i, j, score));
                }
            }
        }
    }
    candidates.sort_by(|a, b| {
        b.2.total_cmp(&a.2)
            .then_with(|| a.0.cmp(&b.0))
            .then_with(|| a.1.cmp(&b.1))
    });

    let mut old_taken = vec![false; old_len];
    let mut new_taken = vec![false; new_len];
    let mut matches = Vec::new();

    for &(i, j, score) in &candidates {
        if old_taken[i] || new_taken[j] {
            continue;
        }
        old_taken[i] = true;
        new_taken[j] = true;

        let ambiguous = candidates.iter().any(|&(ci, cj, cs)| {
            (ci == i) != (cj == j) && score - cs <= ambiguity_margin
        });
        matches.push(Match {
            old: i,
            new: j,
            score,
            ambiguous,
        });
    }

    matches.sort_by_key(|m| m.old);
    Assignment {
        matches,
        unmatched_old: (0..old_len).filter(|i| !old_taken[*i]).collect(),
        unmatched_new: (0..new_len).filter(|j| !new_taken[*j]).collect(),
    }
}
