//! Cosine similarity ranking over a cache snapshot.

use std::cmp::Ordering;

use serde::Serialize;

use crate::semantic::snapshot::CacheSnapshot;

/// Score given to rows that cannot be normalized.
const EXCLUDED_SCORE: f32 = -1.0;

/// Below this ratio of k to n a partial selection beats a full sort.
const PARTIAL_SELECT_RATIO: usize = 8;

/// A ranked match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarItem {
    pub id: u64,
    pub item1: String,
    pub item2: String,
    /// Cosine similarity in [-1.0, 1.0]
    pub similarity: f32,
}

/// Errors that can occur while ranking.
#[derive(Debug, thiserror::Error)]
pub enum RankError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot rank against a zero-norm query vector")]
    DegenerateQuery,
}

/// Compute L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Return a unit-length copy of `v`, or `None` when it cannot be normalized.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < f32::EPSILON {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// Score every row of the snapshot against `query`.
///
/// Rows with zero norm score `-1.0` so they sink to the bottom instead of
/// aborting the query.
pub fn score_all(query: &[f32], snapshot: &CacheSnapshot) -> Result<Vec<f32>, RankError> {
    let matrix = snapshot.embeddings();

    if snapshot.is_empty() {
        return Ok(Vec::new());
    }

    if query.len() != matrix.dimensions() {
        return Err(RankError::DimensionMismatch {
            expected: matrix.dimensions(),
            got: query.len(),
        });
    }

    let query = normalize(query).ok_or(RankError::DegenerateQuery)?;

    Ok(matrix
        .iter_rows()
        .map(|row| {
            let norm = l2_norm(row);
            if !norm.is_finite() || norm < f32::EPSILON {
                return EXCLUDED_SCORE;
            }
            let dot: f32 = query.iter().zip(row.iter()).map(|(a, b)| a * b).sum();
            dot / norm
        })
        .collect())
}

/// Descending by score, then ascending by cache position.
fn by_rank(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

/// Indices of the `k` best scores, best first. Ties keep cache order.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let k = k.min(scores.len());
    if k == 0 {
        return Vec::new();
    }

    // NaN would break the total order
    let mut ranked: Vec<(usize, f32)> = scores
        .iter()
        .enumerate()
        .map(|(i, s)| (i, if s.is_nan() { EXCLUDED_SCORE } else { *s }))
        .collect();

    if k * PARTIAL_SELECT_RATIO < ranked.len() {
        ranked.select_nth_unstable_by(k - 1, by_rank);
        ranked.truncate(k);
    }

    ranked.sort_by(by_rank);
    ranked.truncate(k);
    ranked
}

/// Rank the snapshot against `query` and return the top `k` items.
pub fn rank(
    query: &[f32],
    snapshot: &CacheSnapshot,
    k: usize,
) -> Result<Vec<SimilarItem>, RankError> {
    let scores = score_all(query, snapshot)?;
    let items = snapshot.items();

    Ok(top_k(&scores, k)
        .into_iter()
        .map(|(index, similarity)| {
            let item = &items[index];
            SimilarItem {
                id: item.id,
                item1: item.item1.clone(),
                item2: item.item2.clone(),
                similarity,
            }
        })
        .collect())
}
