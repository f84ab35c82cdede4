//! Vector similarity and result ranking utilities.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity
//! - Unit normalization (the HNSW graph stores unit vectors)
//! - Result ordering shared by every store backend

use planctx_core::error::StoreError;
use planctx_core::memory::{EmbeddingRecord, ScoredRecord};
use std::cmp::Ordering;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Scale a vector to unit length. A zero vector stays zero.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm < 1e-10 {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| (*x as f64 / norm) as f32).collect()
}

/// Dot product of two unit vectors, i.e. their cosine similarity.
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Reject vectors whose length differs from the store's dimension.
pub fn check_dimension(expected: usize, vector: &[f32]) -> Result<(), StoreError> {
    if vector.len() != expected {
        return Err(StoreError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Result order: similarity descending, then most recently updated, then id.
pub fn compare_scored(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Drop results under `threshold`, sort, and keep the best `top_k`.
pub fn rank(mut results: Vec<ScoredRecord>, threshold: f32, top_k: usize) -> Vec<ScoredRecord> {
    results.retain(|r| r.similarity >= threshold);
    results.sort_by(compare_scored);
    results.truncate(top_k);
    results
}

/// Exact nearest-neighbour search over active records of one plan.
///
/// Linear in the number of records; the reference the HNSW index is
/// measured against.
pub fn exact_nearest<'a, I>(
    records: I,
    plan_id: &str,
    query: &[f32],
    top_k: usize,
    threshold: f32,
) -> Vec<ScoredRecord>
where
    I: IntoIterator<Item = &'a EmbeddingRecord>,
{
    let scored = records
        .into_iter()
        .filter(|r| r.plan_id == plan_id && r.is_active())
        .map(|r| ScoredRecord {
            similarity: cosine_similarity(&r.vector, query),
            record: r.clone(),
        })
        .collect();
    rank(scored, threshold, top_k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use planctx_core::memory::SoftDelete;

    fn record(id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id: id.into(),
            plan_id: "plan".into(),
            ref_type: "note".into(),
            ref_id: None,
            content: id.into(),
            vector,
            deletion: SoftDelete::default(),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn opposite_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_or_zero_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn normalize_unit_length() {
        let n = normalize(&[3.0, 4.0]);
        assert!((n[0] - 0.6).abs() < 1e-6);
        assert!((n[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn dimension_check() {
        assert!(check_dimension(3, &[1.0, 2.0, 3.0]).is_ok());
        let err = check_dimension(3, &[1.0]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch { expected: 3, actual: 1 }
        ));
    }

    #[test]
    fn ties_break_on_recency_then_id() {
        let now = Utc::now();
        let mut older = record("b", vec![1.0, 0.0]);
        older.updated_at = now - Duration::seconds(10);
        let mut newer = record("c", vec![1.0, 0.0]);
        newer.updated_at = now;
        let mut same_time = record("a", vec![1.0, 0.0]);
        same_time.updated_at = now;

        let ranked = rank(
            vec![
                ScoredRecord { record: older, similarity: 0.9 },
                ScoredRecord { record: newer, similarity: 0.9 },
                ScoredRecord { record: same_time, similarity: 0.9 },
            ],
            0.0,
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn exact_nearest_filters_threshold_and_deleted() {
        let mut deleted = record("gone", vec![1.0, 0.0]);
        deleted.deletion.mark("tester", Utc::now());
        let records = vec![
            record("close", vec![0.9, 0.1]),
            record("far", vec![0.0, 1.0]),
            deleted,
        ];

        let results = exact_nearest(&records, "plan", &[1.0, 0.0], 10, 0.5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, "close");
    }
}
