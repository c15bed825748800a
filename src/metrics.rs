use pyo3::prelude::*;

// ── Pure-Rust metric functions (no PyO3, take ranks or slices) ─────────────
// The sequential evaluators rank exactly one held-out item per user, so the
// core forms take the 0-indexed rank of that item directly.

#[inline]
pub(crate) fn hit_at_k_from_rank(rank: usize, k: usize) -> f32 {
    if rank < k { 1.0 } else { 0.0 }
}

#[inline]
pub(crate) fn ndcg_at_k_from_rank(rank: usize, k: usize) -> f32 {
    if rank < k {
        1.0 / (2.0 + rank as f32).log2()
    } else {
        0.0
    }
}

#[inline]
pub(crate) fn reciprocal_rank(rank: usize) -> f32 {
    1.0 / (1.0 + rank as f32)
}

// List-based forms for ranked prediction lists (single relevant item).

pub(crate) fn hit_rate_raw(target: i32, predicted: &[i32], k: usize) -> f32 {
    let k_actual = k.min(predicted.len());
    if predicted[..k_actual].contains(&target) { 1.0 } else { 0.0 }
}

pub(crate) fn ndcg_raw(target: i32, predicted: &[i32], k: usize) -> f32 {
    let k_actual = k.min(predicted.len());
    match predicted[..k_actual].iter().position(|&p| p == target) {
        Some(pos) => ndcg_at_k_from_rank(pos, k),
        None => 0.0,
    }
}

pub(crate) fn mrr_raw(target: i32, predicted: &[i32]) -> f32 {
    match predicted.iter().position(|&p| p == target) {
        Some(pos) => reciprocal_rank(pos),
        None => 0.0,
    }
}

// ── PyO3 wrappers ──────────────────────────────────────────────────

#[pyfunction]
pub fn hit_rate_at_k(target: i32, predicted: Vec<i32>, k: usize) -> f32 {
    hit_rate_raw(target, &predicted, k)
}

#[pyfunction]
pub fn ndcg_at_k(target: i32, predicted: Vec<i32>, k: usize) -> f32 {
    ndcg_raw(target, &predicted, k)
}

#[pyfunction]
pub fn mrr(target: i32, predicted: Vec<i32>) -> f32 {
    mrr_raw(target, &predicted)
}
