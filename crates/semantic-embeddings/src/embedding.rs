use anyhow::Result;

/// Compute cosine similarity between two embedding vectors.
///
/// A single pass accumulates the dot product and both squared norms.
/// Zero-magnitude input (including the empty vector) yields 0.0 rather
/// than NaN, so an empty note's embedding compares as dissimilar to
/// everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        anyhow::bail!("Vector dimensions must match: {} vs {}", a.len(), b.len());
    }

    let mut dot = 0.0_f32;
    let mut norm_sq_a = 0.0_f32;
    let mut norm_sq_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_sq_a += x * x;
        norm_sq_b += y * y;
    }

    let denominator = norm_sq_a.sqrt() * norm_sq_b.sqrt();
    if denominator == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / denominator)
}

/// Rank candidates against a query vector.
///
/// Returns the top `top_k` candidates as `(index, similarity)` pairs,
/// best first, so callers keep the score without recomputing it. A
/// dimension mismatch in any candidate is an error rather than a silent
/// zero score.
pub fn find_most_similar(
    query: &[f32],
    candidates: &[Vec<f32>],
    top_k: usize,
) -> Result<Vec<(usize, f32)>> {
    let mut ranked = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.iter().enumerate() {
        ranked.push((index, cosine_similarity(query, candidate)?));
    }

    ranked.sort_by(|(_, a), (_, b)| b.total_cmp(a));
    ranked.truncate(top_k);
    Ok(ranked)
}
