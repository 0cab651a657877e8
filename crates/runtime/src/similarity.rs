//! Similarity helpers shared by memory retrieval and curiosity scanning.
//!
//! Pure in-memory math; nothing here suspends.

/// Cosine similarity of two equal-length vectors.
///
/// Zero-length or mismatched vectors score `0.0`, as does a zero-magnitude
/// operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Token-overlap similarity of two texts (Jaccard over lowercased words).
///
/// Used by the curiosity engine to spot subtle contradictions: two facts
/// about the same entity that are similar but not near-identical.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let words_a: std::collections::HashSet<String> = a
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    let words_b: std::collections::HashSet<String> = b
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();

    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count() as f64;
    let union = words_a.union(&words_b).count() as f64;
    intersection / union
}

/// Reciprocal Rank Fusion over ranked id lists.
///
/// Ranks are 1-based; an item's fused score is `Σ 1/(k + rank)` across the
/// lists it appears in. Output is ordered by score descending; the sort is
/// stable over first-appearance order, so callers control tie behavior by
/// the order in which they pass lists.
pub fn reciprocal_rank_fusion<T: Clone + Eq + std::hash::Hash>(
    lists: &[Vec<T>],
    k: f64,
) -> Vec<(T, f64)> {
    let mut order: Vec<T> = Vec::new();
    let mut scores: std::collections::HashMap<T, f64> = std::collections::HashMap::new();

    for list in lists {
        for (index, item) in list.iter().enumerate() {
            let rank = (index + 1) as f64;
            let entry = scores.entry(item.clone()).or_insert_with(|| {
                order.push(item.clone());
                0.0
            });
            *entry += 1.0 / (k + rank);
        }
    }

    let mut fused: Vec<(T, f64)> = order
        .into_iter()
        .map(|item| {
            let score = scores[&item];
            (item, score)
        })
        .collect();
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3f32, -0.5, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
    }

    #[test]
    fn cosine_rejects_mismatched_and_empty_inputs() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn text_similarity_bounds() {
        assert!((text_similarity("the same words", "the same words") - 1.0).abs() < 1e-9);
        assert_eq!(text_similarity("alpha beta", "gamma delta"), 0.0);
        assert_eq!(text_similarity("", "anything"), 0.0);
    }

    #[test]
    fn text_similarity_ignores_case_and_punctuation() {
        let sim = text_similarity("The server is FAST.", "the server is fast");
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rrf_scores_items_across_lists() {
        let lists = vec![vec!["m1", "m2"], vec!["m2", "m1"]];
        let fused = reciprocal_rank_fusion(&lists, 60.0);
        // Both appear at ranks 1 and 2, so scores tie and first-seen wins.
        assert_eq!(fused[0].0, "m1");
        assert!((fused[0].1 - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
        assert!((fused[1].1 - fused[0].1).abs() < 1e-12);
    }

    #[test]
    fn rrf_single_list_preserves_rank_order() {
        let fused = reciprocal_rank_fusion(&[vec![10, 20, 30]], 60.0);
        assert_eq!(
            fused.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn rrf_item_in_both_lists_outranks_single_list_items() {
        let fused = reciprocal_rank_fusion(&[vec!["kw_only", "both"], vec!["vec_only", "both"]], 60.0);
        assert_eq!(fused[0].0, "both");
    }
}
