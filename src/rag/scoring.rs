use std::collections::{HashMap, HashSet};

use super::text::tokenize;

/// Reciprocal-rank-fusion constant
pub const RRF_K: f64 = 60.0;

/// Cosine similarity of two vectors, 0 when either is empty or zero
/// or when their lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Term-frequency score of `text` against the query terms
///
/// Zero when no query term occurs in the text. Longer texts are damped
/// logarithmically.
pub fn keyword_score(query_terms: &HashSet<String>, text: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 0.0;
    }

    let hits = tokens.iter().filter(|t| query_terms.contains(*t)).count();
    if hits == 0 {
        return 0.0;
    }
    let matched_terms = query_terms.iter().filter(|term| tokens.contains(term)).count();

    let coverage = matched_terms as f64 / query_terms.len() as f64;
    coverage * (hits as f64) / (1.0 + (tokens.len() as f64).ln())
}

/// Fuses two ranked id lists with weighted reciprocal-rank fusion
///
/// An id missing from one list is ranked just after that list's last
/// entry. Scores are divided by the best score so the top entry gets 1.
pub fn reciprocal_rank_fusion(
    vector_ranked: &[String],
    keyword_ranked: &[String],
    vector_weight: f64,
    keyword_weight: f64,
) -> Vec<(String, f64)> {
    let rank_of = |list: &[String]| -> HashMap<String, usize> {
        list.iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i + 1))
            .collect()
    };
    let vector_ranks = rank_of(vector_ranked);
    let keyword_ranks = rank_of(keyword_ranked);

    let mut ids: Vec<&String> = vector_ranked.iter().collect();
    for id in keyword_ranked {
        if !vector_ranks.contains_key(id) {
            ids.push(id);
        }
    }

    let mut fused: Vec<(String, f64)> = ids
        .into_iter()
        .map(|id| {
            let v_rank = vector_ranks.get(id).copied().unwrap_or(vector_ranked.len() + 1);
            let k_rank = keyword_ranks.get(id).copied().unwrap_or(keyword_ranked.len() + 1);
            let score = vector_weight / (RRF_K + v_rank as f64) + keyword_weight / (RRF_K + k_rank as f64);
            (id.clone(), score)
        })
        .collect();

    fused.sort_by(|a, b| b.1.total_cmp(&a.1));
    if let Some(best) = fused.first().map(|(_, score)| *score).filter(|s| *s > 0.0) {
        for (_, score) in fused.iter_mut() {
            *score /= best;
        }
    }
    fused
}
