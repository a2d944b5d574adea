//! Similarity ranking with hybrid scoring and an adaptive threshold.
//!
//! Ranking is a pure, in-memory linear scan over the candidate snapshot
//! returned by the store. It never fails: absent or mismatched vectors
//! degrade to text-overlap scoring.
//!
//! # Scoring Algorithm
//!
//! 1. Tokenize the query: lowercase, split on whitespace, keep distinct
//!    tokens of at least 2 characters.
//! 2. Text overlap = (tokens found as substrings of the lowercased content
//!    + 1 if the whole query phrase occurs) / token count.
//! 3. If both query and chunk have embeddings:
//!    `score = w × cosine + (1 - w) × overlap` (`w = 0.7`); otherwise
//!    `score = overlap`.
//! 4. Stable sort by score (desc); ties keep storage order.
//! 5. Threshold = 0.3, raised to `top × 0.5` when `top > 0.7`.
//! 6. Keep results ≥ threshold, capped at `k`. If none clear it, return
//!    the top `min(3, k, |C|)` as a degraded-confidence fallback.

use serde::Serialize;

use crate::embedding::cosine_similarity;
use crate::models::DocumentChunk;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RankParams {
    /// Weight of cosine similarity in the hybrid score.
    pub embedding_weight: f64,
    /// Threshold used unless the top score is high-confidence.
    pub base_threshold: f64,
    /// Top score above which the threshold tightens.
    pub high_confidence: f64,
    /// Threshold as a fraction of the top score in high-confidence mode.
    pub high_confidence_ratio: f64,
    /// Maximum number of results returned by the fallback path.
    pub fallback_count: usize,
}

impl Default for RankParams {
    fn default() -> Self {
        Self {
            embedding_weight: 0.7,
            base_threshold: 0.3,
            high_confidence: 0.7,
            high_confidence_ratio: 0.5,
            fallback_count: 3,
        }
    }
}

/// A chunk with its relevance scores.
#[derive(Debug, Clone, Serialize)]
pub struct RankedChunk {
    pub chunk: DocumentChunk,
    /// Combined score used for ordering.
    pub score: f64,
    /// Cosine similarity, when both sides had embeddings.
    pub semantic_score: Option<f64>,
    /// Normalized text overlap.
    pub text_score: f64,
}

/// Output of [`rank`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Ranking {
    /// Selected results, best first.
    pub results: Vec<RankedChunk>,
    /// The threshold that was applied.
    pub threshold: f64,
    /// True when nothing cleared the threshold and the best available
    /// candidates were returned instead.
    pub fallback: bool,
}

impl Ranking {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Split a query into distinct lowercase tokens of length ≥ 2.
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for t in query.to_lowercase().split_whitespace() {
        if t.chars().count() >= 2 && !tokens.iter().any(|seen| seen == t) {
            tokens.push(t.to_string());
        }
    }
    tokens
}

/// Text-overlap score of a content string against query tokens.
///
/// `content_lower` must already be lowercased. Returns `0.0` when the
/// query has no usable tokens. The phrase bonus can push the score above
/// `1.0`; scores are only compared with each other and the threshold.
pub fn text_overlap_score(query: &str, tokens: &[String], content_lower: &str) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let hits = tokens
        .iter()
        .filter(|t| content_lower.contains(t.as_str()))
        .count() as f64;
    let phrase = query.trim().to_lowercase();
    let bonus = if !phrase.is_empty() && content_lower.contains(&phrase) {
        1.0
    } else {
        0.0
    };
    (hits + bonus) / tokens.len() as f64
}

/// Score every candidate without filtering, preserving input order.
pub fn score_candidates(
    query: &str,
    query_vec: Option<&[f32]>,
    candidates: Vec<DocumentChunk>,
    params: &RankParams,
) -> Vec<RankedChunk> {
    let tokens = query_tokens(query);
    let query_vec = query_vec.filter(|v| !v.is_empty());

    candidates
        .into_iter()
        .map(|chunk| {
            let text_score = text_overlap_score(query, &tokens, &chunk.content.to_lowercase());
            let semantic_score = match query_vec {
                Some(qv) if !chunk.embedding.is_empty() => {
                    Some(cosine_similarity(qv, &chunk.embedding) as f64)
                }
                _ => None,
            };
            let score = match semantic_score {
                Some(cos) => {
                    params.embedding_weight * cos + (1.0 - params.embedding_weight) * text_score
                }
                None => text_score,
            };
            RankedChunk {
                chunk,
                score,
                semantic_score,
                text_score,
            }
        })
        .collect()
}

/// Sort scored chunks and apply the adaptive threshold.
///
/// `k` is clamped to at least 1. If `scored` is non-empty the result is
/// never empty.
pub fn select(mut scored: Vec<RankedChunk>, k: usize, params: &RankParams) -> Ranking {
    if scored.is_empty() {
        return Ranking {
            results: Vec::new(),
            threshold: params.base_threshold,
            fallback: false,
        };
    }
    let k = k.max(1);

    // `sort_by` is stable: equal scores keep storage order.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let top = scored[0].score;
    let threshold = if top > params.high_confidence {
        top * params.high_confidence_ratio
    } else {
        params.base_threshold
    };

    let passing = scored.iter().take_while(|r| r.score >= threshold).count();
    if passing > 0 {
        scored.truncate(passing.min(k));
        return Ranking {
            results: scored,
            threshold,
            fallback: false,
        };
    }

    let keep = params.fallback_count.min(k).min(scored.len()).max(1);
    tracing::warn!(
        top_score = top,
        threshold,
        returned = keep,
        "no candidate cleared the relevance threshold; returning best available"
    );
    scored.truncate(keep);
    Ranking {
        results: scored,
        threshold,
        fallback: true,
    }
}

/// Rank `candidates` for `query` and return at most `k` results.
pub fn rank(
    query: &str,
    query_vec: Option<&[f32]>,
    candidates: Vec<DocumentChunk>,
    k: usize,
    params: &RankParams,
) -> Ranking {
    let total = candidates.len();
    let ranking = select(score_candidates(query, query_vec, candidates, params), k, params);
    tracing::debug!(
        candidates = total,
        selected = ranking.results.len(),
        threshold = ranking.threshold,
        fallback = ranking.fallback,
        "ranked candidates"
    );
    ranking
}
