//! Context assembly: query-focused excerpts under a character budget.
//!
//! Turns a [`Ranking`] into the single context string handed to the LLM.
//! All lengths are measured in characters, not bytes.
//!
//! # Excerpt Algorithm
//!
//! 1. Content that fits the per-rank budget is used whole.
//! 2. Otherwise slide a 500-char window with a 100-char stride and pick the
//!    window with the most distinct query-token hits (earliest on ties).
//! 3. With no hits anywhere, anchor at the first occurrence of any single
//!    token, else at the start of the document.
//! 4. Take a span of the budget (minus room for `...` markers) from the
//!    anchor. A cut leading edge moves forward to the next sentence start
//!    within 100 chars; a cut trailing edge moves back to the last sentence
//!    terminator (`.`, `!`, `?`, newline) within 200 chars.
//! 5. Mark truncated edges with `...`.
//!
//! Per-rank budgets: 3000 chars for rank 1, 2000 for ranks 2–3, 1000 after.
//! Blocks are joined with a separator and included all-or-nothing until the
//! total budget would be exceeded.

use crate::rank::{query_tokens, RankedChunk, Ranking};

pub const WINDOW_CHARS: usize = 500;
pub const WINDOW_STRIDE: usize = 100;
pub const DEFAULT_CONTEXT_BUDGET: usize = 10_000;

const LEADING_SNAP: usize = 100;
const TRAILING_SNAP: usize = 200;
const ELLIPSIS: &str = "...";
const SEPARATOR: &str = "\n\n---\n\n";

/// Character budget of one excerpt at a 1-based rank.
pub fn rank_budget(rank: usize) -> usize {
    match rank {
        0 | 1 => 3000,
        2 | 3 => 2000,
        _ => 1000,
    }
}

/// Coarse label for a combined score.
pub fn relevance_tier(score: f64) -> &'static str {
    if score >= 0.7 {
        "high"
    } else if score >= 0.4 {
        "medium"
    } else {
        "low"
    }
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n')
}

/// Lowercase char-by-char so indices line up with the original text.
fn lower_chars(chars: &[char]) -> Vec<char> {
    chars
        .iter()
        .map(|c| c.to_lowercase().next().unwrap_or(*c))
        .collect()
}

/// Start (char index) of the window with the most distinct token hits,
/// or `None` if no window contains any token.
pub fn densest_window(lower: &[char], tokens: &[String]) -> Option<usize> {
    if tokens.is_empty() || lower.is_empty() {
        return None;
    }
    let mut best: Option<(usize, usize)> = None;
    let mut start = 0;
    while start < lower.len() {
        let end = (start + WINDOW_CHARS).min(lower.len());
        let window: String = lower[start..end].iter().collect();
        let hits = tokens
            .iter()
            .filter(|t| window.contains(t.as_str()))
            .count();
        if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
            best = Some((start, hits));
        }
        if end == lower.len() {
            break;
        }
        start += WINDOW_STRIDE;
    }
    best.map(|(s, _)| s)
}

/// Char index of the earliest occurrence of any token.
pub fn first_token_position(lower: &[char], tokens: &[String]) -> Option<usize> {
    let text: String = lower.iter().collect();
    tokens
        .iter()
        .filter_map(|t| text.find(t.as_str()))
        .min()
        .map(|byte| text[..byte].chars().count())
}

/// Extract at most `budget` chars of `content` focused on `tokens`.
pub fn extract_excerpt(content: &str, tokens: &[String], budget: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    let n = chars.len();
    if n <= budget {
        return content.to_string();
    }

    let marker = ELLIPSIS.len();
    let avail = budget.saturating_sub(2 * marker);
    if avail == 0 {
        return chars[..budget].iter().collect();
    }

    let lower = lower_chars(&chars);
    let anchor = densest_window(&lower, tokens)
        .or_else(|| first_token_position(&lower, tokens).map(|p| p.saturating_sub(WINDOW_STRIDE)))
        .unwrap_or(0);

    let mut start = anchor.min(n - avail);
    let mut end = start + avail;

    if start > 0 {
        let limit = (start + LEADING_SNAP).min(end);
        if let Some(p) = (start..limit).find(|&i| is_terminator(chars[i])) {
            start = p + 1;
        }
        while start < end && chars[start].is_whitespace() {
            start += 1;
        }
    }

    if end < n {
        let from = end.saturating_sub(TRAILING_SNAP).max(start);
        if let Some(p) = (from..end).rev().find(|&i| is_terminator(chars[i])) {
            end = p + 1;
        }
    }

    let body: String = chars[start..end].iter().collect();
    let mut excerpt = String::with_capacity(body.len() + 2 * marker);
    if start > 0 {
        excerpt.push_str(ELLIPSIS);
    }
    excerpt.push_str(body.trim_end());
    if end < n {
        excerpt.push_str(ELLIPSIS);
    }
    excerpt
}

/// Builds the bounded context block from ranked results.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    total_budget: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_BUDGET)
    }
}

impl ContextAssembler {
    pub fn new(total_budget: usize) -> Self {
        Self { total_budget }
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget
    }

    /// Concatenate excerpts best-first. Returns `""` when nothing fits or
    /// there are no results.
    pub fn assemble(&self, query: &str, ranking: &Ranking) -> String {
        self.assemble_results(query, &ranking.results)
    }

    pub fn assemble_results(&self, query: &str, results: &[RankedChunk]) -> String {
        let tokens = query_tokens(query);
        let mut out = String::new();
        let mut used = 0usize;

        for (i, result) in results.iter().enumerate() {
            let rank = i + 1;
            let excerpt = extract_excerpt(&result.chunk.content, &tokens, rank_budget(rank));
            let block = format!(
                "[Result {} — {}, {} relevance, score {:.2}]\n{}",
                rank,
                result.chunk.source,
                relevance_tier(result.score),
                result.score,
                excerpt
            );
            let block_len = block.chars().count();
            let sep_len = if out.is_empty() { 0 } else { SEPARATOR.len() };
            if used + sep_len + block_len > self.total_budget {
                tracing::debug!(
                    included = i,
                    remaining = results.len() - i,
                    budget = self.total_budget,
                    "context budget reached"
                );
                break;
            }
            if sep_len > 0 {
                out.push_str(SEPARATOR);
            }
            out.push_str(&block);
            used += sep_len + block_len;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentChunk;

    fn filler(chars: usize) -> String {
        "Lorem ipsum dolor sit amet. "
            .chars()
            .cycle()
            .take(chars)
            .collect()
    }

    fn ranked(content: &str, score: f64) -> RankedChunk {
        RankedChunk {
            chunk: DocumentChunk::upload("t1", "p1", content),
            score,
            semantic_score: None,
            text_score: score,
        }
    }

    #[test]
    fn test_rank_budgets() {
        assert_eq!(rank_budget(1), 3000);
        assert_eq!(rank_budget(2), 2000);
        assert_eq!(rank_budget(3), 2000);
        assert_eq!(rank_budget(4), 1000);
        assert_eq!(rank_budget(40), 1000);
    }

    #[test]
    fn test_short_content_used_whole() {
        let tokens = query_tokens("refund");
        assert_eq!(extract_excerpt("Refunds take 5 days.", &tokens, 1000), "Refunds take 5 days.");
    }

    #[test]
    fn test_excerpt_centers_on_dense_cluster() {
        let content = format!(
            "{}Our refund policy: items can be returned within 30 days. {}",
            filler(4000),
            filler(6000)
        );
        let tokens = query_tokens("refund policy");
        let excerpt = extract_excerpt(&content, &tokens, 1000);
        assert!(excerpt.contains("refund policy"), "excerpt: {}", excerpt);
        assert!(excerpt.starts_with("..."));
        assert!(excerpt.ends_with("..."));
        assert!(excerpt.chars().count() <= 1000);
    }

    #[test]
    fn test_excerpt_trims_at_sentence_boundaries() {
        let content = format!("{}Shipping takes two days. {}", filler(3000), filler(3000));
        let tokens = query_tokens("shipping");
        let excerpt = extract_excerpt(&content, &tokens, 1000);
        let body = excerpt.trim_start_matches("...").trim_end_matches("...");
        assert!(body.starts_with("Lorem") || body.starts_with("Shipping"), "{}", body);
        assert!(body.ends_with('.'), "{}", body);
    }

    #[test]
    fn test_no_match_falls_back_to_document_start() {
        let content = filler(5000);
        let excerpt = extract_excerpt(&content, &query_tokens("warranty"), 1000);
        assert!(excerpt.starts_with("Lorem ipsum"));
        assert!(excerpt.ends_with("..."));
        assert!(excerpt.chars().count() <= 1000);
    }

    #[test]
    fn test_first_token_position_counts_chars() {
        let lower = lower_chars(&"ünïcode then refund".chars().collect::<Vec<_>>());
        assert_eq!(first_token_position(&lower, &query_tokens("refund")), Some(13));
        assert_eq!(first_token_position(&lower, &query_tokens("zzz")), None);
    }

    #[test]
    fn test_densest_window_prefers_more_distinct_hits() {
        let content = format!(
            "refund {}refund policy{}",
            filler(1200),
            filler(1200)
        );
        let lower = lower_chars(&content.chars().collect::<Vec<_>>());
        let start = densest_window(&lower, &query_tokens("refund policy")).unwrap();
        assert!(start > 0);
        let window: String = lower[start..start + WINDOW_CHARS].iter().collect();
        assert!(window.contains("refund policy"));
    }

    #[test]
    fn test_excerpt_respects_each_rank_budget() {
        let content = format!("{}delivery times vary. {}", filler(9000), filler(9000));
        let tokens = query_tokens("delivery times");
        for rank in 1..=5 {
            let budget = rank_budget(rank);
            let excerpt = extract_excerpt(&content, &tokens, budget);
            assert!(excerpt.chars().count() <= budget, "rank {}", rank);
        }
    }

    #[test]
    fn test_multibyte_content_does_not_panic() {
        let content = "┌─ Lieferzeit beträgt drei Tage ─┐ ".repeat(200);
        let excerpt = extract_excerpt(&content, &query_tokens("lieferzeit"), 1000);
        assert!(excerpt.chars().count() <= 1000);
    }

    #[test]
    fn test_assemble_empty_is_empty_string() {
        let out = ContextAssembler::default().assemble("anything", &Ranking::default());
        assert_eq!(out, "");
    }

    #[test]
    fn test_assemble_header_and_order() {
        let results = vec![ranked("Shipping is free.", 0.9), ranked("Returns in 30 days.", 0.5)];
        let out = ContextAssembler::default().assemble_results("shipping", &results);
        let first = out.find("[Result 1 — upload, high relevance, score 0.90]").unwrap();
        let second = out.find("[Result 2 — upload, medium relevance, score 0.50]").unwrap();
        assert!(first < second);
        assert!(out.contains("\n\n---\n\n"));
    }

    #[test]
    fn test_assemble_never_exceeds_total_budget() {
        let results: Vec<RankedChunk> = (0..8)
            .map(|i| ranked(&format!("faq {} {}", i, filler(4000)), 0.8))
            .collect();
        for budget in [500, 2500, 6000, 10_000] {
            let out = ContextAssembler::new(budget).assemble_results("faq", &results);
            assert!(out.chars().count() <= budget, "budget {}", budget);
        }
    }

    #[test]
    fn test_assemble_is_all_or_nothing_per_result() {
        let results = vec![ranked("Short answer.", 0.9), ranked(&filler(1500), 0.5)];
        let header_len = "[Result 1 — upload, high relevance, score 0.90]\n".chars().count();
        let budget = header_len + "Short answer.".len() + 100;
        let out = ContextAssembler::new(budget).assemble_results("answer", &results);
        assert!(out.ends_with("Short answer."));
        assert!(!out.contains("[Result 2"));
    }
}
