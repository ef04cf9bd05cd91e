//! Post-pre-search refinement policy for `web_search`.
//!
//! Once a pre-search already ran for the request, further web_search calls
//! in the tool loop are rationed: blocked outright by policy, by a round
//! budget, or when the query duplicates one already searched.

use serde::Serialize;

/// Mutable search state threaded through one request's tool loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchState {
    pub presearch_hit: bool,
    pub allow_tool_refine: bool,
    pub refine_rounds_used: u32,
    pub blocked_duplicate_total: u32,
    pub normalized_queries: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    PolicyBlock,
    MaxRoundsReached,
    DuplicateQuery,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::PolicyBlock => "policy_block",
            BlockReason::MaxRoundsReached => "max_rounds_reached",
            BlockReason::DuplicateQuery => "duplicate_query",
        }
    }

    /// Fixed instruction returned to the model instead of a search result.
    pub fn instruction(&self) -> &'static str {
        match self {
            BlockReason::PolicyBlock | BlockReason::MaxRoundsReached => {
                "搜索结果已在上文提供，请直接基于已有搜索结果回答，不要再调用 web_search。"
            }
            BlockReason::DuplicateQuery => {
                "该查询与已执行的搜索重复，请基于已有搜索结果回答，不要重复搜索。"
            }
        }
    }
}

/// Lowercased, whitespace/punctuation-free form used for duplicate checks.
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Character-bigram Dice similarity in [0, 1].
pub fn query_similarity(a: &str, b: &str) -> f64 {
    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let a_grams = bigrams(a);
    let b_grams = bigrams(b);
    if a_grams.is_empty() || b_grams.is_empty() {
        return if a == b && !a.is_empty() { 1.0 } else { 0.0 };
    }
    let mut b_pool = b_grams.clone();
    let mut hits = 0usize;
    for gram in &a_grams {
        if let Some(pos) = b_pool.iter().position(|g| g == gram) {
            b_pool.swap_remove(pos);
            hits += 1;
        }
    }
    2.0 * hits as f64 / (a_grams.len() + b_grams.len()) as f64
}

fn is_duplicate(normalized: &str, seen: &[String], similarity_threshold: f64) -> bool {
    if normalized.is_empty() {
        return false;
    }
    seen.iter().any(|prev| {
        prev == normalized
            || prev.contains(normalized)
            || normalized.contains(prev.as_str())
            || query_similarity(prev, normalized) >= similarity_threshold
    })
}

impl SearchState {
    pub fn from_presearch(presearch_hit: bool, allow_tool_refine: bool, normalized_query: &str) -> Self {
        let mut queries = Vec::new();
        let normalized = normalize_query(normalized_query);
        if !normalized.is_empty() {
            queries.push(normalized);
        }
        Self {
            presearch_hit,
            allow_tool_refine,
            refine_rounds_used: 0,
            blocked_duplicate_total: 0,
            normalized_queries: queries,
        }
    }

    /// Decide whether this web_search call is blocked. A permitted call
    /// consumes one refine round and records its query.
    pub fn check_web_search(
        &mut self,
        query: &str,
        refine_enabled: bool,
        max_refine_rounds: u32,
        similarity_threshold: f64,
    ) -> Option<BlockReason> {
        let normalized = normalize_query(query);

        if self.presearch_hit && (!refine_enabled || !self.allow_tool_refine) {
            return Some(BlockReason::PolicyBlock);
        }
        if self.presearch_hit && self.refine_rounds_used >= max_refine_rounds {
            return Some(BlockReason::MaxRoundsReached);
        }
        if is_duplicate(&normalized, &self.normalized_queries, similarity_threshold) {
            self.blocked_duplicate_total += 1;
            return Some(BlockReason::DuplicateQuery);
        }

        if self.presearch_hit {
            self.refine_rounds_used += 1;
        }
        if !normalized.is_empty() {
            self.normalized_queries.push(normalized);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_block_when_refine_disallowed() {
        let mut state = SearchState::from_presearch(true, false, "最好的AI模型");
        assert_eq!(
            state.check_web_search("别的查询", true, 2, 0.9),
            Some(BlockReason::PolicyBlock)
        );
    }

    #[test]
    fn rounds_budget_exhausts() {
        let mut state = SearchState::from_presearch(true, true, "初始查询");
        assert_eq!(state.check_web_search("第二个完全不同的问题", true, 1, 0.9), None);
        assert_eq!(
            state.check_web_search("第三个不一样的问题呢", true, 1, 0.9),
            Some(BlockReason::MaxRoundsReached)
        );
    }

    #[test]
    fn near_identical_query_is_duplicate() {
        let mut state = SearchState::from_presearch(false, true, "");
        assert_eq!(state.check_web_search("best AI model 2026", true, 5, 0.9), None);
        assert_eq!(
            state.check_web_search("best AI model 2026!", true, 5, 0.9),
            Some(BlockReason::DuplicateQuery)
        );
        assert_eq!(state.blocked_duplicate_total, 1);
    }

    #[test]
    fn substring_overlap_counts_as_duplicate() {
        let mut state = SearchState::from_presearch(true, true, "现在最好的AI模型是什么");
        assert_eq!(
            state.check_web_search("最好的AI模型", true, 3, 0.9),
            Some(BlockReason::DuplicateQuery)
        );
    }

    #[test]
    fn fresh_query_without_presearch_is_free() {
        let mut state = SearchState::from_presearch(false, true, "");
        assert_eq!(state.check_web_search("rust 所有权", true, 0, 0.9), None);
        assert_eq!(state.refine_rounds_used, 0);
    }
}
