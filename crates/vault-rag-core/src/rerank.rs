//! Secondary ranking signals applied on top of hybrid scores.
//!
//! ```text
//! final = combined + category_bonus + min(outbound_links × per_link_weight, link_bonus_cap)
//! ```
//!
//! `category_bonus` applies only when the chunk's category is one of the
//! intents inferred from the query through an [`IntentTable`].

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::index::search_terms;
use crate::models::{Query, RetrievedChunk};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankParams {
    pub category_bonus: f64,
    pub per_link_weight: f64,
    pub link_bonus_cap: f64,
}

impl Default for RerankParams {
    fn default() -> Self {
        Self {
            category_bonus: 0.1,
            per_link_weight: 0.01,
            link_bonus_cap: 0.1,
        }
    }
}

impl RerankParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, v) in [
            ("category_bonus", self.category_bonus),
            ("per_link_weight", self.per_link_weight),
            ("link_bonus_cap", self.link_bonus_cap),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(ConfigError(format!(
                    "rerank.{name} must be a non-negative number, got {v}"
                )));
            }
        }
        Ok(())
    }

    pub fn link_bonus(&self, outbound_links: usize) -> f64 {
        (outbound_links as f64 * self.per_link_weight).min(self.link_bonus_cap)
    }
}

/// Keywords that signal interest in one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRule {
    pub category: String,
    pub keywords: Vec<String>,
}

/// Keyword → category lookup used to infer query intent.
///
/// Matching ignores case and punctuation. Multi-word keywords must appear as
/// a contiguous phrase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentTable {
    rules: Vec<(String, Vec<Vec<String>>)>,
}

impl IntentTable {
    pub fn new(rules: &[IntentRule]) -> Self {
        let rules = rules
            .iter()
            .map(|r| {
                let phrases = r
                    .keywords
                    .iter()
                    .map(|k| search_terms(k))
                    .filter(|terms| !terms.is_empty())
                    .collect();
                (r.category.to_lowercase(), phrases)
            })
            .collect();
        Self { rules }
    }

    /// Categories (lowercased) whose keywords occur in `query`.
    pub fn infer(&self, query: &str) -> Vec<&str> {
        let terms = search_terms(query);
        self.rules
            .iter()
            .filter(|(_, phrases)| phrases.iter().any(|p| contains_phrase(&terms, p)))
            .map(|(category, _)| category.as_str())
            .collect()
    }
}

fn contains_phrase(terms: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && terms.windows(phrase.len()).any(|w| w == phrase)
}

/// Built-in intents for a personal knowledge vault.
pub fn default_intents() -> Vec<IntentRule> {
    let rule = |category: &str, keywords: &[&str]| IntentRule {
        category: category.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    };
    vec![
        rule(
            "Spiritual",
            &[
                "spiritual",
                "spirituality",
                "presence",
                "present moment",
                "meditation",
                "mindfulness",
                "consciousness",
                "awareness",
                "ego",
                "enlightenment",
                "soul",
            ],
        ),
        rule(
            "Self-Help",
            &[
                "habit",
                "habits",
                "productivity",
                "goal",
                "goals",
                "motivation",
                "discipline",
                "self improvement",
            ],
        ),
        rule(
            "Psychology",
            &[
                "anxiety",
                "emotion",
                "emotions",
                "trauma",
                "therapy",
                "behavior",
                "behaviour",
                "cognitive",
            ],
        ),
        rule(
            "Philosophy",
            &["philosophy", "stoic", "stoicism", "ethics", "meaning", "virtue"],
        ),
    ]
}

pub struct ReRanker {
    params: RerankParams,
    intents: IntentTable,
}

impl ReRanker {
    pub fn new(params: RerankParams, intents: IntentTable) -> Self {
        Self { params, intents }
    }

    pub fn params(&self) -> &RerankParams {
        &self.params
    }

    /// Score, order, and truncate candidates. `combined_score` is left
    /// untouched; only `final_score` is written.
    pub fn rerank(
        &self,
        mut candidates: Vec<RetrievedChunk>,
        query: &Query,
        top_k: usize,
    ) -> Vec<RetrievedChunk> {
        let intents = self.intents.infer(&query.raw_text);
        if !intents.is_empty() {
            tracing::debug!(?intents, "query intent inferred");
        }

        for c in &mut candidates {
            let meta = &c.chunk.metadata;
            let category = meta.category.to_lowercase();
            let category_bonus = if intents.contains(&category.as_str()) {
                self.params.category_bonus
            } else {
                0.0
            };
            c.final_score =
                c.combined_score + category_bonus + self.params.link_bonus(meta.outbound_link_count);
        }

        candidates.sort_by(|a, b| {
            b.final_score
                .total_cmp(&a.final_score)
                .then_with(|| a.tie_break_key().cmp(&b.tie_break_key()))
        });
        candidates.truncate(top_k);
        candidates
    }
}

impl Default for ReRanker {
    fn default() -> Self {
        Self::new(RerankParams::default(), IntentTable::new(&default_intents()))
    }
}
