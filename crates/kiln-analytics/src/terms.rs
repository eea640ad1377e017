//! Trending terms.
//!
//! Event content is lowercased, every non-alphanumeric character becomes a
//! space, and tokens of four or more characters that are not stop words are
//! counted. Terms rank by count desc, then alphabetically.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use kiln_types::{CancelToken, SubjectId};

use crate::aggregator::{Aggregator, Outcome, SentimentSum};
use crate::error::AnalyticsError;
use crate::window::Window;

/// Words never reported as trending.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "is", "are", "was", "were", "been", "be", "have", "has", "had", "do", "does", "did",
    "will", "would", "could", "should", "may", "might", "must", "can", "this", "that", "these",
    "those", "i", "you", "he", "she", "it", "we", "they", "them", "their", "what", "which", "who",
    "when", "where", "why", "how", "all", "each", "every", "some", "any", "few", "more", "most",
    "other", "into", "through", "during", "before", "after", "above", "below", "up", "down",
    "out", "off", "over", "under", "again", "further", "then", "once",
];

/// Minimum token length, in characters, exclusive.
const MIN_LEN_EXCLUSIVE: usize = 3;

/// One ranked term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermCount {
    /// Normalized term.
    pub term: String,
    /// Occurrences in the window.
    pub count: u64,
    /// Mean sentiment of the classified events it appeared in.
    pub average_sentiment: f64,
}

/// Split text into countable terms.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|t| t.chars().count() > MIN_LEN_EXCLUSIVE && !STOP_WORDS.contains(t))
        .map(str::to_owned)
        .collect()
}

impl Aggregator {
    /// The `limit` most frequent terms in a subject's events over `window`.
    pub async fn trending_terms(
        &self,
        subject: &SubjectId,
        window: Window,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Outcome<Vec<TermCount>>, AnalyticsError> {
        let resolved = window.resolve(chrono::Utc::now())?;
        let mut counts: HashMap<String, (u64, SentimentSum)> = HashMap::new();

        let scan = self
            .for_each_event(subject, &resolved, cancel, |event| {
                let Some(content) = event.content.as_deref() else {
                    return;
                };
                for term in tokenize(content) {
                    let entry = counts.entry(term).or_default();
                    entry.0 = entry.0.saturating_add(1);
                    entry.1.add(event.sentiment_label);
                }
            })
            .await?;
        if scan.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let mut terms: Vec<TermCount> = counts
            .into_iter()
            .map(|(term, (count, sentiment))| TermCount {
                term,
                count,
                average_sentiment: sentiment.mean(),
            })
            .collect();
        terms.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
        terms.truncate(limit);
        Ok(Outcome::Complete(terms))
    }
}
