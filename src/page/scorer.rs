use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::OracleError;
use crate::oracle::json::{as_int, extract_json, field};
use crate::oracle::{bounded, TextOracle};
use crate::page::options::NavigationOption;
use crate::page::snapshot::PageSnapshot;
use crate::page::text::{excerpt_for_prompt, truncate_chars};
use crate::prompts::{render, NAVIGATION_SCORING};
use crate::utils::MetricsCollector;

/// Phrases that almost always lead to bills
const HIGH_PRIORITY: &[&str] = &[
    "billing history", "transaction history", "payment history", "billing", "transactions",
    "bill history", "account history", "statement history", "utility billing", "my bills",
    "view bills", "view bill", "past bills", "previous bills", "bill pay",
];

const MEDIUM_PRIORITY: &[&str] = &[
    "account", "usage", "dashboard", "statements", "bills", "utilities", "my account",
    "account details", "service history", "usage history", "water bills", "electric bills",
    "gas bills", "utility services",
];

const LOW_PRIORITY: &[&str] = &["overview", "home", "summary", "welcome"];

/// Sections that never hold billing data
const NEGATIVE: &[&str] = &[
    "contact", "help", "faq", "settings", "profile", "privacy", "terms", "outage", "careers",
    "news", "feedback", "support", "accessibility",
];

/// Words used to break score ties
const BILLING_WORDS: &[&str] = &["bill", "account", "statement", "usage", "payment", "transaction"];

/// Rates navigation options with one batched model call, falling back to
/// keyword scoring for anything the model does not answer.
pub struct NavigationScorer {
    text: Arc<dyn TextOracle>,
    timeout: Duration,
    max_prompt_chars: usize,
    max_scored_options: usize,
    metrics: MetricsCollector,
}

impl NavigationScorer {
    pub fn new(
        text: Arc<dyn TextOracle>,
        timeout: Duration,
        max_prompt_chars: usize,
        max_scored_options: usize,
        metrics: MetricsCollector,
    ) -> Self {
        Self { text, timeout, max_prompt_chars, max_scored_options, metrics }
    }

    /// Score every option 1..=10, returned in the order they were given.
    ///
    /// Never fails: a model error or a missing score falls back to keywords.
    /// Ordering is left to the caller, see [`rank`].
    pub async fn score(
        &self,
        mut options: Vec<NavigationOption>,
        snapshot: &PageSnapshot,
        current_url: &str,
    ) -> Vec<NavigationOption> {
        if options.is_empty() {
            return options;
        }

        let asked = options.len().min(self.max_scored_options);
        let model_scores = match self.ask(&options[..asked], snapshot, current_url).await {
            Ok(scores) => scores,
            Err(e) => {
                warn!("Navigation scoring failed for {}, using keyword scores: {}", current_url, e);
                self.metrics.record_fallback("scorer").await;
                HashMap::new()
            }
        };

        let mut keyword_scored = 0;
        for (i, option) in options.iter_mut().enumerate() {
            option.relevance_score = match model_scores.get(&i) {
                Some(score) => *score,
                None => {
                    keyword_scored += 1;
                    keyword_score(option)
                }
            };
        }
        if keyword_scored > 0 && !model_scores.is_empty() {
            debug!("{} options had no model score and were keyword-scored", keyword_scored);
        }

        if let Some(best) = options.iter().max_by_key(|o| (o.relevance_score, Reverse(o.document_order))) {
            info!(
                "Best of {} options on {}: '{}' ({})",
                options.len(),
                current_url,
                best.text,
                best.relevance_score
            );
        }
        options
    }

    async fn ask(
        &self,
        options: &[NavigationOption],
        snapshot: &PageSnapshot,
        current_url: &str,
    ) -> Result<HashMap<usize, u8>, OracleError> {
        let listing = options
            .iter()
            .enumerate()
            .map(|(i, option)| {
                format!(
                    "{}: {:?} | {} | {}",
                    i,
                    option.target,
                    truncate_chars(&option.text, 80),
                    option.destination.as_deref().or(option.raw_locator.href.as_deref()).unwrap_or("(click)")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        // Leave room in the prompt for the option listing
        let budget = self.max_prompt_chars.saturating_sub(listing.len()).max(500);
        let content = excerpt_for_prompt(&snapshot.text, budget);
        let prompt = render(NAVIGATION_SCORING, &[
            ("url", current_url),
            ("title", snapshot.title.as_deref().unwrap_or("(none)")),
            ("content", content.as_str()),
            ("options", listing.as_str()),
        ]);

        let timer = self.metrics.start_timer();
        let result = bounded(self.timeout, self.text.complete(&prompt)).await;
        self.metrics.record_oracle_call("scorer", &result, timer.end()).await;
        parse_scores(&result?, options.len())
    }
}

/// Read per-index scores out of raw model output.
///
/// Accepts `{"scores": [{"index", "score"}]}`, a bare array of such objects,
/// a bare array of numbers in option order, or an object keyed by index.
/// Out-of-range indexes are dropped; scores are clamped to 1..=10.
pub fn parse_scores(raw: &str, option_count: usize) -> Result<HashMap<usize, u8>, OracleError> {
    let value = extract_json(raw)?;
    let list = match &value {
        Value::Object(map) => match field(map, &["scores", "options", "results", "rankings"]) {
            Some(inner) => inner.clone(),
            None => value.clone(),
        },
        _ => value.clone(),
    };

    let mut scores = HashMap::new();
    match &list {
        Value::Array(items) => {
            for (position, item) in items.iter().enumerate() {
                let entry = match item {
                    Value::Object(entry) => {
                        let index = field(entry, &["index", "option", "id", "i"]).and_then(as_int);
                        let score = field(entry, &["score", "relevance", "rating", "relevance_score"]).and_then(as_int);
                        index.zip(score)
                    }
                    other => as_int(other).map(|score| (position as i64, score)),
                };
                if let Some((index, score)) = entry {
                    insert_score(&mut scores, index, score, option_count);
                }
            }
        }
        Value::Object(map) => {
            for (key, score) in map {
                if let (Ok(index), Some(score)) = (key.trim().parse::<i64>(), as_int(score)) {
                    insert_score(&mut scores, index, score, option_count);
                }
            }
        }
        _ => {}
    }

    if scores.is_empty() {
        return Err(OracleError::Malformed("no usable option scores in response".to_string()));
    }
    Ok(scores)
}

fn insert_score(scores: &mut HashMap<usize, u8>, index: i64, score: i64, option_count: usize) {
    if index >= 0 && (index as usize) < option_count {
        scores.entry(index as usize).or_insert(score.clamp(1, 10) as u8);
    }
}

/// Score an option from its label and target alone.
pub fn keyword_score(option: &NavigationOption) -> u8 {
    let text = option.text.to_lowercase();
    let target = option
        .raw_locator
        .href
        .as_deref()
        .or(option.destination.as_deref())
        .unwrap_or_default()
        .to_lowercase()
        .replace(['-', '_', '/', '#'], " ");

    let in_text = |words: &[&str]| words.iter().any(|w| text.contains(w));
    let in_target = |words: &[&str]| words.iter().any(|w| target.contains(w));

    if in_text(HIGH_PRIORITY) {
        9
    } else if in_text(NEGATIVE) {
        1
    } else if in_target(HIGH_PRIORITY) {
        8
    } else if text.contains("bill") || text.contains("statement") || text.contains("payment") {
        7
    } else if in_text(MEDIUM_PRIORITY) {
        6
    } else if in_target(MEDIUM_PRIORITY) {
        5
    } else if in_text(LOW_PRIORITY) {
        3
    } else {
        2
    }
}

/// Order by score, then billing vocabulary in the label, then page order.
pub fn rank(mut options: Vec<NavigationOption>) -> Vec<NavigationOption> {
    options.sort_by_key(|option| {
        let label = option.text.to_lowercase();
        let billing_word = BILLING_WORDS.iter().any(|w| label.contains(w));
        (Reverse(option.relevance_score), Reverse(billing_word), option.document_order)
    });
    options
}
