use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::browser::PageSession;
use crate::cli::config::ExtractionSettings;
use crate::extraction::model::parse_model_record;
use crate::extraction::{BillingRecord, ExtractionStrategy, SourceStrategy};
use crate::oracle::{bounded, TextOracle};
use crate::page::text::excerpt_for_prompt;
use crate::page::PageSnapshot;
use crate::prompts::{render, HTML_EXTRACTION};
use crate::utils::MetricsCollector;

/// Asks the text model to read billing data out of the page's visible text.
///
/// Sits behind the selector-based HTML strategy and picks up layouts it has
/// no rules for, such as card dashboards and script-rendered lists.
pub struct HtmlModelStrategy {
    text: Arc<dyn TextOracle>,
    timeout: Duration,
    max_prompt_chars: usize,
    settings: ExtractionSettings,
    metrics: MetricsCollector,
}

impl HtmlModelStrategy {
    pub fn new(
        text: Arc<dyn TextOracle>,
        timeout: Duration,
        max_prompt_chars: usize,
        settings: ExtractionSettings,
        metrics: MetricsCollector,
    ) -> Self {
        Self { text, timeout, max_prompt_chars, settings, metrics }
    }
}

#[async_trait]
impl ExtractionStrategy for HtmlModelStrategy {
    fn source(&self) -> SourceStrategy {
        SourceStrategy::Html
    }

    async fn attempt(&self, snapshot: &PageSnapshot, _session: &dyn PageSession) -> Option<BillingRecord> {
        // Nothing to read without a single figure on the page
        if !snapshot.text.chars().any(|c| c.is_ascii_digit()) {
            debug!("No figures on {}, skipping model extraction", snapshot.url);
            return None;
        }

        let content = excerpt_for_prompt(&snapshot.text, self.max_prompt_chars);
        let prompt = render(HTML_EXTRACTION, &[
            ("url", snapshot.url.as_str()),
            ("content", content.as_str()),
        ]);

        let timer = self.metrics.start_timer();
        let result = bounded(self.timeout, self.text.complete(&prompt)).await;
        self.metrics.record_oracle_call("html_model", &result, timer.end()).await;

        match result.and_then(|raw| parse_model_record(&raw, &self.settings, SourceStrategy::Html)) {
            Ok(record) => record,
            Err(e) => {
                warn!("Model extraction failed for {}: {}", snapshot.url, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::StaticSite;
    use crate::error::OracleError;
    use crate::extraction::Amount;
    use crate::oracle::MockTextOracle;

    const URL: &str = "https://portal.example.com/dashboard";
    const CARDS: &str = r#"<div class="card"><span>Your latest bill</span><b>$199.00</b>
        <span>issued 07/17/2025</span></div><div class="card">Account 4410-2290</div>"#;

    fn strategy(oracle: MockTextOracle, metrics: MetricsCollector) -> HtmlModelStrategy {
        HtmlModelStrategy::new(Arc::new(oracle), Duration::from_secs(1), 4000, ExtractionSettings::default(), metrics)
    }

    #[tokio::test]
    async fn test_reads_billing_from_page_text() {
        let mut oracle = MockTextOracle::new();
        oracle.expect_complete()
            .withf(|prompt| prompt.contains(URL) && prompt.contains("$199.00") && !prompt.contains("<div"))
            .times(1)
            .returning(|_| Ok(r#"{"current_amount": "199.00", "current_period": "July 2025", "account_number": "4410-2290", "transactions": [{"date": "2025-07-17", "amount": "199.00"}], "confidence": 8}"#.into()));
        let metrics = MetricsCollector::new();

        let site = StaticSite::new(URL).page(URL, CARDS);
        let record = strategy(oracle, metrics.clone())
            .attempt(&PageSnapshot::new(1, URL, CARDS), &site)
            .await
            .unwrap();

        assert_eq!(record.source_strategy, SourceStrategy::Html);
        assert_eq!(record.current_amount, Some(Amount::from_cents(19900)));
        assert_eq!(record.account_number.as_deref(), Some("4410-2290"));
        assert_eq!(record.transactions.len(), 1);
        assert_eq!(record.confidence, 8);
        assert_eq!(metrics.get_metrics().await.oracle_calls.get("html_model").map(|s| s.calls), Some(1));
    }

    #[tokio::test]
    async fn test_model_failure_or_empty_answer_yields_nothing() {
        let site = StaticSite::new(URL).page(URL, CARDS);
        let snapshot = PageSnapshot::new(1, URL, CARDS);

        let mut down = MockTextOracle::new();
        down.expect_complete()
            .returning(|_| Err(OracleError::Unreachable("connection refused".into())));
        assert!(strategy(down, MetricsCollector::new()).attempt(&snapshot, &site).await.is_none());

        let mut empty = MockTextOracle::new();
        empty.expect_complete()
            .returning(|_| Ok(r#"{"current_amount": null, "transactions": [], "confidence": 1}"#.into()));
        assert!(strategy(empty, MetricsCollector::new()).attempt(&snapshot, &site).await.is_none());
    }

    #[tokio::test]
    async fn test_pages_without_figures_skip_the_model() {
        let mut oracle = MockTextOracle::new();
        oracle.expect_complete().times(0);
        let html = "<h1>Welcome</h1><p>Choose a section from the menu</p>";
        let site = StaticSite::new(URL).page(URL, html);

        let found = strategy(oracle, MetricsCollector::new())
            .attempt(&PageSnapshot::new(1, URL, html), &site)
            .await;
        assert!(found.is_none());
    }
}
