use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::browser::PageSession;
use crate::cli::config::ExtractionSettings;
use crate::error::OracleError;
use crate::extraction::model::parse_model_record;
use crate::extraction::{BillingRecord, ExtractionStrategy, SourceStrategy};
use crate::oracle::{bounded, VisionOracle};
use crate::page::PageSnapshot;
use crate::prompts::{render, VISION_EXTRACTION};
use crate::utils::MetricsCollector;

/// Asks a vision model to read billing data off a screenshot of the page.
pub struct VisionStrategy {
    vision: Arc<dyn VisionOracle>,
    timeout: Duration,
    settings: ExtractionSettings,
    metrics: MetricsCollector,
}

impl VisionStrategy {
    pub fn new(
        vision: Arc<dyn VisionOracle>,
        timeout: Duration,
        settings: ExtractionSettings,
        metrics: MetricsCollector,
    ) -> Self {
        Self { vision, timeout, settings, metrics }
    }

    async fn screenshot(&self, snapshot: &PageSnapshot, session: &dyn PageSession) -> Option<Vec<u8>> {
        if let Some(png) = &snapshot.screenshot {
            return Some(png.clone());
        }
        match session.screenshot().await {
            Ok(png) => Some(png),
            Err(e) => {
                debug!("No screenshot for vision extraction on {}: {}", snapshot.url, e);
                None
            }
        }
    }

    /// Turn the model's answer into a record, keeping only plausible values.
    pub fn parse_record(&self, raw: &str) -> Result<Option<BillingRecord>, OracleError> {
        parse_model_record(raw, &self.settings, SourceStrategy::Vision)
    }
}

#[async_trait]
impl ExtractionStrategy for VisionStrategy {
    fn source(&self) -> SourceStrategy {
        SourceStrategy::Vision
    }

    async fn attempt(&self, snapshot: &PageSnapshot, session: &dyn PageSession) -> Option<BillingRecord> {
        let png = self.screenshot(snapshot, session).await?;
        let prompt = render(VISION_EXTRACTION, &[("url", snapshot.url.as_str())]);

        let timer = self.metrics.start_timer();
        let result = bounded(self.timeout, self.vision.complete_with_image(&prompt, &png)).await;
        self.metrics.record_oracle_call("vision", &result, timer.end()).await;

        match result.and_then(|raw| self.parse_record(&raw)) {
            Ok(record) => record,
            Err(e) => {
                warn!("Vision extraction failed for {}: {}", snapshot.url, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::StaticSite;
    use crate::extraction::model::DEFAULT_CONFIDENCE;
    use crate::extraction::Amount;
    use crate::oracle::MockVisionOracle;

    const URL: &str = "https://portal.example.com/bills";

    fn strategy(oracle: MockVisionOracle) -> VisionStrategy {
        VisionStrategy::new(Arc::new(oracle), Duration::from_secs(1), ExtractionSettings::default(), MetricsCollector::new())
    }

    #[tokio::test]
    async fn test_reads_model_answer() {
        let mut oracle = MockVisionOracle::new();
        oracle.expect_complete_with_image()
            .withf(|prompt, png| prompt.contains(URL) && png.to_vec() == vec![137u8, 80, 78, 71])
            .times(1)
            .returning(|_, _| Ok(r#"{"current_amount": "142.30", "previous_amount": null, "due_date": "2025-04-15", "account_number": "1234567890", "transactions": [], "confidence": 7}"#.into()));

        let site = StaticSite::new(URL).page(URL, "<canvas></canvas>");
        let snapshot = PageSnapshot::new(1, URL, "<canvas></canvas>").with_screenshot(vec![137, 80, 78, 71]);
        let record = strategy(oracle).attempt(&snapshot, &site).await.unwrap();

        assert_eq!(record.source_strategy, SourceStrategy::Vision);
        assert_eq!(record.current_amount, Some(Amount::from_cents(14230)));
        assert_eq!(record.previous_amount, None);
        assert_eq!(record.account_number.as_deref(), Some("1234567890"));
        assert_eq!(record.confidence, 7);
    }

    #[tokio::test]
    async fn test_takes_screenshot_from_session() {
        let mut oracle = MockVisionOracle::new();
        oracle.expect_complete_with_image()
            .withf(|_, png| png.to_vec() == vec![1u8, 2, 3])
            .returning(|_, _| Ok(r#"{"bills": [{"date": "2025-05-01", "amount": 61.5}, {"date": "2025-06-01", "amount": 64}]}"#.into()));

        let site = StaticSite::new(URL).page(URL, "<canvas></canvas>").with_screenshot(URL, vec![1, 2, 3]);
        let snapshot = PageSnapshot::new(1, URL, "<canvas></canvas>");
        let record = strategy(oracle).attempt(&snapshot, &site).await.unwrap();

        assert_eq!(record.current_amount, Some(Amount::from_cents(6400)));
        assert_eq!(record.previous_amount, Some(Amount::from_cents(6150)));
        assert_eq!(record.confidence, DEFAULT_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_failures_yield_nothing() {
        let mut oracle = MockVisionOracle::new();
        oracle.expect_complete_with_image()
            .returning(|_, _| Err(OracleError::Timeout(Duration::from_secs(1))));
        let site = StaticSite::new(URL).page(URL, "<p></p>");
        let snapshot = PageSnapshot::new(1, URL, "<p></p>").with_screenshot(vec![1]);
        assert!(strategy(oracle).attempt(&snapshot, &site).await.is_none());

        // No screenshot anywhere: the model is never called
        let mut unused = MockVisionOracle::new();
        unused.expect_complete_with_image().times(0);
        let bare = PageSnapshot::new(1, URL, "<p></p>");
        assert!(strategy(unused).attempt(&bare, &site).await.is_none());
    }

    #[test]
    fn test_implausible_values_are_dropped() {
        let oracle = MockVisionOracle::new();
        let parsed = strategy(oracle)
            .parse_record(r#"{"current_amount": "999999.00", "due_date": "1970-01-01"}"#)
            .unwrap();
        assert!(parsed.is_none());
    }
}
