use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::OracleError;
use crate::oracle::json::{as_bool, as_int, extract_json, field};
use crate::oracle::{bounded, TextOracle};
use crate::page::text::excerpt_for_prompt;
use crate::page::PageSnapshot;
use crate::prompts::{render, BILLING_HISTORY_EVALUATION};
use crate::utils::MetricsCollector;

/// How complete the billing history on a page looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataQuality {
    Detailed,
    Partial,
    Minimal,
    None,
}

impl DataQuality {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "detailed" => DataQuality::Detailed,
            "partial" => DataQuality::Partial,
            "minimal" => DataQuality::Minimal,
            _ => DataQuality::None,
        }
    }
}

/// The model's verdict on whether a page shows enough months of history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryAssessment {
    pub sufficient: bool,
    pub months_found: u32,
    pub data_quality: DataQuality,
    pub entries_found: usize,
    pub reason: Option<String>,
    /// Set when the model could not be asked or its answer was unusable
    pub degraded: bool,
}

impl HistoryAssessment {
    fn unknown(reason: String) -> Self {
        Self {
            sufficient: false,
            months_found: 0,
            data_quality: DataQuality::None,
            entries_found: 0,
            reason: Some(reason),
            degraded: true,
        }
    }
}

/// Judges whether a page holds at least `min_months` of billing history.
pub struct HistoryEvaluator {
    text: Arc<dyn TextOracle>,
    timeout: Duration,
    max_prompt_chars: usize,
    min_months: u32,
    metrics: MetricsCollector,
}

impl HistoryEvaluator {
    pub fn new(
        text: Arc<dyn TextOracle>,
        timeout: Duration,
        max_prompt_chars: usize,
        min_months: u32,
        metrics: MetricsCollector,
    ) -> Self {
        Self { text, timeout, max_prompt_chars, min_months, metrics }
    }

    pub fn min_months(&self) -> u32 {
        self.min_months
    }

    /// Never fails: an unreachable model or an unusable answer yields a
    /// degraded, insufficient assessment.
    pub async fn evaluate(&self, snapshot: &PageSnapshot) -> HistoryAssessment {
        let content = excerpt_for_prompt(&snapshot.text, self.max_prompt_chars);
        let min_months = self.min_months.to_string();
        let prompt = render(BILLING_HISTORY_EVALUATION, &[
            ("url", snapshot.url.as_str()),
            ("content", content.as_str()),
            ("min_months", min_months.as_str()),
        ]);

        let timer = self.metrics.start_timer();
        let result = bounded(self.timeout, self.text.complete(&prompt)).await;
        self.metrics.record_oracle_call("evaluator", &result, timer.end()).await;

        match result.and_then(|raw| parse_assessment(&raw, self.min_months)) {
            Ok(assessment) => {
                debug!(
                    "History on {}: {} month(s), {:?}, sufficient: {}",
                    snapshot.url, assessment.months_found, assessment.data_quality, assessment.sufficient
                );
                assessment
            }
            Err(e) => {
                warn!("History evaluation failed for {}: {}", snapshot.url, e);
                self.metrics.record_fallback("evaluator").await;
                HistoryAssessment::unknown(e.to_string())
            }
        }
    }
}

/// Read an assessment out of raw model output.
///
/// A page is only sufficient when the model says so and its month count
/// reaches `min_months`.
pub fn parse_assessment(raw: &str, min_months: u32) -> Result<HistoryAssessment, OracleError> {
    let value = extract_json(raw)?;
    let object = value
        .as_object()
        .ok_or_else(|| OracleError::Malformed("evaluation is not an object".to_string()))?;

    let claimed = field(object, &["has_sufficient_billing_data", "sufficient", "has_sufficient_data"])
        .and_then(as_bool)
        .ok_or_else(|| OracleError::Malformed("evaluation has no verdict".to_string()))?;
    let entries_found = field(object, &["billing_entries_found", "entries"])
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let months_found = field(object, &["months_of_data_found", "months_found", "months"])
        .and_then(as_int)
        .map_or(entries_found as i64, |m| m)
        .clamp(0, 120) as u32;

    Ok(HistoryAssessment {
        sufficient: claimed && months_found >= min_months,
        months_found,
        data_quality: field(object, &["data_quality", "quality"])
            .and_then(Value::as_str)
            .map_or(DataQuality::None, DataQuality::parse),
        entries_found,
        reason: field(object, &["evaluation_reason", "reason", "reasoning"])
            .and_then(Value::as_str)
            .map(str::to_string),
        degraded: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockTextOracle;

    const URL: &str = "https://portal.example.com/history";

    fn evaluator(oracle: MockTextOracle, metrics: MetricsCollector) -> HistoryEvaluator {
        HistoryEvaluator::new(Arc::new(oracle), Duration::from_secs(1), 4000, 4, metrics)
    }

    #[tokio::test]
    async fn test_sufficient_history() {
        let mut oracle = MockTextOracle::new();
        oracle.expect_complete()
            .withf(|prompt| prompt.contains("at least 4 different months") && prompt.contains("Jan 2025 $120.50"))
            .times(1)
            .returning(|_| Ok(r#"{"has_sufficient_billing_data": true, "months_of_data_found": 5, "data_quality": "detailed", "billing_entries_found": [{"date": "2025-01", "amount": "120.50"}], "evaluation_reason": "Five monthly bills listed"}"#.into()));

        let snapshot = PageSnapshot::new(1, URL, "<table><tr><td>Jan 2025 $120.50</td></tr></table>");
        let assessment = evaluator(oracle, MetricsCollector::new()).evaluate(&snapshot).await;

        assert!(assessment.sufficient);
        assert_eq!(assessment.months_found, 5);
        assert_eq!(assessment.data_quality, DataQuality::Detailed);
        assert_eq!(assessment.entries_found, 1);
        assert!(!assessment.degraded);
    }

    #[test]
    fn test_month_count_must_back_the_verdict() {
        let assessment = parse_assessment(
            r#"{"has_sufficient_billing_data": true, "months_of_data_found": 2, "data_quality": "partial"}"#,
            4,
        )
        .unwrap();
        assert!(!assessment.sufficient);
        assert_eq!(assessment.data_quality, DataQuality::Partial);

        let counted = parse_assessment(
            r#"{"sufficient": "yes", "billing_entries_found": [{}, {}, {}, {}]}"#,
            4,
        )
        .unwrap();
        assert!(counted.sufficient);
        assert_eq!(counted.months_found, 4);

        assert!(parse_assessment(r#"{"months_of_data_found": 6}"#, 4).is_err());
    }

    #[tokio::test]
    async fn test_outage_is_degraded_not_sufficient() {
        let mut oracle = MockTextOracle::new();
        oracle.expect_complete()
            .returning(|_| Err(OracleError::Unreachable("connection refused".into())));
        let metrics = MetricsCollector::new();

        let snapshot = PageSnapshot::new(1, URL, "<p>$10.00</p>");
        let assessment = evaluator(oracle, metrics.clone()).evaluate(&snapshot).await;

        assert!(assessment.degraded);
        assert!(!assessment.sufficient);
        assert_eq!(metrics.get_metrics().await.fallbacks.get("evaluator"), Some(&1));
    }
}
