use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::OracleError;
use crate::oracle::json::{as_bool, as_int, extract_json, field, normalize_confidence};
use crate::oracle::{bounded, TextOracle, VisionOracle};
use crate::page::snapshot::PageSnapshot;
use crate::page::text::excerpt_for_prompt;
use crate::prompts::{render, PAGE_CLASSIFICATION};
use crate::utils::MetricsCollector;

/// What a page is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    Login,
    Dashboard,
    Billing,
    Account,
    Other,
    Unknown,
}

/// What the model suggests doing with a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendedAction {
    Extract,
    Navigate,
    Stop,
}

/// Model judgment about one page.
///
/// `confidence` is 1..=10 for a parsed answer and 0 only for the fallback
/// produced when the model could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageClassification {
    pub page_type: PageType,
    pub has_billing_data: bool,
    pub confidence: u8,
    pub recommended_action: RecommendedAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl PageClassification {
    /// Conservative answer used whenever the model fails.
    pub fn fallback() -> Self {
        Self {
            page_type: PageType::Unknown,
            has_billing_data: false,
            confidence: 0,
            recommended_action: RecommendedAction::Navigate,
            reasoning: None,
        }
    }

    /// The classification came from the fallback, not the model.
    pub fn is_degraded(&self) -> bool {
        self.confidence == 0
    }
}

/// Labels pages using the text model, or the vision model on a screenshot
/// when the text model is unavailable.
pub struct PageClassifier {
    text: Arc<dyn TextOracle>,
    vision: Option<Arc<dyn VisionOracle>>,
    timeout: Duration,
    max_prompt_chars: usize,
    metrics: MetricsCollector,
}

impl PageClassifier {
    pub fn new(
        text: Arc<dyn TextOracle>,
        vision: Option<Arc<dyn VisionOracle>>,
        timeout: Duration,
        max_prompt_chars: usize,
        metrics: MetricsCollector,
    ) -> Self {
        Self { text, vision, timeout, max_prompt_chars, metrics }
    }

    /// Classify a page. Never fails: model errors yield
    /// [`PageClassification::fallback`].
    pub async fn classify(&self, snapshot: &PageSnapshot, current_url: &str) -> PageClassification {
        let prompt = self.build_prompt(snapshot, current_url);

        match self.ask_text(&prompt).await {
            Ok(classification) => return self.log(current_url, classification),
            Err(e) => warn!("Page classification failed for {}: {}", current_url, e),
        }

        if let (Some(vision), Some(png)) = (&self.vision, &snapshot.screenshot) {
            let timer = self.metrics.start_timer();
            let result = bounded(self.timeout, vision.complete_with_image(&prompt, png)).await;
            self.metrics.record_oracle_call("classifier_vision", &result, timer.end()).await;
            match result.and_then(|raw| parse_classification(&raw)) {
                Ok(classification) => return self.log(current_url, classification),
                Err(e) => warn!("Screenshot classification failed for {}: {}", current_url, e),
            }
        }

        self.metrics.record_fallback("classifier").await;
        PageClassification::fallback()
    }

    async fn ask_text(&self, prompt: &str) -> Result<PageClassification, OracleError> {
        let timer = self.metrics.start_timer();
        let result = bounded(self.timeout, self.text.complete(prompt)).await;
        self.metrics.record_oracle_call("classifier", &result, timer.end()).await;
        parse_classification(&result?)
    }

    fn build_prompt(&self, snapshot: &PageSnapshot, current_url: &str) -> String {
        let content = excerpt_for_prompt(&snapshot.text, self.max_prompt_chars);
        render(PAGE_CLASSIFICATION, &[
            ("url", current_url),
            ("title", snapshot.title.as_deref().unwrap_or("(none)")),
            ("content", content.as_str()),
        ])
    }

    fn log(&self, url: &str, classification: PageClassification) -> PageClassification {
        info!(
            "Classified {} as {:?} (billing data: {}, confidence {}, action {:?})",
            url,
            classification.page_type,
            classification.has_billing_data,
            classification.confidence,
            classification.recommended_action
        );
        if let Some(reasoning) = &classification.reasoning {
            debug!("Classifier reasoning: {}", reasoning);
        }
        classification
    }
}

/// Read a classification out of raw model output.
///
/// Unknown fields are ignored and missing ones defaulted; an answer with
/// none of the expected fields is malformed.
pub fn parse_classification(raw: &str) -> Result<PageClassification, OracleError> {
    let value = extract_json(raw)?;
    let object = match &value {
        Value::Object(map) => map,
        Value::Array(items) => items
            .iter()
            .find_map(Value::as_object)
            .ok_or_else(|| OracleError::Malformed("classification array holds no object".to_string()))?,
        _ => return Err(OracleError::Malformed("classification is not an object".to_string())),
    };

    let page_type_raw = field(object, &["page_type", "type", "pageType"]);
    let billing_raw = field(object, &["has_billing_data", "contains_billing_data", "has_billing", "hasBillingData"]);
    let confidence_raw = field(object, &["confidence", "score"]);
    let action_raw = field(object, &["recommended_action", "action", "recommendedAction"]);

    if page_type_raw.is_none() && billing_raw.is_none() && confidence_raw.is_none() && action_raw.is_none() {
        return Err(OracleError::Malformed("classification has none of the expected fields".to_string()));
    }

    let page_type = page_type_raw
        .and_then(Value::as_str)
        .map(parse_page_type)
        .unwrap_or(PageType::Unknown);
    let has_billing_data = billing_raw.and_then(as_bool).unwrap_or(false);
    let confidence = confidence_raw.and_then(as_int).map(normalize_confidence).unwrap_or(5);
    let recommended_action = action_raw
        .and_then(Value::as_str)
        .and_then(parse_action)
        .unwrap_or(if has_billing_data {
            RecommendedAction::Extract
        } else {
            RecommendedAction::Navigate
        });
    let reasoning = field(object, &["reasoning", "reason"])
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(PageClassification {
        page_type,
        has_billing_data,
        confidence,
        recommended_action,
        reasoning,
    })
}

fn parse_page_type(raw: &str) -> PageType {
    match raw.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
        "login" | "signin" | "sign_in" => PageType::Login,
        "dashboard" | "home" | "overview" | "summary" => PageType::Dashboard,
        "billing" | "bill" | "bills" | "statement" | "statements" | "billing_history"
        | "transactions" | "transaction_history" | "payment_history" => PageType::Billing,
        "account" | "account_details" | "profile" => PageType::Account,
        "other" => PageType::Other,
        _ => PageType::Unknown,
    }
}

fn parse_action(raw: &str) -> Option<RecommendedAction> {
    match raw.trim().to_lowercase().as_str() {
        "extract" | "extract_data" | "scrape" => Some(RecommendedAction::Extract),
        "navigate" | "explore" | "continue" => Some(RecommendedAction::Navigate),
        "stop" | "done" => Some(RecommendedAction::Stop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{MockTextOracle, MockVisionOracle};
    use async_trait::async_trait;

    struct SlowOracle;

    #[async_trait]
    impl TextOracle for SlowOracle {
        async fn complete(&self, _prompt: &str) -> Result<String, OracleError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(r#"{"page_type": "billing", "confidence": 9}"#.to_string())
        }
    }

    fn snapshot() -> PageSnapshot {
        PageSnapshot::new(1, "https://portal.example.com/home", "<h1>Welcome</h1><p>Amount due $42.00</p>")
    }

    fn classifier(text: Arc<dyn TextOracle>, vision: Option<Arc<dyn VisionOracle>>) -> PageClassifier {
        PageClassifier::new(text, vision, Duration::from_millis(50), 2000, MetricsCollector::new())
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let result = classifier(Arc::new(SlowOracle), None)
            .classify(&snapshot(), "https://portal.example.com/home")
            .await;
        assert_eq!(result, PageClassification::fallback());
        assert!(result.is_degraded());
    }

    #[tokio::test]
    async fn test_unreachable_and_malformed_fall_back() {
        let mut down = MockTextOracle::new();
        down.expect_complete()
            .returning(|_| Err(OracleError::Unreachable("connection refused".into())));
        let result = classifier(Arc::new(down), None).classify(&snapshot(), "u").await;
        assert_eq!(result.confidence, 0);

        let mut chatty = MockTextOracle::new();
        chatty.expect_complete()
            .returning(|_| Ok("This looks like a dashboard page to me.".into()));
        let result = classifier(Arc::new(chatty), None).classify(&snapshot(), "u").await;
        assert_eq!(result, PageClassification::fallback());
    }

    #[tokio::test]
    async fn test_prompt_carries_page_content() {
        let mut oracle = MockTextOracle::new();
        oracle.expect_complete()
            .withf(|prompt| prompt.contains("Amount due $42.00") && prompt.contains("https://portal.example.com/home"))
            .times(1)
            .returning(|_| Ok(r#"{"page_type": "dashboard", "has_billing_data": true, "confidence": 7, "recommended_action": "extract"}"#.into()));

        let result = classifier(Arc::new(oracle), None)
            .classify(&snapshot(), "https://portal.example.com/home")
            .await;
        assert_eq!(result.page_type, PageType::Dashboard);
        assert!(result.has_billing_data);
        assert_eq!(result.confidence, 7);
        assert_eq!(result.recommended_action, RecommendedAction::Extract);
    }

    #[tokio::test]
    async fn test_vision_used_when_text_model_down() {
        let mut text = MockTextOracle::new();
        text.expect_complete()
            .returning(|_| Err(OracleError::Timeout(Duration::from_secs(1))));
        let mut vision = MockVisionOracle::new();
        vision.expect_complete_with_image()
            .times(1)
            .returning(|_, _| Ok(r#"{"page_type": "billing", "has_billing_data": true, "confidence": 6}"#.into()));

        let shot = snapshot().with_screenshot(vec![1, 2, 3]);
        let result = classifier(Arc::new(text), Some(Arc::new(vision))).classify(&shot, "u").await;
        assert_eq!(result.page_type, PageType::Billing);
        assert_eq!(result.confidence, 6);
    }

    #[test]
    fn test_parse_defaults_and_clamps() {
        let parsed = parse_classification("```json\n{\"page_type\": \"Billing History\", \"confidence\": 95, \"extra\": 1}\n```").unwrap();
        assert_eq!(parsed.page_type, PageType::Billing);
        assert!(!parsed.has_billing_data);
        assert_eq!(parsed.confidence, 10);
        assert_eq!(parsed.recommended_action, RecommendedAction::Navigate);

        let parsed = parse_classification(r#"{"has_billing_data": "yes", "confidence": 0}"#).unwrap();
        assert_eq!(parsed.page_type, PageType::Unknown);
        assert_eq!(parsed.confidence, 1);
        assert_eq!(parsed.recommended_action, RecommendedAction::Extract);

        let parsed = parse_classification(r#"{"page_type": "spaceship", "recommended_action": "fly"}"#).unwrap();
        assert_eq!(parsed.page_type, PageType::Unknown);
        assert_eq!(parsed.confidence, 5);
        assert_eq!(parsed.recommended_action, RecommendedAction::Navigate);

        assert!(parse_classification(r#"{"foo": "bar"}"#).is_err());
        assert!(parse_classification("42").is_err());
    }
}
