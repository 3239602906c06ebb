pub mod amount;
pub mod api;
pub mod dates;
pub mod evaluator;
pub mod html;
pub mod html_model;
pub mod model;
pub mod regex_fallback;
pub mod vision;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

use crate::browser::PageSession;
use crate::cli::config::ExtractionSettings;
use crate::page::PageSnapshot;
use crate::utils::MetricsCollector;

// Re-export common types
pub use amount::Amount;
pub use api::ApiStrategy;
pub use dates::DateWindow;
pub use evaluator::{DataQuality, HistoryAssessment, HistoryEvaluator};
pub use html::HtmlStrategy;
pub use html_model::HtmlModelStrategy;
pub use regex_fallback::RegexFallback;
pub use vision::VisionStrategy;

/// Which strategy produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStrategy {
    Api,
    Html,
    Vision,
    RegexFallback,
}

impl fmt::Display for SourceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceStrategy::Api => "api",
            SourceStrategy::Html => "html",
            SourceStrategy::Vision => "vision",
            SourceStrategy::RegexFallback => "regex_fallback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Charge,
    Payment,
}

/// One row of a billing or payment history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub date: NaiveDate,
    pub description: String,
    pub amount: Amount,
    pub balance: Option<Amount>,
    pub kind: TransactionKind,
}

impl Transaction {
    /// Payment or credit rows, judged by wording and sign.
    pub fn detect_kind(description: &str, amount: Amount) -> TransactionKind {
        let lower = description.to_lowercase();
        let payment_words = ["payment", "paid", "credit", "refund", "thank you"];
        if amount.is_negative() || payment_words.iter().any(|w| lower.contains(w)) {
            TransactionKind::Payment
        } else {
            TransactionKind::Charge
        }
    }
}

/// Billing data pulled out of one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub current_amount: Option<Amount>,
    pub previous_amount: Option<Amount>,
    pub current_period: Option<String>,
    pub previous_period: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub account_number: Option<String>,
    pub transactions: Vec<Transaction>,
    /// 1..=10
    pub confidence: u8,
    pub source_strategy: SourceStrategy,
}

impl BillingRecord {
    pub fn empty(source_strategy: SourceStrategy) -> Self {
        Self {
            current_amount: None,
            previous_amount: None,
            current_period: None,
            previous_period: None,
            due_date: None,
            account_number: None,
            transactions: Vec::new(),
            confidence: 1,
            source_strategy,
        }
    }

    /// A record counts only with a current amount or at least one transaction.
    pub fn is_found(&self) -> bool {
        self.current_amount.is_some() || !self.transactions.is_empty()
    }

    /// Distinct calendar months with at least one charge.
    pub fn months_covered(&self) -> usize {
        self.transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::Charge)
            .map(|t| (t.date.year(), t.date.month()))
            .collect::<HashSet<_>>()
            .len()
    }

    /// Keep `max` transactions, newest first, dropping exact duplicates.
    pub fn tidy_transactions(&mut self, max: usize) {
        let mut seen = HashSet::new();
        self.transactions
            .retain(|t| seen.insert((t.date, t.amount, t.description.to_lowercase())));
        self.transactions.sort_by(|a, b| b.date.cmp(&a.date));
        self.transactions.truncate(max);
    }

    /// Fill missing current/previous amounts and periods from the latest
    /// charge of each month.
    pub fn derive_from_transactions(&mut self) {
        let mut months: Vec<(i32, u32, &Transaction)> = Vec::new();
        let mut charges: Vec<&Transaction> = self
            .transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::Charge)
            .collect();
        charges.sort_by(|a, b| b.date.cmp(&a.date));
        for charge in charges {
            let month = (charge.date.year(), charge.date.month());
            if !months.iter().any(|(y, m, _)| (*y, *m) == month) {
                months.push((month.0, month.1, charge));
            }
        }

        let latest = months.first().map(|(_, _, t)| (t.amount.abs(), t.date));
        let prior = months.get(1).map(|(_, _, t)| (t.amount.abs(), t.date));

        if self.current_amount.is_none() {
            if let Some((amount, date)) = latest {
                self.current_amount = Some(amount);
                self.current_period.get_or_insert_with(|| dates::period_label(date));
            }
            if self.previous_amount.is_none() {
                if let Some((amount, date)) = prior {
                    self.previous_amount = Some(amount);
                    self.previous_period.get_or_insert_with(|| dates::period_label(date));
                }
            }
        }
    }
}

/// One way of getting a [`BillingRecord`] out of a page.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn source(&self) -> SourceStrategy;

    /// A record, or `None` when the strategy found nothing usable.
    async fn attempt(&self, snapshot: &PageSnapshot, session: &dyn PageSession) -> Option<BillingRecord>;
}

/// Accepted range of transaction dates for today's run.
pub fn date_window(settings: &ExtractionSettings) -> DateWindow {
    DateWindow::new(Utc::now().date_naive(), settings.max_years_back, settings.max_years_forward)
}

/// Ordered strategies tried until one is confident enough, with the regex
/// fallback behind them.
pub struct ExtractionChain {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
    fallback: RegexFallback,
    min_confidence: u8,
    metrics: MetricsCollector,
}

impl ExtractionChain {
    pub fn new(
        strategies: Vec<Box<dyn ExtractionStrategy>>,
        fallback: RegexFallback,
        min_confidence: u8,
        metrics: MetricsCollector,
    ) -> Self {
        Self { strategies, fallback, min_confidence, metrics }
    }

    pub fn strategy_names(&self) -> Vec<SourceStrategy> {
        self.strategies
            .iter()
            .map(|s| s.source())
            .chain(std::iter::once(self.fallback.source()))
            .collect()
    }

    /// Run the chain on one page.
    ///
    /// The first found record at or above the minimum confidence wins. If
    /// strategies only found weaker records the strongest of those is
    /// returned; the regex fallback runs only when nothing was found at all.
    pub async fn extract(&self, snapshot: &PageSnapshot, session: &dyn PageSession) -> Option<BillingRecord> {
        let mut weak: Option<BillingRecord> = None;

        for strategy in &self.strategies {
            let Some(record) = strategy.attempt(snapshot, session).await else {
                debug!("Strategy {} found nothing on {}", strategy.source(), snapshot.url);
                continue;
            };
            if !record.is_found() {
                debug!("Strategy {} returned an empty record", strategy.source());
                continue;
            }
            if record.confidence >= self.min_confidence {
                info!(
                    "Strategy {} extracted billing data from {} (confidence {})",
                    record.source_strategy, snapshot.url, record.confidence
                );
                self.metrics.record_strategy(&record.source_strategy.to_string()).await;
                return Some(record);
            }
            debug!(
                "Strategy {} confidence {} is below {}",
                record.source_strategy, record.confidence, self.min_confidence
            );
            if weak.as_ref().map_or(true, |w| record.confidence > w.confidence) {
                weak = Some(record);
            }
        }

        if let Some(record) = weak {
            info!(
                "Keeping low-confidence {} result from {} (confidence {})",
                record.source_strategy, snapshot.url, record.confidence
            );
            self.metrics.record_strategy(&record.source_strategy.to_string()).await;
            return Some(record);
        }

        let record = self.fallback.attempt(snapshot, session).await?;
        info!(
            "Regex fallback found an amount on {} (confidence {})",
            snapshot.url, record.confidence
        );
        self.metrics.record_fallback("extraction").await;
        self.metrics.record_strategy(&record.source_strategy.to_string()).await;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::StaticSite;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        source: SourceStrategy,
        record: Option<BillingRecord>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExtractionStrategy for Fixed {
        fn source(&self) -> SourceStrategy {
            self.source
        }

        async fn attempt(&self, _snapshot: &PageSnapshot, _session: &dyn PageSession) -> Option<BillingRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.record.clone()
        }
    }

    fn record(source: SourceStrategy, cents: i64, confidence: u8) -> BillingRecord {
        BillingRecord {
            current_amount: Some(Amount::from_cents(cents)),
            confidence,
            ..BillingRecord::empty(source)
        }
    }

    fn fixed(source: SourceStrategy, record: Option<BillingRecord>) -> (Box<dyn ExtractionStrategy>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy: Box<dyn ExtractionStrategy> = Box::new(Fixed { source, record, calls: calls.clone() });
        (strategy, calls)
    }

    fn chain(strategies: Vec<Box<dyn ExtractionStrategy>>) -> ExtractionChain {
        ExtractionChain::new(strategies, RegexFallback::new(ExtractionSettings::default()), 5, MetricsCollector::new())
    }

    fn page(html: &str) -> (PageSnapshot, StaticSite) {
        let url = "https://portal.example.com/bills";
        (PageSnapshot::new(1, url, html), StaticSite::new(url).page(url, html))
    }

    #[tokio::test]
    async fn test_first_confident_strategy_short_circuits() {
        let (api, api_calls) = fixed(SourceStrategy::Api, None);
        let (html, _) = fixed(SourceStrategy::Html, Some(record(SourceStrategy::Html, 14230, 7)));
        let (vision, vision_calls) = fixed(SourceStrategy::Vision, Some(record(SourceStrategy::Vision, 1, 9)));
        let (snapshot, site) = page("<p>$142.30</p>");

        let result = chain(vec![api, html, vision]).extract(&snapshot, &site).await.unwrap();
        assert_eq!(result.source_strategy, SourceStrategy::Html);
        assert_eq!(api_calls.load(Ordering::SeqCst), 1);
        assert_eq!(vision_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_weak_results_beat_regex_fallback() {
        let (html, _) = fixed(SourceStrategy::Html, Some(record(SourceStrategy::Html, 500, 3)));
        let (vision, _) = fixed(SourceStrategy::Vision, Some(record(SourceStrategy::Vision, 600, 4)));
        let (snapshot, site) = page("<p>Total $99.00</p>");

        let result = chain(vec![html, vision]).extract(&snapshot, &site).await.unwrap();
        assert_eq!(result.source_strategy, SourceStrategy::Vision);
        assert_eq!(result.confidence, 4);
    }

    #[tokio::test]
    async fn test_fallback_when_all_strategies_fail() {
        let (api, _) = fixed(SourceStrategy::Api, None);
        let (html, _) = fixed(SourceStrategy::Html, Some(BillingRecord::empty(SourceStrategy::Html)));
        let (snapshot, site) = page("<p>Questions? Call us. Fee: $12.50</p>");

        let metrics = MetricsCollector::new();
        let chain = ExtractionChain::new(vec![api, html], RegexFallback::new(ExtractionSettings::default()), 5, metrics.clone());
        let result = chain.extract(&snapshot, &site).await.unwrap();
        assert_eq!(result.source_strategy, SourceStrategy::RegexFallback);
        assert!(result.confidence <= 3);
        assert_eq!(metrics.get_metrics().await.fallbacks.get("extraction"), Some(&1));

        let (nothing, _) = page("<p>No money here</p>");
        assert!(chain.extract(&nothing, &site).await.is_none());
    }

    #[tokio::test]
    async fn test_chain_is_idempotent_on_identical_pages() {
        let settings = ExtractionSettings::default();
        let chain = chain(vec![
            Box::new(ApiStrategy::new(settings.clone())),
            Box::new(HtmlStrategy::new(settings)),
        ]);
        let (snapshot, site) = page("<p>Current Bill</p><p>$142.30</p><p>Previous Bill</p><p>$125.45</p>");

        let first = chain.extract(&snapshot, &site).await.unwrap();
        let second = chain.extract(&snapshot, &site).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.source_strategy, SourceStrategy::Html);
        assert_eq!(first.current_amount, Some(Amount::from_cents(14230)));
        assert_eq!(first.previous_amount, Some(Amount::from_cents(12545)));
    }

    #[test]
    fn test_derive_latest_per_month() {
        let day = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        let tx = |date, cents, desc: &str| Transaction {
            date,
            description: desc.to_string(),
            amount: Amount::from_cents(cents),
            balance: None,
            kind: Transaction::detect_kind(desc, Amount::from_cents(cents)),
        };
        let mut record = BillingRecord {
            transactions: vec![
                tx(day(2025, 5, 2), 9000, "Bill"),
                tx(day(2025, 6, 20), -9000, "Payment - thank you"),
                tx(day(2025, 6, 1), 11000, "Bill"),
                tx(day(2025, 6, 15), 12000, "Bill"),
                tx(day(2025, 6, 1), 11000, "bill"),
            ],
            ..BillingRecord::empty(SourceStrategy::Html)
        };
        record.tidy_transactions(10);
        assert_eq!(record.transactions.len(), 4);
        assert_eq!(record.transactions[0].date, day(2025, 6, 20));

        record.derive_from_transactions();
        assert_eq!(record.current_amount, Some(Amount::from_cents(12000)));
        assert_eq!(record.current_period.as_deref(), Some("June 2025"));
        assert_eq!(record.previous_amount, Some(Amount::from_cents(9000)));
        assert_eq!(record.previous_period.as_deref(), Some("May 2025"));

        // Payments do not count as a month of bills
        assert_eq!(record.months_covered(), 2);
    }
}
