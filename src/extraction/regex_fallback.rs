use async_trait::async_trait;
use tracing::debug;

use crate::browser::PageSession;
use crate::cli::config::ExtractionSettings;
use crate::extraction::amount::scan_amounts;
use crate::extraction::{BillingRecord, ExtractionStrategy, SourceStrategy};
use crate::page::PageSnapshot;

/// Last resort: the largest plausible currency-looking value on the page.
///
/// Any page with a `$` amount yields a record, always at low confidence.
pub struct RegexFallback {
    settings: ExtractionSettings,
}

impl RegexFallback {
    pub fn new(settings: ExtractionSettings) -> Self {
        Self { settings }
    }

    pub fn extract(&self, snapshot: &PageSnapshot) -> Option<BillingRecord> {
        let matches = scan_amounts(&snapshot.text);
        let cap = self.settings.fallback_confidence_cap.clamp(1, 3);

        let symbol_in_range = matches
            .iter()
            .filter(|m| m.parsed.has_symbol && self.settings.amount_in_range(m.parsed.amount.abs()))
            .map(|m| m.parsed.amount.abs())
            .max();
        let bare_in_range = matches
            .iter()
            .filter(|m| !m.parsed.has_symbol && self.settings.amount_in_range(m.parsed.amount.abs()))
            .map(|m| m.parsed.amount.abs())
            .max();
        let any_symbol = matches
            .iter()
            .filter(|m| m.parsed.has_symbol && !m.parsed.amount.is_negative())
            .map(|m| m.parsed.amount)
            .max()
            .or_else(|| matches.iter().find(|m| m.parsed.has_symbol).map(|m| m.parsed.amount.abs()));

        let (amount, confidence) = match (symbol_in_range, bare_in_range, any_symbol) {
            (Some(amount), _, _) => (amount, cap),
            (None, Some(amount), _) => (amount, cap.min(2)),
            (None, None, Some(amount)) => (amount, 1),
            (None, None, None) => return None,
        };

        debug!("Regex fallback picked {} on {} (confidence {})", amount, snapshot.url, confidence);
        Some(BillingRecord {
            current_amount: Some(amount),
            confidence,
            ..BillingRecord::empty(SourceStrategy::RegexFallback)
        })
    }
}

#[async_trait]
impl ExtractionStrategy for RegexFallback {
    fn source(&self) -> SourceStrategy {
        SourceStrategy::RegexFallback
    }

    async fn attempt(&self, snapshot: &PageSnapshot, _session: &dyn PageSession) -> Option<BillingRecord> {
        self.extract(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::Amount;

    fn run(html: &str) -> Option<BillingRecord> {
        RegexFallback::new(ExtractionSettings::default())
            .extract(&PageSnapshot::new(1, "https://portal.example.com/", html))
    }

    #[test]
    fn test_prefers_largest_symbol_amount_in_range() {
        let record = run("<p>Late fee $5.00</p><p>Total $87.20</p><p>Budget $12,000.00</p>").unwrap();
        assert_eq!(record.current_amount, Some(Amount::from_cents(8720)));
        assert_eq!(record.confidence, 3);
        assert_eq!(record.source_strategy, SourceStrategy::RegexFallback);
    }

    #[test]
    fn test_bare_decimals_rank_lower() {
        let record = run("<p>Usage 412.50 kWh charged</p>").unwrap();
        assert_eq!(record.current_amount, Some(Amount::from_cents(41250)));
        assert_eq!(record.confidence, 2);
    }

    #[test]
    fn test_dollar_amount_always_yields_a_record() {
        let record = run("<p>Round-up donation $0.50</p>").unwrap();
        assert_eq!(record.current_amount, Some(Amount::from_cents(50)));
        assert_eq!(record.confidence, 1);

        assert!(run("<p>Call 555-1234 for help</p>").is_none());
    }
}
