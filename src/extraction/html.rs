use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::browser::PageSession;
use crate::cli::config::ExtractionSettings;
use crate::extraction::amount::{bare_integer_after, scan_amounts, Amount, ParsedAmount};
use crate::extraction::dates::{find_dates, DateWindow};
use crate::extraction::{date_window, BillingRecord, ExtractionStrategy, SourceStrategy, Transaction};
use crate::page::PageSnapshot;

/// Billing labels in visible text. Alternatives are tried left to right, so
/// longer phrases come before their prefixes.
static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        (?P<payment>last\s+payment(?:\s+amount)?|payment\s+received|amount\s+paid|last\s+paid)
        |(?P<previous>previous\s+(?:bill(?:\s+amount)?|balance|amount|statement|charges)|prior\s+balance|last\s+bill(?:\s+amount)?|last\s+statement)
        |(?P<period>billing\s+period|service\s+period|bill\s+period|billing\s+cycle)
        |(?P<due>(?:payment\s+)?due\s+date|due\s+by|due\s+on|pay\s+by)
        |(?P<current>current\s+(?:bill(?:\s+amount)?|charges|balance|amount(?:\s+due)?)|total\s+amount\s+due|amount\s+due|total\s+due|balance\s+due|new\s+charges|statement\s+balance|account\s+balance|bill\s+amount|total\s+balance)
        ",
    )
    .expect("label pattern is valid")
});

static ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:account|acct)\.?\s*(?:number|no\.?|num|#|id)?\s*[:#]?\s*(?P<number>\d[\d-]{2,24}\d)\b")
        .expect("account pattern is valid")
});

static URL_ACCOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/(?P<number>\d{2,}-\d{4,}-\d{2,}|\d{8,})(?:[/?#]|$)").expect("url account pattern is valid")
});

static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").expect("table selector is valid"));
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("row selector is valid"));
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("th, td").expect("cell selector is valid"));

/// Longest period label kept from free text
const MAX_PERIOD_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Current,
    Previous,
    Payment,
    Due,
    Period,
}

/// One label occurrence and the text that belongs to it.
struct LabeledSegment<'a> {
    label: Label,
    /// Text after the label up to the next label on the same line
    tail: &'a str,
    /// The following line, when the label ends its own line
    next_line: Option<&'a str>,
}

/// Column positions found in a table header
#[derive(Debug, Default)]
struct Columns {
    date: Option<usize>,
    description: Option<usize>,
    amount: Option<usize>,
    balance: Option<usize>,
}

/// Label-proximity heuristics over visible text plus transaction tables.
pub struct HtmlStrategy {
    settings: ExtractionSettings,
}

impl HtmlStrategy {
    pub fn new(settings: ExtractionSettings) -> Self {
        Self { settings }
    }

    /// Deterministic extraction from a snapshot; the async trait method
    /// delegates here.
    pub fn extract(&self, snapshot: &PageSnapshot) -> Option<BillingRecord> {
        let window = date_window(&self.settings);
        let segments = labeled_segments(&snapshot.text);

        let currents: Vec<ParsedAmount> = segments
            .iter()
            .filter(|s| s.label == Label::Current)
            .filter_map(|s| self.segment_amount(s))
            .collect();
        let previous = segments
            .iter()
            .filter(|s| s.label == Label::Previous)
            .find_map(|s| self.segment_amount(s));

        let mut record = BillingRecord::empty(SourceStrategy::Html);
        record.current_amount = currents.first().map(|p| p.amount);
        record.previous_amount = previous.map(|p| p.amount);
        record.due_date = segments
            .iter()
            .filter(|s| s.label == Label::Due)
            .find_map(|s| segment_date(s, &window));
        record.current_period = segments
            .iter()
            .filter(|s| s.label == Label::Period)
            .find_map(segment_period);
        record.account_number = account_from_text(&snapshot.text).or_else(|| account_from_url(&snapshot.url));
        record.transactions = self.table_transactions(&snapshot.html, &window);
        record.tidy_transactions(self.settings.max_transactions);

        let labeled = currents.first().copied();
        record.derive_from_transactions();
        if !record.is_found() {
            return None;
        }

        let mut confidence: i32 = if labeled.is_some() { 6 } else { 5 };
        if let Some(current) = labeled {
            if current.has_symbol {
                confidence += 1;
            }
            if current.is_ambiguous() {
                confidence -= 2;
            }
        }
        let mut distinct: Vec<Amount> = currents.iter().map(|p| p.amount).collect();
        distinct.sort();
        distinct.dedup();
        if distinct.len() > 1 {
            debug!("Conflicting current amounts on {}: {:?}", snapshot.url, distinct);
            confidence -= 2;
        }
        for present in [
            record.previous_amount.is_some(),
            record.due_date.is_some(),
            record.account_number.is_some(),
            record.transactions.len() >= 2,
        ] {
            if present {
                confidence += 1;
            }
        }
        record.confidence = confidence.clamp(1, 10) as u8;

        debug!(
            "HTML heuristics on {}: current {:?}, previous {:?}, {} transactions, confidence {}",
            snapshot.url,
            record.current_amount.map(|a| a.to_string()),
            record.previous_amount.map(|a| a.to_string()),
            record.transactions.len(),
            record.confidence
        );
        Some(record)
    }

    /// First in-range amount belonging to a label: a currency-looking value in
    /// its own text or the next line, else a bare integer right after it.
    fn segment_amount(&self, segment: &LabeledSegment) -> Option<ParsedAmount> {
        let in_range = |parsed: &ParsedAmount| self.settings.amount_in_range(parsed.amount.abs());
        let first_scanned = |text: &str| {
            scan_amounts(text)
                .into_iter()
                .map(|m| m.parsed)
                .find(|p| in_range(p))
        };

        first_scanned(segment.tail)
            .or_else(|| segment.next_line.and_then(first_scanned))
            .or_else(|| bare_integer_after(segment.tail, 0).map(|m| m.parsed).filter(|p| in_range(p)))
            .or_else(|| {
                segment
                    .next_line
                    .and_then(|line| bare_integer_after(line, 0))
                    .map(|m| m.parsed)
                    .filter(|p| in_range(p))
            })
            .map(|p| ParsedAmount { amount: p.amount.abs(), ..p })
    }

    fn table_transactions(&self, html: &str, window: &DateWindow) -> Vec<Transaction> {
        let document = Html::parse_document(html);
        let mut transactions = Vec::new();

        for table in document.select(&TABLE) {
            let rows: Vec<Vec<String>> = table
                .select(&ROW)
                .map(|row| row.select(&CELL).map(|cell| cell_text(&cell)).collect())
                .filter(|cells: &Vec<String>| !cells.is_empty())
                .collect();
            let Some((header_at, columns)) = rows
                .iter()
                .enumerate()
                .take(3)
                .find_map(|(i, cells)| header_columns(cells).map(|c| (i, c)))
            else {
                continue;
            };

            let parsed: Vec<Transaction> = rows
                .iter()
                .skip(header_at + 1)
                .filter_map(|cells| self.row_transaction(cells, &columns, window))
                .collect();
            if parsed.len() >= 2 {
                debug!("Parsed {} transaction rows from a table", parsed.len());
                transactions.extend(parsed);
            }
        }

        transactions
    }

    fn row_transaction(&self, cells: &[String], columns: &Columns, window: &DateWindow) -> Option<Transaction> {
        let date = columns
            .date
            .and_then(|i| cells.get(i))
            .and_then(|cell| find_dates(cell).first().map(|(_, _, d)| *d))
            .or_else(|| cells.iter().find_map(|cell| find_dates(cell).first().map(|(_, _, d)| *d)))
            .filter(|d| window.contains(*d))?;

        let money_in = |cell: &String| scan_amounts(cell).first().map(|m| m.parsed.amount);
        let amount = columns
            .amount
            .and_then(|i| cells.get(i))
            .and_then(money_in)
            .or_else(|| {
                cells
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| Some(*i) != columns.balance && Some(*i) != columns.date)
                    .find_map(|(_, cell)| money_in(cell))
            })?;
        if !self.settings.amount_in_range(amount.abs()) {
            return None;
        }

        let balance = columns.balance.and_then(|i| cells.get(i)).and_then(money_in);
        let description = columns
            .description
            .and_then(|i| cells.get(i))
            .cloned()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| {
                let rest: Vec<&str> = cells
                    .iter()
                    .filter(|cell| find_dates(cell).is_empty() && scan_amounts(cell).is_empty())
                    .map(String::as_str)
                    .collect();
                if rest.is_empty() { "Bill".to_string() } else { rest.join(" ") }
            });

        let row_text = cells.join(" ");
        Some(Transaction {
            kind: Transaction::detect_kind(&row_text, amount),
            date,
            description,
            amount: amount.abs(),
            balance,
        })
    }
}

#[async_trait]
impl ExtractionStrategy for HtmlStrategy {
    fn source(&self) -> SourceStrategy {
        SourceStrategy::Html
    }

    async fn attempt(&self, snapshot: &PageSnapshot, _session: &dyn PageSession) -> Option<BillingRecord> {
        self.extract(snapshot)
    }
}

/// Split visible text into label occurrences with the text each one owns.
fn labeled_segments(text: &str) -> Vec<LabeledSegment<'_>> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let mut segments = Vec::new();

    for (i, line) in lines.iter().copied().enumerate() {
        let found: Vec<(Label, usize, usize)> = LABEL_RE
            .captures_iter(line)
            .filter_map(|caps| {
                let (label, m) = [
                    (Label::Payment, "payment"),
                    (Label::Previous, "previous"),
                    (Label::Period, "period"),
                    (Label::Due, "due"),
                    (Label::Current, "current"),
                ]
                .into_iter()
                .find_map(|(label, name)| caps.name(name).map(|m| (label, m)))?;
                Some((label, m.start(), m.end()))
            })
            .collect();

        for (j, (label, _, end)) in found.iter().enumerate() {
            let stop = found.get(j + 1).map_or(line.len(), |(_, start, _)| *start);
            let is_last = j + 1 == found.len();
            // The next line belongs to this label only if it is not a label itself
            let next_line = lines
                .get(i + 1)
                .copied()
                .filter(|next| is_last && !LABEL_RE.is_match(next));
            segments.push(LabeledSegment {
                label: *label,
                tail: &line[*end..stop],
                next_line,
            });
        }
    }

    segments
}

fn segment_date(segment: &LabeledSegment, window: &DateWindow) -> Option<chrono::NaiveDate> {
    find_dates(segment.tail)
        .into_iter()
        .chain(segment.next_line.map(find_dates).unwrap_or_default())
        .map(|(_, _, date)| date)
        .find(|date| window.contains(*date))
}

fn segment_period(segment: &LabeledSegment) -> Option<String> {
    let clean = |text: &str| {
        let trimmed = text.trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace()).trim();
        (!trimmed.is_empty()).then(|| trimmed.chars().take(MAX_PERIOD_CHARS).collect::<String>())
    };
    clean(segment.tail).or_else(|| segment.next_line.and_then(clean))
}

/// Account number from a label such as `Account Number: 12-3456-78`.
pub fn account_from_text(text: &str) -> Option<String> {
    ACCOUNT_RE
        .captures_iter(text)
        .filter_map(|caps| caps.name("number").map(|m| m.as_str().to_string()))
        .find(|number| number.chars().filter(char::is_ascii_digit).count() >= 4)
}

/// Account number embedded in a portal URL path.
pub fn account_from_url(url: &str) -> Option<String> {
    URL_ACCOUNT_RE
        .captures(url)
        .and_then(|caps| caps.name("number"))
        .map(|m| m.as_str().to_string())
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Column positions when `cells` reads like a header row with at least a
/// date column and an amount column.
fn header_columns(cells: &[String]) -> Option<Columns> {
    let mut columns = Columns::default();
    for (i, cell) in cells.iter().enumerate() {
        let lower = cell.to_lowercase();
        if !find_dates(cell).is_empty() || !scan_amounts(cell).is_empty() {
            return None;
        }
        if lower.contains("balance") {
            columns.balance.get_or_insert(i);
        } else if lower.contains("date") {
            columns.date.get_or_insert(i);
        } else if ["amount", "charge", "total", "bill"].iter().any(|w| lower.contains(w)) {
            columns.amount.get_or_insert(i);
        } else if ["description", "type", "transaction", "detail", "memo"].iter().any(|w| lower.contains(w)) {
            columns.description.get_or_insert(i);
        }
    }
    (columns.date.is_some() && columns.amount.is_some()).then_some(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(html: &str) -> Option<BillingRecord> {
        HtmlStrategy::new(ExtractionSettings::default())
            .extract(&PageSnapshot::new(1, "https://portal.example.com/billing", html))
    }

    #[test]
    fn test_current_and_previous_labels() {
        let record = extract(
            "<div><span>Current Bill</span><span>$142.30</span></div>\
             <div><span>Previous Bill</span><span>$125.45</span></div>",
        )
        .unwrap();
        assert_eq!(record.current_amount, Some(Amount::from_cents(14230)));
        assert_eq!(record.previous_amount, Some(Amount::from_cents(12545)));
        assert_eq!(record.source_strategy, SourceStrategy::Html);
        assert!(record.confidence >= 5);
    }

    #[test]
    fn test_single_line_with_supporting_fields() {
        let record = extract(
            "<p>Account Number: 12-3456-78</p>\
             <p>Amount Due: $99.99 Due Date: 07/15/2025</p>\
             <p>Billing Period: Jun 1 - Jun 30, 2025</p>",
        )
        .unwrap();
        assert_eq!(record.current_amount, Some(Amount::from_cents(9999)));
        assert_eq!(record.due_date.map(|d| d.to_string()).as_deref(), Some("2025-07-15"));
        assert_eq!(record.account_number.as_deref(), Some("12-3456-78"));
        assert_eq!(record.current_period.as_deref(), Some("Jun 1 - Jun 30, 2025"));
        assert_eq!(record.confidence, 9);
    }

    #[test]
    fn test_ambiguous_and_conflicting_amounts_are_penalized() {
        let bare = extract("<p>Amount Due: 142</p>").unwrap();
        assert_eq!(bare.current_amount, Some(Amount::from_cents(14200)));
        assert_eq!(bare.confidence, 4);

        let conflicting = extract("<p>Amount Due $50.00</p><p>Current Balance $75.00</p>").unwrap();
        assert_eq!(conflicting.current_amount, Some(Amount::from_cents(5000)));
        assert_eq!(conflicting.confidence, 5);
    }

    #[test]
    fn test_payment_labels_are_not_bills() {
        assert!(extract("<p>Last Payment $80.00</p><p>Thank you!</p>").is_none());
    }

    #[test]
    fn test_history_table() {
        let record = extract(
            "<table>\
               <tr><th>Date</th><th>Description</th><th>Amount</th><th>Balance</th></tr>\
               <tr><td>06/01/2025</td><td>Water bill</td><td>$88.10</td><td>$88.10</td></tr>\
               <tr><td>05/20/2025</td><td>Payment received</td><td>-$80.00</td><td>$0.00</td></tr>\
               <tr><td>05/01/2025</td><td>Water bill</td><td>$80.00</td><td>$80.00</td></tr>\
             </table>",
        )
        .unwrap();
        assert_eq!(record.transactions.len(), 3);
        assert_eq!(record.transactions[1].description, "Payment received");
        assert_eq!(record.current_amount, Some(Amount::from_cents(8810)));
        assert_eq!(record.previous_amount, Some(Amount::from_cents(8000)));
        assert_eq!(record.current_period.as_deref(), Some("June 2025"));
        assert_eq!(record.confidence, 7);
    }

    #[test]
    fn test_account_from_url() {
        assert_eq!(account_from_url("https://portal.example.com/accounts/12-3456-78/bills").as_deref(), Some("12-3456-78"));
        assert_eq!(account_from_url("https://portal.example.com/a/123456789?x=1").as_deref(), Some("123456789"));
        assert_eq!(account_from_url("https://portal.example.com/bills/2025"), None);
    }

    #[test]
    fn test_no_billing_data() {
        assert!(extract("<h1>Welcome back</h1><p>Report an outage</p>").is_none());
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let html = "<p>Amount Due $61.00</p><p>Previous Balance $58.25</p>";
        assert_eq!(extract(html), extract(html));
    }
}
