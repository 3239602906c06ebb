use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

const MONTHS: &str = r"(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)[a-z]*\.?";

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    let patterns = [
        r"\b\d{4}-\d{1,2}-\d{1,2}\b".to_string(),
        r"\b\d{1,2}/\d{1,2}/\d{2,4}\b".to_string(),
        r"\b\d{1,2}-\d{1,2}-\d{4}\b".to_string(),
        format!(r"\b{}\s+\d{{1,2}},?\s+\d{{4}}\b", MONTHS),
        format!(r"\b\d{{1,2}}\s+{}\s+\d{{4}}\b", MONTHS),
        format!(r"\b{}-\d{{1,2}}-\d{{4}}\b", MONTHS),
    ];
    Regex::new(&format!("(?i){}", patterns.join("|"))).expect("date pattern is valid")
});

const FORMATS: &[&str] = &[
    "%m/%d/%Y",
    "%Y-%m-%d",
    "%m-%d-%Y",
    "%b %d, %Y",
    "%b %d %Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b-%d-%Y",
];

/// Accepted range of billing dates around a reference day.
#[derive(Debug, Clone, Copy)]
pub struct DateWindow {
    pub today: NaiveDate,
    pub years_back: i32,
    pub years_forward: i32,
}

impl DateWindow {
    pub fn new(today: NaiveDate, years_back: i32, years_forward: i32) -> Self {
        Self { today, years_back, years_forward }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        let year = date.year();
        year >= self.today.year() - self.years_back && year <= self.today.year() + self.years_forward
    }
}

/// Parse a date in any of the formats billing portals commonly use.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let cleaned = input.trim().replace('.', "").replace("Sept", "Sep");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    for format in FORMATS {
        match NaiveDate::parse_from_str(&cleaned, format) {
            // %Y happily reads "24" as year 24
            Ok(date) if date.year() >= 100 => return Some(date),
            _ => {}
        }
    }

    // Two-digit years: 01/15/24
    NaiveDate::parse_from_str(&cleaned, "%m/%d/%y").ok()
}

/// Every parseable date in `text` with its byte span, in order.
pub fn find_dates(text: &str) -> Vec<(usize, usize, NaiveDate)> {
    DATE_RE
        .find_iter(text)
        .filter_map(|m| parse_date(m.as_str()).map(|d| (m.start(), m.end(), d)))
        .collect()
}

/// Read a date from a JSON string, accepting ISO timestamps as well.
pub fn date_from_json(value: &serde_json::Value) -> Option<NaiveDate> {
    let text = value.as_str()?;
    parse_date(text).or_else(|| {
        let head = text.get(..10)?;
        NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
    })
}

/// Human label for the billing period a date falls into.
pub fn period_label(date: NaiveDate) -> String {
    date.format("%B %Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!(parse_date("01/15/2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_date("2024-01-15"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_date("01-15-2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_date("Jan 15, 2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_date("January 15, 2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_date("15 Jan 2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_date("Jan-15-2024"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_date("01/15/24"), Some(ymd(2024, 1, 15)));
        assert_eq!(parse_date("Sept. 3, 2023"), Some(ymd(2023, 9, 3)));
        assert_eq!(parse_date("not a date"), None);
    }

    #[test]
    fn test_find_dates_in_text() {
        let found = find_dates("Due Date: 02/01/2025. Statement issued Jan 10, 2025");
        let dates: Vec<NaiveDate> = found.into_iter().map(|(_, _, d)| d).collect();
        assert_eq!(dates, vec![ymd(2025, 2, 1), ymd(2025, 1, 10)]);
    }

    #[test]
    fn test_window() {
        let window = DateWindow::new(ymd(2025, 6, 1), 15, 2);
        assert!(window.contains(ymd(2011, 1, 1)));
        assert!(window.contains(ymd(2027, 12, 31)));
        assert!(!window.contains(ymd(2009, 12, 31)));
        assert!(!window.contains(ymd(2028, 1, 1)));
    }

    #[test]
    fn test_iso_timestamp_from_json() {
        let value = serde_json::json!("2024-03-05T00:00:00Z");
        assert_eq!(date_from_json(&value), Some(ymd(2024, 3, 5)));
        assert_eq!(period_label(ymd(2024, 3, 5)), "March 2024");
    }
}
