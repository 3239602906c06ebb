use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Fixed-precision money value stored as whole cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

static AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<sym>\$|USD)?\s*(?P<int>\d{1,3}(?:,\d{3})+|\d+)(?:\.(?P<frac>\d{1,2}))?$")
        .expect("amount pattern is valid")
});

/// Currency-looking substrings in free text: `$` amounts with optional cents,
/// or bare numbers carrying exactly two decimals.
static SCAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<neg>-\s?)?(?:(?P<sym>\$)\s?(?P<sint>\d{1,3}(?:,\d{3})+|\d+)(?:\.(?P<sfrac>\d{2}))?|\b(?P<bint>\d{1,3}(?:,\d{3})+|\d+)\.(?P<bfrac>\d{2})\b)",
    )
    .expect("scan pattern is valid")
});

static BARE_INT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*:?\s*(?P<int>\d{1,3}(?:,\d{3})+|\d{1,5})\b").expect("bare integer pattern is valid")
});

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Convert a JSON float, rounding to the nearest cent.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value.abs() > 1e13 {
            return None;
        }
        Some(Self((value * 100.0).round() as i64))
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Parse a money string such as `$1,234.56`, `1234.56`, `(12.00)` or `-$5`.
    pub fn parse(input: &str) -> Option<ParsedAmount> {
        let mut text = input.trim();
        let mut negative = false;

        if text.starts_with('(') && text.ends_with(')') && text.len() > 2 {
            negative = true;
            text = text[1..text.len() - 1].trim();
        }
        if let Some(rest) = text.strip_prefix('-') {
            negative = !negative;
            text = rest.trim_start();
        }
        // "$-12.00"
        let mut symbol_first = false;
        if let Some(rest) = text.strip_prefix('$') {
            if let Some(rest) = rest.trim_start().strip_prefix('-') {
                negative = !negative;
                text = rest.trim_start();
                symbol_first = true;
            }
        }
        let text = text.strip_suffix(" CR").unwrap_or(text);

        let caps = AMOUNT_RE.captures(text)?;
        let has_symbol = symbol_first || caps.name("sym").is_some();
        let whole: i64 = caps["int"].replace(',', "").parse().ok()?;
        let (cents, has_decimals) = match caps.name("frac") {
            Some(frac) if frac.as_str().len() == 1 => (frac.as_str().parse::<i64>().ok()? * 10, true),
            Some(frac) => (frac.as_str().parse::<i64>().ok()?, true),
            None => (0, false),
        };

        let total = whole.checked_mul(100)?.checked_add(cents)?;
        Some(ParsedAmount {
            amount: Amount(if negative { -total } else { total }),
            has_symbol,
            has_decimals,
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
            .map(|parsed| parsed.amount)
            .ok_or_else(|| format!("not a money amount: {}", s))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        amount_from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {}", value)))
    }
}

/// Read an amount out of a JSON value that may be a number or a money string.
pub fn amount_from_json(value: &serde_json::Value) -> Option<Amount> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().and_then(Amount::from_f64),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Result of parsing a money string, with the signals that decide how much
/// to trust it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedAmount {
    pub amount: Amount,
    pub has_symbol: bool,
    pub has_decimals: bool,
}

impl ParsedAmount {
    /// No currency symbol and no decimal point: could be any number.
    pub fn is_ambiguous(&self) -> bool {
        !self.has_symbol && !self.has_decimals
    }
}

/// A money value found in free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountMatch {
    pub start: usize,
    pub end: usize,
    pub raw: String,
    pub parsed: ParsedAmount,
}

/// Find every currency-looking substring in `text`, in order of appearance.
pub fn scan_amounts(text: &str) -> Vec<AmountMatch> {
    SCAN_RE
        .find_iter(text)
        .filter_map(|m| {
            let raw = m.as_str();
            Amount::parse(raw).map(|parsed| AmountMatch {
                start: m.start(),
                end: m.end(),
                raw: raw.to_string(),
                parsed,
            })
        })
        .collect()
}

/// A bare integer immediately after `offset` (e.g. `Amount Due: 142`).
pub fn bare_integer_after(text: &str, offset: usize) -> Option<AmountMatch> {
    let tail = text.get(offset..)?;
    let caps = BARE_INT_RE.captures(tail)?;
    let m = caps.name("int")?;
    // Dates and phone numbers continue with a separator.
    if matches!(tail[m.end()..].chars().next(), Some('/') | Some('-') | Some('.')) {
        return None;
    }
    let parsed = Amount::parse(m.as_str())?;
    Some(AmountMatch {
        start: offset + m.start(),
        end: offset + m.end(),
        raw: m.as_str().to_string(),
        parsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let a = Amount::parse("$1,234.56").unwrap();
        let b = Amount::parse("1234.56").unwrap();
        let c = Amount::parse("$1,234").unwrap();

        assert_eq!(a.amount, Amount::from_cents(123_456));
        assert_eq!(b.amount, Amount::from_cents(123_456));
        assert_eq!(c.amount, Amount::from_cents(123_400));
        assert_eq!(c.amount.to_string(), "1234.00");
        assert!(a.has_symbol && a.has_decimals);
        assert!(!b.has_symbol && b.has_decimals);
        assert!(c.has_symbol && !c.has_decimals);
    }

    #[test]
    fn test_ambiguous_and_negative() {
        assert!(Amount::parse("142").unwrap().is_ambiguous());
        assert!(!Amount::parse("$142").unwrap().is_ambiguous());
        assert_eq!(Amount::parse("(12.50)").unwrap().amount, Amount::from_cents(-1250));
        assert_eq!(Amount::parse("-$5").unwrap().amount, Amount::from_cents(-500));
        assert_eq!(Amount::parse("$-5.10").unwrap().amount, Amount::from_cents(-510));
        assert_eq!(Amount::parse("3.5").unwrap().amount, Amount::from_cents(350));
        assert!(Amount::parse("12/05/2024").is_none());
        assert!(Amount::parse("1,23").is_none());
    }

    #[test]
    fn test_scan_amounts() {
        let found = scan_amounts("Current Bill $142.30 Previous Bill $125.45 kWh 812 total 17.20");
        let values: Vec<i64> = found.iter().map(|m| m.parsed.amount.cents()).collect();
        assert_eq!(values, vec![14230, 12545, 1720]);
        assert!(found[2].parsed.has_decimals && !found[2].parsed.has_symbol);
    }

    #[test]
    fn test_bare_integer_after_label() {
        let text = "Amount Due: 142 Due 01/05/2025";
        let m = bare_integer_after(text, "Amount Due".len()).unwrap();
        assert_eq!(m.parsed.amount, Amount::from_cents(14200));
        assert!(bare_integer_after(text, "Amount Due: 142 Due".len()).is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let amount = Amount::from_cents(9999);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"99.99\"");
        let back: Amount = serde_json::from_str("99.99").unwrap();
        assert_eq!(back, amount);
        let back: Amount = serde_json::from_str("\"$99.99\"").unwrap();
        assert_eq!(back, amount);
    }
}
