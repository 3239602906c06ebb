//! Billing records read out of model answers.
//!
//! The vision and page-text strategies share one JSON contract, so they
//! share one parser.

use serde_json::{Map, Value};

use crate::cli::config::ExtractionSettings;
use crate::error::OracleError;
use crate::extraction::amount::amount_from_json;
use crate::extraction::dates::{date_from_json, DateWindow};
use crate::extraction::{date_window, BillingRecord, SourceStrategy, Transaction};
use crate::oracle::json::{as_int, extract_json, field, normalize_confidence};

/// Confidence assumed when the model does not report one
pub const DEFAULT_CONFIDENCE: u8 = 6;

/// Turn a model answer into a record, keeping only plausible values.
///
/// `Ok(None)` means the answer parsed but held no amount and no history.
pub fn parse_model_record(
    raw: &str,
    settings: &ExtractionSettings,
    source: SourceStrategy,
) -> Result<Option<BillingRecord>, OracleError> {
    let value = extract_json(raw)?;
    let object = value
        .as_object()
        .ok_or_else(|| OracleError::Malformed(format!("{} answer is not an object", source)))?;
    let window = date_window(settings);

    let money = |v: Option<&Value>| {
        v.and_then(amount_from_json)
            .map(|a| a.abs())
            .filter(|a| settings.amount_in_range(*a))
    };
    let text = |v: Option<&Value>| {
        v.and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() && s.trim() != "null" => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    let mut record = BillingRecord::empty(source);
    record.current_amount = money(field(object, &["current_amount", "amount_due", "current_bill"]));
    record.previous_amount = money(field(object, &["previous_amount", "previous_bill"]));
    record.current_period = text(field(object, &["current_period", "billing_period"]));
    record.previous_period = text(field(object, &["previous_period"]));
    record.due_date = field(object, &["due_date"]).and_then(date_from_json).filter(|d| window.contains(*d));
    record.account_number = text(field(object, &["account_number"]))
        .or_else(|| text(nested(object, "account_info", &["account_number", "number"])));

    let rows = field(object, &["transactions", "bills", "history"])
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect::<Vec<_>>())
        .unwrap_or_default();
    record.transactions = rows
        .into_iter()
        .filter_map(|row| transaction(row, &window, settings))
        .collect();
    record.tidy_transactions(settings.max_transactions);
    record.derive_from_transactions();

    if !record.is_found() {
        return Ok(None);
    }
    record.confidence = field(object, &["confidence"])
        .and_then(as_int)
        .map(normalize_confidence)
        .unwrap_or(DEFAULT_CONFIDENCE);
    Ok(Some(record))
}

fn transaction(row: &Map<String, Value>, window: &DateWindow, settings: &ExtractionSettings) -> Option<Transaction> {
    let date = field(row, &["date", "bill_date", "period_start"])
        .and_then(date_from_json)
        .filter(|d| window.contains(*d))?;
    let amount = field(row, &["amount", "bill_amount", "total"]).and_then(amount_from_json)?;
    if !settings.amount_in_range(amount.abs()) {
        return None;
    }
    let description = field(row, &["description", "type"])
        .and_then(Value::as_str)
        .unwrap_or("Bill")
        .to_string();
    Some(Transaction {
        kind: Transaction::detect_kind(&description, amount),
        balance: field(row, &["balance"]).and_then(amount_from_json),
        amount: amount.abs(),
        date,
        description,
    })
}

fn nested<'a>(object: &'a Map<String, Value>, key: &str, names: &[&str]) -> Option<&'a Value> {
    object.get(key).and_then(Value::as_object).and_then(|inner| field(inner, names))
}
