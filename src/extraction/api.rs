use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::browser::PageSession;
use crate::cli::config::ExtractionSettings;
use crate::extraction::amount::{amount_from_json, Amount};
use crate::extraction::dates::{date_from_json, DateWindow};
use crate::extraction::{date_window, BillingRecord, ExtractionStrategy, SourceStrategy, Transaction};
use crate::page::{NetworkResponse, PageSnapshot};

/// Keys naming the amount currently owed, most specific first
const CURRENT_KEYS: &[&str] = &[
    "amountdue", "currentamountdue", "totalamountdue", "currentamount", "currentbill",
    "currentbillamount", "currentcharges", "billamount", "totaldue", "balancedue",
    "currentbalance", "totalamount", "balance", "amount", "due",
];
const PREVIOUS_KEYS: &[&str] = &[
    "previousamount", "previousbill", "previousbillamount", "lastbillamount", "previousbalance",
    "priorbalance", "lastamount",
];
const DUE_DATE_KEYS: &[&str] = &["duedate", "paymentduedate", "billduedate", "dueby"];
const ACCOUNT_KEYS: &[&str] = &["accountnumber", "accountno", "accountnum", "accountid", "account"];
const PERIOD_KEYS: &[&str] = &["billingperiod", "billperiod", "serviceperiod", "period"];

const ROW_DATE_KEYS: &[&str] = &[
    "date", "billdate", "transactiondate", "postdate", "postingdate", "statementdate", "duedate",
];
const ROW_AMOUNT_KEYS: &[&str] = &["amount", "billamount", "totalamount", "total", "charge", "charges", "amountdue"];
const ROW_DESCRIPTION_KEYS: &[&str] = &["description", "desc", "transactiontype", "type", "memo", "name"];
const ROW_BALANCE_KEYS: &[&str] = &["balance", "runningbalance", "newbalance"];

/// Reads billing-shaped JSON out of responses observed while the page loaded.
pub struct ApiStrategy {
    settings: ExtractionSettings,
}

impl ApiStrategy {
    pub fn new(settings: ExtractionSettings) -> Self {
        Self { settings }
    }

    fn parse_response(&self, response: &NetworkResponse, window: &DateWindow) -> Option<BillingRecord> {
        let value: Value = serde_json::from_str(response.body.trim()).ok()?;
        let mut scalars = Vec::new();
        let mut rows = Vec::new();
        flatten(&value, &mut scalars, &mut rows);

        let lookup = |keys: &[&str]| {
            keys.iter().find_map(|key| {
                let key = key.to_lowercase();
                scalars.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
            })
        };
        let money = |keys: &[&str]| {
            keys.iter().find_map(|key| {
                scalars
                    .iter()
                    .filter(|(k, _)| k == key)
                    .filter_map(|(_, v)| amount_from_json(v))
                    .map(|a| a.abs())
                    .find(|a| self.settings.amount_in_range(*a))
            })
        };

        let mut record = BillingRecord::empty(SourceStrategy::Api);
        record.current_amount = money(CURRENT_KEYS);
        record.previous_amount = money(PREVIOUS_KEYS);
        record.due_date = lookup(DUE_DATE_KEYS).and_then(date_from_json);
        record.account_number = lookup(ACCOUNT_KEYS).and_then(account_text);
        record.current_period = lookup(PERIOD_KEYS).and_then(Value::as_str).map(str::to_string);
        record.transactions = rows
            .into_iter()
            .filter_map(|row| self.transaction(row, window))
            .collect();
        record.tidy_transactions(self.settings.max_transactions);

        let labeled = record.current_amount.is_some();
        record.derive_from_transactions();
        if !record.is_found() {
            return None;
        }

        let supporting = [record.previous_amount.is_some(), record.due_date.is_some(), record.account_number.is_some()]
            .iter()
            .filter(|present| **present)
            .count();
        record.confidence = match (labeled, supporting) {
            (true, 0) => 8,
            (true, _) => 9,
            (false, _) => 7,
        };
        debug!(
            "Billing payload in {} (current {:?}, {} transactions)",
            response.url,
            record.current_amount.map(|a| a.to_string()),
            record.transactions.len()
        );
        Some(record)
    }

    fn transaction(&self, row: &Map<String, Value>, window: &DateWindow) -> Option<Transaction> {
        let get = |keys: &[&str]| {
            row.iter()
                .find(|(k, _)| keys.contains(&normalize_key(k).as_str()))
                .map(|(_, v)| v)
        };
        let date = get(ROW_DATE_KEYS).and_then(date_from_json).filter(|d| window.contains(*d))?;
        let amount = get(ROW_AMOUNT_KEYS).and_then(amount_from_json)?;
        if !self.settings.amount_in_range(amount.abs()) {
            return None;
        }
        let description = get(ROW_DESCRIPTION_KEYS)
            .and_then(Value::as_str)
            .unwrap_or("Bill")
            .to_string();
        Some(Transaction {
            kind: Transaction::detect_kind(&description, amount),
            balance: get(ROW_BALANCE_KEYS).and_then(amount_from_json),
            amount: amount.abs(),
            date,
            description,
        })
    }
}

#[async_trait]
impl ExtractionStrategy for ApiStrategy {
    fn source(&self) -> SourceStrategy {
        SourceStrategy::Api
    }

    async fn attempt(&self, snapshot: &PageSnapshot, _session: &dyn PageSession) -> Option<BillingRecord> {
        let window = date_window(&self.settings);
        let best = snapshot
            .network
            .iter()
            .filter(|response| response.looks_like_json() && response.status.map_or(true, |s| s < 400))
            .filter_map(|response| self.parse_response(response, &window))
            .max_by_key(|record| (record.confidence, record.transactions.len()));
        if best.is_none() && !snapshot.network.is_empty() {
            debug!("None of {} observed responses looked like billing data", snapshot.network.len());
        }
        best
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Depth-first walk collecting scalar fields (keys normalized) and the
/// objects of every array that looks like a list of dated amounts.
fn flatten<'a>(value: &'a Value, scalars: &mut Vec<(String, &'a Value)>, rows: &mut Vec<&'a Map<String, Value>>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match child {
                    Value::Object(_) | Value::Array(_) => flatten(child, scalars, rows),
                    _ => scalars.push((normalize_key(key), child)),
                }
            }
        }
        Value::Array(items) => {
            let objects: Vec<&Map<String, Value>> = items.iter().filter_map(Value::as_object).collect();
            let dated = objects.iter().filter(|row| {
                row.keys().any(|k| ROW_DATE_KEYS.contains(&normalize_key(k).as_str()))
                    && row.keys().any(|k| ROW_AMOUNT_KEYS.contains(&normalize_key(k).as_str()))
            });
            if objects.len() >= 2 && dated.count() == objects.len() {
                rows.extend(objects);
            } else {
                for item in items {
                    flatten(item, scalars, rows);
                }
            }
        }
        _ => {}
    }
}

fn account_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (text.chars().filter(char::is_ascii_digit).count() >= 4).then_some(text)
}
