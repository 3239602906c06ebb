use serde_json::{Map, Value};

use crate::error::OracleError;

/// Pull a JSON value out of free-form model output.
///
/// Models wrap JSON in prose or markdown fences often enough that a plain
/// parse is only the first attempt: after that the outermost `{...}` span is
/// tried, then the outermost `[...]` span.
pub fn extract_json(raw: &str) -> Result<Value, OracleError> {
    let text = strip_fences(raw.trim());

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    let preview: String = raw.chars().take(120).collect();
    Err(OracleError::Malformed(format!("no JSON object in response: {:?}", preview)))
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line
    let rest = rest.split_once('\n').map_or(rest, |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// First key among `names` present in `object`.
pub fn field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| object.get(*name))
}

/// Integer field tolerant of `"7"`, `7.0` and `7`.
pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    }
}

/// Boolean field tolerant of `"true"`, `"yes"` and `1`.
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Map a model-reported confidence onto 1..=10.
///
/// Values above 10 are read as percentages.
pub fn normalize_confidence(raw: i64) -> u8 {
    let scaled = if raw > 10 { (raw.min(100) + 5) / 10 } else { raw };
    scaled.clamp(1, 10) as u8
}
