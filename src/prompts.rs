//! Prompt templates sent to the text and vision models.
//!
//! Each template states the exact JSON shape its caller parses; the parsers
//! in `page` and `extraction` accept looser variants, but the templates are
//! the contract.

/// Named prompt template
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub template: &'static str,
}

pub const PAGE_CLASSIFICATION: &str = r#"You are analyzing one page of a utility provider's customer portal. The user is already logged in.

URL: {url}
TITLE: {title}

PAGE CONTENT (scripts and styles removed, may be truncated):
{content}

Decide what kind of page this is and whether it shows billing data: amounts owed or paid, bill dates, due dates, statements or transaction history.

page_type must be one of: login, dashboard, billing, account, other.
recommended_action must be one of:
- "extract" when billing amounts are visible on this page,
- "navigate" when billing data is probably one or two clicks away,
- "stop" when this page cannot lead to billing data.
confidence is an integer from 1 (guess) to 10 (certain).

Return ONLY this JSON, no explanation:
{"page_type": "billing", "has_billing_data": true, "confidence": 8, "recommended_action": "extract", "reasoning": "one short sentence"}"#;

pub const NAVIGATION_SCORING: &str = r#"You are helping navigate a utility provider's customer portal to find billing information (current bill, billing history, statements, transactions, payments, usage charges).

CURRENT URL: {url}
PAGE TITLE: {title}

PAGE SUMMARY:
{content}

CANDIDATE NAVIGATION OPTIONS (index: kind | label | target):
{options}

Rate EVERY option from 1 to 10 for how likely it leads to billing information:
10 = near certain (e.g. "Billing History", "View Bill", "Transactions")
7-9 = likely (e.g. "My Account", "Statements", "Payments")
4-6 = possible (e.g. "Dashboard", "Account Summary", "Usage")
1-3 = unrelated (e.g. "Contact Us", "Help", "FAQ", "Outage Map", "Settings")

Return ONLY this JSON with one entry per option index, no explanation:
{"scores": [{"index": 0, "score": 9}, {"index": 1, "score": 2}]}"#;

pub const VISION_EXTRACTION: &str = r#"This is a screenshot of a page from a utility provider's customer portal ({url}).

Read the billing information visible in the image:
- the current bill / amount due and its billing period,
- the previous bill amount and its period, if shown,
- the payment due date,
- the account number,
- any rows of a billing or transaction history table.

Only report values you can actually read in the image. Use null for anything not visible. Amounts are plain decimals without currency symbols. Dates are YYYY-MM-DD.

Return ONLY this JSON:
{"current_amount": "142.30", "previous_amount": "125.45", "current_period": "March 2024", "previous_period": "February 2024", "due_date": "2024-04-15", "account_number": "1234567890", "transactions": [{"date": "2024-03-01", "description": "Water service", "amount": "142.30", "balance": "142.30"}], "confidence": 7}"#;

pub const HTML_EXTRACTION: &str = r#"You are reading a page from a utility provider's customer portal ({url}). The page may be a single-page app, so billing data can sit in tables, lists, cards or plain text.

PAGE CONTENT (scripts and styles removed, may be truncated):
{content}

Extract the billing information shown:
- the current bill / amount due and its billing period,
- the previous bill amount and its period, if shown,
- the payment due date,
- the account number,
- the rows of any billing or payment history. When one month has several bill dates, report only the latest one for that month.

Only report values that appear in the content. Use null for anything missing. Amounts are plain decimals without currency symbols. Dates are YYYY-MM-DD.

Return ONLY this JSON, no explanation, no markdown:
{"current_amount": "199.00", "previous_amount": "150.46", "current_period": "July 2025", "previous_period": "June 2025", "due_date": "2025-08-10", "account_number": "1234567890", "transactions": [{"date": "2025-07-17", "description": "Latest bill", "amount": "199.00", "balance": null}], "confidence": 7}

If the page holds no billing data, return: {"current_amount": null, "transactions": [], "confidence": 1}"#;

pub const BILLING_HISTORY_EVALUATION: &str = r#"You are a utility billing analyst. Decide whether this page from a customer portal ({url}) shows enough billing history.

PAGE CONTENT (scripts and styles removed, may be truncated):
{content}

Count the distinct months that have BOTH a specific date and a dollar amount, such as table rows, statement lists or transaction histories. A current balance or account summary on its own does not count as history.

The page has sufficient history when at least {min_months} different months are shown.

data_quality must be one of: detailed, partial, minimal, none.

Return ONLY this JSON:
{"has_sufficient_billing_data": true, "months_of_data_found": 6, "data_quality": "detailed", "billing_entries_found": [{"date": "2025-06", "amount": "120.50"}], "evaluation_reason": "one short sentence"}"#;

const TEMPLATES: &[PromptTemplate] = &[
    PromptTemplate {
        name: "page_classification",
        description: "Label a page's purpose and whether it holds billing data",
        template: PAGE_CLASSIFICATION,
    },
    PromptTemplate {
        name: "navigation_scoring",
        description: "Rate candidate links and buttons 1-10 for reaching billing data",
        template: NAVIGATION_SCORING,
    },
    PromptTemplate {
        name: "html_extraction",
        description: "Read billing amounts, dates and history out of page text",
        template: HTML_EXTRACTION,
    },
    PromptTemplate {
        name: "vision_extraction",
        description: "Read billing amounts and dates off a page screenshot",
        template: VISION_EXTRACTION,
    },
    PromptTemplate {
        name: "billing_history_evaluation",
        description: "Judge whether a page shows enough months of billing history",
        template: BILLING_HISTORY_EVALUATION,
    },
];

/// Look up a template by name.
pub fn get_prompt(name: &str) -> Option<&'static PromptTemplate> {
    TEMPLATES.iter().find(|t| t.name == name)
}

/// All available templates.
pub fn list_prompts() -> &'static [PromptTemplate] {
    TEMPLATES
}

/// Fill `{key}` placeholders. Unknown placeholders are left as they are, and
/// substituted values are never re-scanned.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let key_end = after
            .find('}')
            .filter(|&end| after[..end].chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && end > 0);

        match key_end.and_then(|end| values.iter().find(|(k, _)| *k == &after[..end]).map(|(_, v)| (end, v))) {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        assert!(get_prompt("navigation_scoring").is_some());
        assert!(get_prompt("nonexistent").is_none());
        let names: Vec<&str> = list_prompts().iter().map(|t| t.name).collect();
        assert_eq!(names, vec![
            "page_classification",
            "navigation_scoring",
            "html_extraction",
            "vision_extraction",
            "billing_history_evaluation",
        ]);
    }

    #[test]
    fn test_render_leaves_json_examples_alone() {
        let rendered = render(PAGE_CLASSIFICATION, &[
            ("url", "https://portal.example.com/home"),
            ("title", "Home"),
            ("content", "Amount due {not a key}"),
        ]);
        assert!(rendered.contains("URL: https://portal.example.com/home"));
        assert!(rendered.contains("Amount due {not a key}"));
        assert!(rendered.contains(r#"{"page_type": "billing""#));
        assert!(!rendered.contains("{url}"));
    }

    #[test]
    fn test_render_does_not_rescan_values() {
        let rendered = render("{a} and {b}", &[("a", "{b}"), ("b", "two")]);
        assert_eq!(rendered, "{b} and two");
    }
}
