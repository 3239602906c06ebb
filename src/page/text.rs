use scraper::{Html, Node, Selector};

/// Elements whose text never reaches the user.
const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template", "svg", "head"];

/// Words that mark a line as worth keeping when the prompt budget is tight.
const BILLING_HINTS: &[&str] = &[
    "$", "bill", "amount", "due", "balance", "payment", "date", "transaction", "statement",
    "account", "usage", "charge",
];

/// Visible text of a document, one text node per line.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();

    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map_or(false, |el| HIDDEN_TAGS.contains(&el.name()))
        });
        if hidden {
            continue;
        }

        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }

    lines.join("\n")
}

/// Contents of the `<title>` element, if any.
pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    let title = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    (!title.is_empty()).then_some(title)
}

/// Fit page text into `max_chars`, preferring lines that look billing related.
///
/// Lines keep their original order; the cut always lands on a char boundary.
pub fn excerpt_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut keep = vec![false; lines.len()];
    let mut used = 0usize;

    let relevant = |line: &str| {
        let lower = line.to_lowercase();
        BILLING_HINTS.iter().any(|hint| lower.contains(hint))
    };

    for pass in 0..2 {
        for (i, line) in lines.iter().enumerate() {
            if keep[i] || (pass == 0 && !relevant(line)) {
                continue;
            }
            let cost = line.chars().count() + 1;
            if used + cost > max_chars {
                continue;
            }
            keep[i] = true;
            used += cost;
        }
    }

    let joined = lines
        .iter()
        .zip(keep)
        .filter_map(|(line, kept)| kept.then_some(*line))
        .collect::<Vec<_>>()
        .join("\n");

    truncate_chars(&joined, max_chars)
}

/// First `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_text_skips_scripts() {
        let html = r#"<html><head><title>My Account</title><style>.a{}</style></head>
            <body><script>var amount = "$999.99";</script>
            <div>Current Bill <b>$142.30</b></div><noscript>enable js</noscript></body></html>"#;
        let text = visible_text(html);
        assert_eq!(text, "Current Bill\n$142.30");
        assert_eq!(page_title(html).as_deref(), Some("My Account"));
    }

    #[test]
    fn test_excerpt_prefers_billing_lines() {
        let text = "Welcome back\nNews and offers\nAmount Due $80.00\nFollow us";
        let excerpt = excerpt_for_prompt(text, 30);
        assert!(excerpt.contains("Amount Due $80.00"));
        assert!(excerpt.chars().count() <= 30);
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
