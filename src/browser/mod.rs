pub mod session;
pub mod static_site;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::page::NetworkResponse;

// Re-export common types
pub use session::WebDriverSession;
pub use static_site::StaticSite;

/// An authenticated browser tab the explorer drives.
///
/// Login happens before the explorer gets the session. Reads take `&self`;
/// anything that changes the loaded page takes `&mut self`.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// URL of the page currently loaded
    async fn current_url(&self) -> Result<String, SessionError>;

    /// Rendered HTML of the current page
    async fn page_source(&self) -> Result<String, SessionError>;

    /// PNG screenshot of the viewport
    async fn screenshot(&self) -> Result<Vec<u8>, SessionError>;

    /// Responses observed while the current page loaded
    async fn network_responses(&self) -> Result<Vec<NetworkResponse>, SessionError>;

    /// Load a URL and wait for it to settle
    async fn goto(&mut self, url: &str) -> Result<(), SessionError>;

    /// Find the described element on the current page and click it
    async fn click(&mut self, locator: &ElementLocator) -> Result<(), SessionError>;

    /// Open collapsed menus whose trigger names billing or account sections.
    ///
    /// Returns how many menus were opened. Sessions that cannot expand
    /// anything report zero.
    async fn expand_menus(&mut self) -> Result<usize, SessionError> {
        Ok(0)
    }
}

/// Re-resolvable description of an interactive element.
///
/// Holds no live handle: the session finds the element again on whatever is
/// rendered at click time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementLocator {
    /// Lower-case tag name
    pub tag: String,
    /// Stable CSS selector when the element has an id or href
    pub css: Option<String>,
    /// Visible label, whitespace collapsed
    pub text: String,
    /// Raw `href` attribute, if any
    pub href: Option<String>,
    /// Position among elements with the same tag and label
    pub index: usize,
}

impl ElementLocator {
    /// Whether `label` names the same element text, ignoring case and spacing.
    pub fn text_matches(&self, label: &str) -> bool {
        let normalized = label.split_whitespace().collect::<Vec<_>>().join(" ");
        normalized.eq_ignore_ascii_case(&self.text)
    }

    /// XPath selecting every `tag` element whose normalized text is `text`.
    pub fn text_xpath(&self) -> String {
        format!("//{}[normalize-space(.)={}]", self.tag, xpath_literal(&self.text))
    }

    /// XPath for icon-style controls labelled through attributes.
    pub fn label_xpath(&self) -> String {
        let literal = xpath_literal(&self.text);
        format!(
            "//{}[@aria-label={} or @title={} or @value={}]",
            self.tag, literal, literal, literal
        )
    }
}

/// Quote a string for use inside an XPath expression.
fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{}'", value)
    } else if !value.contains('"') {
        format!("\"{}\"", value)
    } else {
        let parts: Vec<String> = value.split('\'').map(|part| format!("'{}'", part)).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(text: &str) -> ElementLocator {
        ElementLocator {
            tag: "a".into(),
            css: None,
            text: text.into(),
            href: None,
            index: 0,
        }
    }

    #[test]
    fn test_text_xpath_quoting() {
        assert_eq!(locator("View Bill").text_xpath(), "//a[normalize-space(.)='View Bill']");
        assert_eq!(locator("Pay 'Now'").text_xpath(), "//a[normalize-space(.)=\"Pay 'Now'\"]");
        assert_eq!(
            locator("It's \"it\"").text_xpath(),
            "//a[normalize-space(.)=concat('It', \"'\", 's \"it\"')]"
        );
    }

    #[test]
    fn test_text_matches_ignores_case_and_spacing() {
        assert!(locator("View Bill").text_matches("  view\n  BILL "));
        assert!(!locator("View Bill").text_matches("View Bills"));
    }
}
