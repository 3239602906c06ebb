use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use url::Url;

use crate::browser::{ElementLocator, PageSession};
use crate::error::SessionError;
use crate::explorer::normalize_url;
use crate::page::NetworkResponse;

/// One page of a [`StaticSite`].
#[derive(Debug, Clone, Default)]
struct StaticPage {
    html: String,
    screenshot: Option<Vec<u8>>,
    network: Vec<NetworkResponse>,
    /// Lower-case element label to destination URL, for script-driven controls
    clicks: HashMap<String, String>,
    /// Markup shown once the page's menus are opened
    expanded: Option<String>,
}

/// A fixed set of pages served from memory.
///
/// Backs offline analysis of saved pages and gives the explorer a
/// deterministic site to run against.
#[derive(Debug, Clone)]
pub struct StaticSite {
    pages: HashMap<String, StaticPage>,
    current: String,
    history: Vec<String>,
    broken_session: bool,
}

impl StaticSite {
    /// A site whose browser starts on `start_url`.
    pub fn new(start_url: &str) -> Self {
        let start = normalize_url(start_url);
        Self {
            pages: HashMap::new(),
            current: start.clone(),
            history: vec![start],
            broken_session: false,
        }
    }

    /// Add or replace a page.
    pub fn page(mut self, url: &str, html: impl Into<String>) -> Self {
        self.pages.entry(normalize_url(url)).or_default().html = html.into();
        self
    }

    pub fn with_network(mut self, url: &str, responses: Vec<NetworkResponse>) -> Self {
        self.pages.entry(normalize_url(url)).or_default().network = responses;
        self
    }

    pub fn with_screenshot(mut self, url: &str, png: Vec<u8>) -> Self {
        self.pages.entry(normalize_url(url)).or_default().screenshot = Some(png);
        self
    }

    /// Clicking the element labelled `label` on `url` loads `target`.
    pub fn on_click(mut self, url: &str, label: &str, target: &str) -> Self {
        self.pages
            .entry(normalize_url(url))
            .or_default()
            .clicks
            .insert(label.trim().to_lowercase(), target.to_string());
        self
    }

    /// Opening the menus on `url` swaps its markup for `html`.
    pub fn on_expand(mut self, url: &str, html: impl Into<String>) -> Self {
        self.pages.entry(normalize_url(url)).or_default().expanded = Some(html.into());
        self
    }

    /// Every later call fails as if the browser had crashed.
    pub fn break_session(&mut self) {
        self.broken_session = true;
    }

    /// URLs loaded so far, starting with the landing page.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    fn alive(&self) -> Result<(), SessionError> {
        if self.broken_session {
            Err(SessionError::Fatal("browser window closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn current_page(&self) -> Result<&StaticPage, SessionError> {
        self.alive()?;
        self.pages
            .get(&self.current)
            .ok_or_else(|| SessionError::Capture(format!("no page loaded at {}", self.current)))
    }

    fn resolve_target(&self, locator: &ElementLocator) -> Result<String, SessionError> {
        let page = self.current_page()?;

        if let Some(target) = page.clicks.get(&locator.text.to_lowercase()) {
            return Ok(target.clone());
        }

        let document = Html::parse_document(&page.html);
        let selector = Selector::parse(&locator.tag)
            .map_err(|_| SessionError::Navigation(format!("bad tag in locator: {}", locator.tag)))?;
        let matches: Vec<ElementRef> = document
            .select(&selector)
            .filter(|el| locator.text_matches(&label_of(el)))
            .collect();
        let element = matches
            .get(locator.index)
            .or_else(|| matches.first())
            .ok_or_else(|| SessionError::Navigation(format!("element '{}' not found", locator.text)))?;

        let destination = ["href", "routerlink", "ui-sref"]
            .iter()
            .find_map(|attr| element.value().attr(attr))
            .ok_or_else(|| SessionError::Navigation(format!("clicking '{}' did nothing", locator.text)))?;

        let base = Url::parse(&self.current)
            .map_err(|e| SessionError::Navigation(format!("current URL is invalid: {}", e)))?;
        base.join(destination)
            .map(|url| url.to_string())
            .map_err(|e| SessionError::Navigation(format!("bad link '{}': {}", destination, e)))
    }
}

/// Visible label of an element, falling back to its accessible name.
fn label_of(element: &ElementRef) -> String {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if !text.is_empty() {
        return text;
    }
    ["aria-label", "title", "value"]
        .iter()
        .find_map(|attr| element.value().attr(attr))
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl PageSession for StaticSite {
    async fn current_url(&self) -> Result<String, SessionError> {
        self.alive()?;
        Ok(self.current.clone())
    }

    async fn page_source(&self) -> Result<String, SessionError> {
        Ok(self.current_page()?.html.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, SessionError> {
        self.current_page()?
            .screenshot
            .clone()
            .ok_or_else(|| SessionError::Capture("no screenshot stored for page".to_string()))
    }

    async fn network_responses(&self) -> Result<Vec<NetworkResponse>, SessionError> {
        Ok(self.current_page()?.network.clone())
    }

    async fn goto(&mut self, url: &str) -> Result<(), SessionError> {
        self.alive()?;
        let key = normalize_url(url);
        if !self.pages.contains_key(&key) {
            return Err(SessionError::Navigation(format!("404 Not Found: {}", url)));
        }
        self.current = key.clone();
        self.history.push(key);
        Ok(())
    }

    async fn click(&mut self, locator: &ElementLocator) -> Result<(), SessionError> {
        let target = self.resolve_target(locator)?;
        self.goto(&target).await
    }

    async fn expand_menus(&mut self) -> Result<usize, SessionError> {
        self.alive()?;
        let page = self
            .pages
            .get_mut(&self.current)
            .ok_or_else(|| SessionError::Capture(format!("no page loaded at {}", self.current)))?;
        match page.expanded.take() {
            Some(html) => {
                page.html = html;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(text: &str) -> ElementLocator {
        ElementLocator {
            tag: "a".into(),
            css: None,
            text: text.into(),
            href: None,
            index: 0,
        }
    }

    #[tokio::test]
    async fn test_click_follows_relative_href() {
        let mut site = StaticSite::new("https://portal.example.com/home")
            .page("https://portal.example.com/home", r#"<a href="bills">View Bill</a>"#)
            .page("https://portal.example.com/bills", "<p>Amount Due $10.00</p>");

        site.click(&link("view bill")).await.unwrap();
        assert_eq!(site.current_url().await.unwrap(), "https://portal.example.com/bills");
        assert_eq!(site.history().len(), 2);
    }

    #[tokio::test]
    async fn test_registered_click_and_broken_link() {
        let mut site = StaticSite::new("https://portal.example.com/")
            .page("https://portal.example.com/", r#"<button>Billing</button><a href="/gone">Old</a>"#)
            .page("https://portal.example.com/#/billing", "<p>Billing</p>")
            .on_click("https://portal.example.com/", "Billing", "https://portal.example.com/#/billing");

        let mut button = link("Billing");
        button.tag = "button".into();
        site.click(&button).await.unwrap();
        assert_eq!(site.current_url().await.unwrap(), "https://portal.example.com/#/billing");

        site.goto("https://portal.example.com/").await.unwrap();
        let err = site.click(&link("Old")).await.unwrap_err();
        assert!(matches!(err, SessionError::Navigation(_)));
    }

    #[tokio::test]
    async fn test_expanding_menus_reveals_markup_once() {
        let mut site = StaticSite::new("https://portal.example.com/")
            .page("https://portal.example.com/", "<button>BILL & PAY</button>")
            .on_expand("https://portal.example.com/", r#"<button>BILL & PAY</button><a href="/bill">View Bill</a>"#);

        assert_eq!(site.expand_menus().await.unwrap(), 1);
        assert!(site.page_source().await.unwrap().contains("View Bill"));
        assert_eq!(site.expand_menus().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broken_session_is_fatal() {
        let mut site = StaticSite::new("https://portal.example.com/")
            .page("https://portal.example.com/", "<p>hi</p>");
        site.break_session();
        assert!(site.page_source().await.unwrap_err().is_fatal());
        assert!(site.goto("https://portal.example.com/").await.unwrap_err().is_fatal());
    }
}
