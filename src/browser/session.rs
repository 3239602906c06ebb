use anyhow::{Result, Context};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::{debug, error, info, warn};

use crate::browser::{ElementLocator, PageSession};
use crate::cli::config::BrowserSettings;
use crate::error::SessionError;
use crate::page::NetworkResponse;

/// WebDriver messages that mean the browser or its session is gone.
const FATAL_MARKERS: &[&str] = &[
    "invalid session id",
    "no such window",
    "session not created",
    "session deleted",
    "chrome not reachable",
    "disconnected",
    "connection refused",
    "target window already closed",
];

static LOGIN_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)/(login|log-in|signin|sign-in|logon|auth/login)(\b|/|\?|$)").expect("login pattern is valid")
});

/// Controls that open a collapsed menu when clicked
const MENU_TRIGGERS: &str = "[aria-expanded='false'], [aria-haspopup='true'], [aria-haspopup='menu'], \
     .dropdown-toggle, [data-toggle='dropdown'], [data-bs-toggle='dropdown']";

/// Menu labels worth opening, e.g. "BILL & PAY", "Billing", "My Account"
static MENU_LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bill|billing|bills|pay|payments?|account|statements?|usage)\b").expect("menu label pattern is valid")
});

/// Most menus a single page expansion will open
const MAX_MENUS_OPENED: usize = 5;

/// Replays the page's fetch/XHR calls from inside the page so the
/// browser's own cookies and headers apply.
const NETWORK_SCRIPT: &str = r#"
const done = arguments[arguments.length - 1];
const limit = arguments[0];
const maxBytes = arguments[1];
const seen = new Set();
const urls = performance.getEntriesByType('resource')
  .filter(e => e.initiatorType === 'fetch' || e.initiatorType === 'xmlhttprequest')
  .map(e => e.name)
  .filter(u => { if (seen.has(u)) return false; seen.add(u); return true; })
  .slice(-limit);
Promise.all(urls.map(u =>
  fetch(u, { credentials: 'include', headers: { 'Accept': 'application/json' } })
    .then(r => r.text().then(t => ({
      url: u,
      status: r.status,
      content_type: r.headers.get('content-type'),
      body: t.slice(0, maxBytes)
    })))
    .catch(() => null)))
  .then(rs => done(rs.filter(r => r !== null)))
  .catch(() => done([]));
"#;

/// Browser session backed by a WebDriver server
pub struct WebDriverSession {
    /// Browser settings
    config: BrowserSettings,

    /// WebDriver instance
    driver: Option<WebDriver>,

    /// The landing page was already a login page, so login redirects prove nothing
    landing_was_login: bool,
}

impl WebDriverSession {
    /// Start a browser through the configured WebDriver server
    pub async fn connect(config: BrowserSettings, user_data_dir: Option<&str>) -> Result<Self> {
        let mut caps = DesiredCapabilities::chrome();

        caps.add_chrome_arg(&format!("--window-size={},{}", config.viewport.width, config.viewport.height))?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;

        // Reuse a profile that already holds the provider's login cookies
        if let Some(dir) = user_data_dir {
            caps.add_chrome_arg(&format!("--user-data-dir={}", dir))?;
        }

        if config.headless {
            caps.set_headless()?;
        }

        let driver = WebDriver::new(&config.webdriver_url, caps).await
            .context(format!("Failed to connect to WebDriver at {}", config.webdriver_url))?;

        driver.set_page_load_timeout(Duration::from_secs(config.page_load_timeout_secs)).await?;
        driver.set_script_timeout(Duration::from_secs(config.page_load_timeout_secs)).await?;

        debug!("Browser session initialized via {}", config.webdriver_url);

        Ok(Self {
            config,
            driver: Some(driver),
            landing_was_login: false,
        })
    }

    /// Open the portal's landing page, optionally pausing for a manual login
    pub async fn open_landing(&mut self, url: &str, login_wait: Option<Duration>) -> Result<()> {
        self.load(url).await.context(format!("Failed to open {}", url))?;

        if let Some(wait) = login_wait {
            info!("Waiting {:?} for login to complete in the browser window", wait);
            tokio::time::sleep(wait).await;
            self.settle().await;
        }

        let landed = self.current_url().await?;
        self.landing_was_login = LOGIN_PATH_RE.is_match(&landed);
        if self.landing_was_login {
            warn!("Landing page {} looks like a login page", landed);
        }
        Ok(())
    }

    /// Close the browser session
    pub async fn close(&mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
        Ok(())
    }

    fn driver(&self) -> Result<&WebDriver, SessionError> {
        self.driver
            .as_ref()
            .ok_or_else(|| SessionError::Fatal("Browser session not initialized".to_string()))
    }

    async fn load(&self, url: &str) -> Result<(), SessionError> {
        let driver = self.driver()?;
        debug!("Navigating to: {}", url);
        driver.goto(url).await
            .map_err(|e| classify(e, &format!("Failed to navigate to {}", url), SessionError::Navigation))?;
        self.settle().await;
        Ok(())
    }

    /// Give client-side rendering time to finish after a navigation.
    async fn settle(&self) {
        let Ok(driver) = self.driver() else {
            return;
        };
        for _ in 0..20 {
            let state = match driver.execute("return document.readyState", Vec::new()).await {
                Ok(ret) => ret.convert::<String>().unwrap_or_default(),
                Err(_) => break,
            };
            if state == "complete" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
    }

    /// Being bounced to a login page means the session's authentication is gone.
    async fn ensure_authenticated(&self) -> Result<(), SessionError> {
        if self.landing_was_login {
            return Ok(());
        }
        let url = self.current_url().await?;
        if LOGIN_PATH_RE.is_match(&url) {
            return Err(SessionError::Fatal(format!("redirected to login page {}", url)));
        }
        Ok(())
    }

    async fn resolve(&self, locator: &ElementLocator) -> Result<WebElement, SessionError> {
        let driver = self.driver()?;

        if let Some(css) = &locator.css {
            let found = driver.find_all(By::Css(css)).await
                .map_err(|e| classify(e, "Failed to query elements", SessionError::Navigation))?;
            for element in found {
                let text = element.text().await.unwrap_or_default();
                if locator.text.is_empty() || locator.text_matches(&text) {
                    return Ok(element);
                }
            }
        }

        for xpath in [locator.text_xpath(), locator.label_xpath()] {
            let mut found = driver.find_all(By::XPath(&xpath)).await
                .map_err(|e| classify(e, "Failed to query elements", SessionError::Navigation))?;
            if found.is_empty() {
                continue;
            }
            let index = locator.index.min(found.len() - 1);
            return Ok(found.swap_remove(index));
        }

        Err(SessionError::Navigation(format!(
            "element <{}> '{}' not found on current page",
            locator.tag, locator.text
        )))
    }
}

#[async_trait]
impl PageSession for WebDriverSession {
    async fn current_url(&self) -> Result<String, SessionError> {
        let url = self.driver()?.current_url().await
            .map_err(|e| classify(e, "Failed to read current URL", SessionError::Capture))?;
        Ok(url.to_string())
    }

    async fn page_source(&self) -> Result<String, SessionError> {
        self.driver()?.source().await
            .map_err(|e| classify(e, "Failed to get page source", SessionError::Capture))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, SessionError> {
        self.driver()?.screenshot_as_png().await
            .map_err(|e| classify(e, "Failed to take screenshot", SessionError::Capture))
    }

    async fn network_responses(&self) -> Result<Vec<NetworkResponse>, SessionError> {
        if !self.config.capture_network {
            return Ok(Vec::new());
        }
        let driver = self.driver()?;
        let args = vec![
            json!(self.config.max_network_responses),
            json!(self.config.max_response_bytes),
        ];
        let ret = driver.execute_async(NETWORK_SCRIPT, args).await
            .map_err(|e| classify(e, "Failed to read network activity", SessionError::Capture))?;
        let responses: Vec<NetworkResponse> = ret.convert()
            .map_err(|e| SessionError::Capture(format!("Unexpected network log shape: {}", e)))?;

        Ok(responses.into_iter().filter(|r| r.looks_like_json()).collect())
    }

    async fn goto(&mut self, url: &str) -> Result<(), SessionError> {
        self.load(url).await?;
        self.ensure_authenticated().await
    }

    async fn click(&mut self, locator: &ElementLocator) -> Result<(), SessionError> {
        let element = self.resolve(locator).await?;

        if let Err(e) = element.scroll_into_view().await {
            debug!("Could not scroll '{}' into view: {}", locator.text, e);
        }
        element.click().await
            .map_err(|e| classify(e, &format!("Failed to click '{}'", locator.text), SessionError::Navigation))?;

        self.settle().await;
        self.ensure_authenticated().await
    }

    async fn expand_menus(&mut self) -> Result<usize, SessionError> {
        let triggers = self.driver()?.find_all(By::Css(MENU_TRIGGERS)).await
            .map_err(|e| classify(e, "Failed to query menu triggers", SessionError::Capture))?;

        let mut opened = 0;
        for trigger in triggers {
            if opened >= MAX_MENUS_OPENED {
                break;
            }
            let label = trigger.text().await.unwrap_or_default();
            if !is_menu_label(&label) || !trigger.is_displayed().await.unwrap_or(false) {
                continue;
            }
            match trigger.click().await {
                Ok(()) => {
                    debug!("Opened menu '{}'", label.trim());
                    opened += 1;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                Err(e) => {
                    let err = classify(e, &format!("Failed to open menu '{}'", label.trim()), SessionError::Navigation);
                    if err.is_fatal() {
                        return Err(err);
                    }
                    debug!("{}", err);
                }
            }
        }

        if opened > 0 {
            self.ensure_authenticated().await?;
        }
        Ok(opened)
    }
}

/// Whether a menu trigger's label names a billing or account section.
fn is_menu_label(label: &str) -> bool {
    let label = label.trim();
    !label.is_empty() && label.chars().count() <= 40 && MENU_LABEL_RE.is_match(label)
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Quit on the runtime if one is still around
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}

/// Map a WebDriver failure to a session error, promoting dead-session
/// failures to fatal.
fn classify(err: WebDriverError, context: &str, otherwise: fn(String) -> SessionError) -> SessionError {
    let message = format!("{}: {}", context, err);
    if is_fatal_message(&message) {
        SessionError::Fatal(message)
    } else {
        otherwise(message)
    }
}

fn is_fatal_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    FATAL_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_messages() {
        assert!(is_fatal_message("Failed to click: invalid session id"));
        assert!(is_fatal_message("chrome not reachable"));
        assert!(!is_fatal_message("stale element reference: element is not attached"));
        assert!(!is_fatal_message("no such element: Unable to locate element"));
    }

    #[test]
    fn test_menu_labels() {
        assert!(is_menu_label("BILL & PAY"));
        assert!(is_menu_label("  My Account "));
        assert!(is_menu_label("Payments"));
        assert!(!is_menu_label("Outages"));
        assert!(!is_menu_label("Billboard"));
        assert!(!is_menu_label(""));
    }

    #[test]
    fn test_login_redirect_detection() {
        assert!(LOGIN_PATH_RE.is_match("https://portal.example.com/login?next=/billing"));
        assert!(LOGIN_PATH_RE.is_match("https://portal.example.com/account/sign-in"));
        assert!(!LOGIN_PATH_RE.is_match("https://portal.example.com/billing/history"));
        assert!(!LOGIN_PATH_RE.is_match("https://portal.example.com/loginhelp-faq"));
    }
}
