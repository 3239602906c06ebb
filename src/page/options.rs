use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use url::{Host, Url};

use crate::browser::ElementLocator;
use crate::explorer::normalize_url;
use crate::page::snapshot::PageSnapshot;

/// How a navigation option is performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Absolute link: load the URL
    Url,
    /// Relative link or hash route, resolved against the page URL
    RelativePath,
    /// Link driven by script: click it
    LinkClick,
    /// Button-like control: click it
    ButtonClick,
}

/// One candidate action on a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationOption {
    pub text: String,
    pub target: TargetKind,
    /// Absolute destination for `Url` and `RelativePath` targets
    pub destination: Option<String>,
    pub raw_locator: ElementLocator,
    /// 0 until scored, then 1..=10
    pub relevance_score: u8,
    pub document_order: usize,
}

impl NavigationOption {
    /// Identity of the action, used to avoid retrying a target.
    pub fn attempt_key(&self, page_url: &str) -> String {
        match &self.destination {
            Some(destination) => normalize_url(destination),
            None => format!(
                "click:{}:{}:{}",
                normalize_url(page_url),
                self.raw_locator.tag,
                self.text.to_lowercase()
            ),
        }
    }

    pub fn is_click(&self) -> bool {
        matches!(self.target, TargetKind::LinkClick | TargetKind::ButtonClick)
    }
}

static CANDIDATES: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        "a, button, input[type=submit], input[type=button], [role=button], [role=link], \
         [role=menuitem], [role=tab], [onclick], [ng-click], [routerlink], [ui-sref], [data-href]",
    )
    .expect("candidate selector is valid")
});

static SIMPLE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][\w-]*$").expect("id pattern is valid"));

static ONCLICK_LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"location(?:\.href)?\s*=\s*["']([^"']+)["']|location\.assign\(\s*["']([^"']+)["']"#)
        .expect("onclick pattern is valid")
});

const LOGOUT_WORDS: &[&str] = &["logout", "log out", "log-out", "signout", "sign out", "sign-out", "logoff", "log off"];

const SKIPPED_SCHEMES: &[&str] = &["mailto:", "tel:", "sms:", "javascript:", "data:", "ftp:"];

const ASSET_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".css", ".js", ".zip", ".doc", ".docx",
    ".xls", ".xlsx", ".csv", ".ics",
];

const CLICK_ATTRIBUTES: &[&str] = &["onclick", "ng-click", "routerlink", "ui-sref", "data-href"];

/// Second-level labels that act as public suffixes under a country TLD (co.uk, com.au)
const SECOND_LEVEL_SUFFIXES: &[&str] = &[
    "co", "com", "net", "org", "gov", "govt", "edu", "ac", "ltd", "plc", "nhs", "ne", "or", "gob",
    "nom", "sch", "mil", "gen",
];

/// Longest label still treated as a navigation control
const MAX_LABEL_CHARS: usize = 120;

/// Hash routes billing portals commonly use
const COMMON_ROUTES: &[(&str, &str)] = &[
    ("billing-history", "Billing History"),
    ("transaction-history", "Transaction History"),
    ("payment-history", "Payment History"),
    ("account-history", "Account History"),
    ("billing", "Billing"),
    ("transactions", "Transactions"),
    ("statements", "Statements"),
    ("bills", "Bills"),
    ("usage-history", "Usage History"),
];

/// Collect the interactive elements of a page as unscored options.
///
/// Logout, off-site, mail/phone, asset and in-page anchor targets are dropped,
/// and duplicates (same label, same target) are collapsed. Hidden links are
/// kept only inside navigation menus, where a collapsed dropdown still
/// leads somewhere by URL. An empty result is a normal outcome.
pub fn extract_options(snapshot: &PageSnapshot) -> Vec<NavigationOption> {
    let Ok(base) = Url::parse(&snapshot.url) else {
        debug!("Cannot extract options, page URL is not absolute: {}", snapshot.url);
        return Vec::new();
    };

    let document = Html::parse_document(&snapshot.html);
    let mut options = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut occurrences: HashMap<(String, String), usize> = HashMap::new();

    for element in document.select(&CANDIDATES) {
        let tag = element.value().name().to_lowercase();
        let text = label_of(&element);
        if text.is_empty() {
            continue;
        }

        let occurrence = occurrences.entry((tag.clone(), text.to_lowercase())).or_insert(0);
        let index = *occurrence;
        *occurrence += 1;

        if text.chars().count() > MAX_LABEL_CHARS || is_disabled(&element) {
            continue;
        }
        let hidden = is_hidden(&element);
        if hidden && !in_menu(&element) {
            continue;
        }
        let Some((target, destination)) = classify_target(&element, &tag, &base) else {
            continue;
        };
        // A collapsed menu entry cannot be clicked, only loaded
        if hidden && destination.is_none() {
            continue;
        }
        if is_logout(&text, destination.as_deref().or(element.value().attr("href"))) {
            continue;
        }

        let target_key = destination.as_deref().map(normalize_url).unwrap_or_else(|| format!("click:{}", tag));
        if !seen.insert((text.to_lowercase(), target_key)) {
            continue;
        }

        options.push(NavigationOption {
            raw_locator: ElementLocator {
                css: stable_css(&element, &tag),
                tag,
                text: text.clone(),
                href: element.value().attr("href").map(str::to_string),
                index,
            },
            text,
            target,
            destination,
            relevance_score: 0,
            document_order: options.len(),
        });
    }

    debug!("Extracted {} navigation options from {}", options.len(), snapshot.url);
    options
}

/// Synthetic hash-route options for single-page apps.
///
/// Only offered when the page looks hash-routed; routes equal to the current
/// view are skipped.
pub fn common_route_options(snapshot: &PageSnapshot) -> Vec<NavigationOption> {
    let Ok(base) = Url::parse(&snapshot.url) else {
        return Vec::new();
    };
    if !looks_hash_routed(snapshot, &base) {
        return Vec::new();
    }

    let current = normalize_url(&snapshot.url);
    let mut app_root = base.clone();
    app_root.set_query(None);
    app_root.set_fragment(None);

    COMMON_ROUTES
        .iter()
        .filter_map(|(route, label)| {
            let mut url = app_root.clone();
            url.set_fragment(Some(&format!("/{}", route)));
            let destination = url.to_string();
            (normalize_url(&destination) != current).then_some((destination, label))
        })
        .enumerate()
        .map(|(i, (destination, label))| NavigationOption {
            text: label.to_string(),
            target: TargetKind::RelativePath,
            raw_locator: ElementLocator {
                tag: "a".to_string(),
                css: None,
                text: label.to_string(),
                href: Some(format!("#{}", destination.split_once('#').map_or("", |(_, f)| f))),
                index: 0,
            },
            destination: Some(destination),
            relevance_score: 0,
            document_order: i,
        })
        .collect()
}

fn looks_hash_routed(snapshot: &PageSnapshot, base: &Url) -> bool {
    base.fragment().map_or(false, |f| f.starts_with('/') || f.starts_with("!/"))
        || snapshot.html.contains("href=\"#/")
        || snapshot.html.contains("href=\"#!/")
        || snapshot.html.contains("ng-app")
        || snapshot.html.contains("ng-version")
}

/// Visible label, falling back to accessible-name attributes and image alt text.
fn label_of(element: &ElementRef) -> String {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if !text.is_empty() {
        return text;
    }

    let attr_label = ["aria-label", "title", "value"]
        .iter()
        .find_map(|attr| element.value().attr(attr))
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "));
    if let Some(label) = attr_label.filter(|l| !l.is_empty()) {
        return label;
    }

    Selector::parse("img[alt]")
        .ok()
        .and_then(|img| element.select(&img).next())
        .and_then(|img| img.value().attr("alt"))
        .map(|alt| alt.trim().to_string())
        .unwrap_or_default()
}

fn is_disabled(element: &ElementRef) -> bool {
    let el = element.value();
    el.attr("disabled").is_some() || el.attr("aria-disabled") == Some("true")
}

fn is_hidden(element: &ElementRef) -> bool {
    let el = element.value();
    let hidden_style = el
        .attr("style")
        .map(|s| s.replace(' ', "").to_lowercase())
        .map_or(false, |s| s.contains("display:none") || s.contains("visibility:hidden"));
    el.attr("hidden").is_some() || el.attr("aria-hidden") == Some("true") || hidden_style
}

/// Whether the element sits in a nav bar, menu or dropdown.
fn in_menu(element: &ElementRef) -> bool {
    element.ancestors().filter_map(ElementRef::wrap).any(|ancestor| {
        let el = ancestor.value();
        let role = el.attr("role").unwrap_or_default().to_lowercase();
        el.name().eq_ignore_ascii_case("nav")
            || matches!(role.as_str(), "menu" | "menubar" | "navigation")
            || el.classes().any(|class| {
                let class = class.to_lowercase();
                class.contains("menu") || class.contains("dropdown") || class.contains("nav")
            })
    })
}

fn has_click_handler(element: &ElementRef) -> bool {
    CLICK_ATTRIBUTES.iter().any(|attr| element.value().attr(attr).is_some())
}

/// Decide how an element navigates, or `None` if it should be ignored.
fn classify_target(element: &ElementRef, tag: &str, base: &Url) -> Option<(TargetKind, Option<String>)> {
    if let Some(onclick) = element.value().attr("onclick") {
        if let Some(caps) = ONCLICK_LOCATION.captures(onclick) {
            let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
            return resolve_href(raw, base).map(|(kind, url)| (kind, Some(url)));
        }
    }

    let href = element.value().attr("href").map(str::trim).filter(|h| !h.is_empty());

    if tag == "a" {
        match href {
            Some(href) if href == "#" || href.to_lowercase().starts_with("javascript:") => {
                has_click_handler(element).then_some((TargetKind::LinkClick, None))
            }
            Some(href) => resolve_href(href, base).map(|(kind, url)| (kind, Some(url))),
            None => has_click_handler(element).then_some((TargetKind::LinkClick, None)),
        }
    } else if let Some(href) = element.value().attr("data-href") {
        resolve_href(href, base).map(|(kind, url)| (kind, Some(url)))
    } else {
        Some((TargetKind::ButtonClick, None))
    }
}

/// Resolve an href, rejecting targets the explorer should never follow.
fn resolve_href(href: &str, base: &Url) -> Option<(TargetKind, String)> {
    let lower = href.to_lowercase();
    if SKIPPED_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
        return None;
    }

    // In-page anchors are not navigation; hash routes are
    if let Some(fragment) = href.strip_prefix('#') {
        if !(fragment.starts_with('/') || fragment.starts_with("!/")) {
            return None;
        }
    }

    let absolute = lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("//");
    let resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") || !same_site(base, &resolved) {
        return None;
    }

    let path = resolved.path().to_lowercase();
    if ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return None;
    }

    let kind = if absolute { TargetKind::Url } else { TargetKind::RelativePath };
    Some((kind, resolved.to_string()))
}

/// Same host, or hosts under the same registrable domain (portal.x.com and
/// pay.x.com, my.x.co.uk and pay.x.co.uk). IP addresses must match exactly.
fn same_site(a: &Url, b: &Url) -> bool {
    match (a.host(), b.host()) {
        (Some(Host::Domain(a)), Some(Host::Domain(b))) => {
            let a = a.to_lowercase();
            let b = b.to_lowercase();
            let a = a.trim_start_matches("www.");
            let b = b.trim_start_matches("www.");
            a == b || (a.contains('.') && registrable_domain(a) == registrable_domain(b))
        }
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// The host's registrable domain: one label below its public suffix.
///
/// Suffixes are the TLD, or a known second-level label under a two-letter
/// country TLD.
fn registrable_domain(host: &str) -> &str {
    let labels: Vec<&str> = host.split('.').collect();
    let n = labels.len();
    let keep = if n >= 3 && labels[n - 1].len() == 2 && SECOND_LEVEL_SUFFIXES.contains(&labels[n - 2]) {
        3
    } else {
        2
    };
    if n <= keep {
        return host;
    }
    let skipped: usize = labels[..n - keep].iter().map(|label| label.len() + 1).sum();
    &host[skipped..]
}

fn is_logout(text: &str, href: Option<&str>) -> bool {
    let text = text.to_lowercase();
    let href = href.unwrap_or_default().to_lowercase();
    LOGOUT_WORDS
        .iter()
        .any(|word| text.contains(word) || href.contains(&word.replace(' ', "")))
}

fn stable_css(element: &ElementRef, tag: &str) -> Option<String> {
    if let Some(id) = element.value().attr("id").filter(|id| SIMPLE_ID.is_match(id)) {
        return Some(format!("#{}", id));
    }
    element
        .value()
        .attr("href")
        .filter(|href| !href.is_empty() && *href != "#")
        .map(|href| format!("{}[href=\"{}\"]", tag, href.replace('\\', "\\\\").replace('"', "\\\"")))
}
