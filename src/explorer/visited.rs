use std::collections::HashSet;
use tracing::debug;
use url::Url;

/// Pages already seen during one scrape.
///
/// A page counts as seen only when both its normalized URL and its visible
/// content have been seen before, so client-side route changes that keep
/// the URL still register as new pages.
#[derive(Debug, Default)]
pub struct VisitedSet {
    /// Normalized URLs in visit order
    order: Vec<String>,
    urls: HashSet<String>,
    contents: HashSet<u64>,
    /// Targets already attempted, successful or not
    attempted: HashSet<String>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a landed page. Returns `false` if it was already visited.
    pub fn insert(&mut self, url: &str, content_hash: u64) -> bool {
        let normalized = normalize_url(url);
        let new_url = self.urls.insert(normalized.clone());
        let new_content = self.contents.insert(content_hash);

        if new_url || new_content {
            self.attempted.insert(normalized.clone());
            self.order.push(normalized);
            true
        } else {
            debug!("Already visited: {}", normalized);
            false
        }
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.urls.contains(&normalize_url(url))
    }

    /// Remember a navigation target so it is never retried.
    ///
    /// Returns `false` if the target had been attempted before.
    pub fn mark_attempted(&mut self, key: &str) -> bool {
        self.attempted.insert(key.to_string())
    }

    pub fn was_attempted(&self, key: &str) -> bool {
        self.attempted.contains(key)
    }

    /// Visited URLs in visit order.
    pub fn urls(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Normalize a URL so trivially different spellings compare equal.
///
/// Hash routes (`#/billing`, `#!/billing`) address distinct views in
/// single-page apps and are kept; plain anchors are dropped.
pub fn normalize_url(url: &str) -> String {
    let mut normalized = match Url::parse(url.trim()) {
        Ok(url) => url,
        Err(_) => return url.trim().to_string(),
    };

    // Remove default ports
    if let Some(port) = normalized.port() {
        if (normalized.scheme() == "http" && port == 80)
            || (normalized.scheme() == "https" && port == 443)
        {
            let _ = normalized.set_port(None);
        }
    }

    // Remove trailing slash from non-root paths
    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(path.trim_end_matches('/'));
    }

    // Sort query parameters if present
    if let Some(query) = normalized.query() {
        if query.is_empty() {
            normalized.set_query(None);
        } else {
            let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
            params.sort_by_key(|pair| pair.split('=').next().unwrap_or_default());
            let sorted = params.join("&");
            normalized.set_query(Some(&sorted));
        }
    }

    let keep_fragment = normalized
        .fragment()
        .map_or(false, |f| f.starts_with('/') || f.starts_with("!/"));
    if !keep_fragment {
        normalized.set_fragment(None);
    }

    let mut result = normalized.to_string();
    if normalized.path() == "/" && normalized.query().is_none() && normalized.fragment().is_none() {
        result.pop();
    }
    result
}
