use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{debug, warn};

use crate::browser::PageSession;
use crate::error::SessionError;
use crate::page::text::{page_title, visible_text};

/// A response the browser received while the page was loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub url: String,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub body: String,
}

impl NetworkResponse {
    pub fn looks_like_json(&self) -> bool {
        let declared = self
            .content_type
            .as_deref()
            .map_or(false, |ct| ct.to_ascii_lowercase().contains("json"));
        let trimmed = self.body.trim_start();
        declared || trimmed.starts_with('{') || trimmed.starts_with('[')
    }
}

/// Immutable capture of one exploration step.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    /// Position in the exploration, starting at 1 for the landing page
    pub id: u32,
    pub url: String,
    pub html: String,
    pub title: Option<String>,
    /// Visible text with script/style content removed
    pub text: String,
    pub screenshot: Option<Vec<u8>>,
    pub network: Vec<NetworkResponse>,
    pub captured_at: DateTime<Utc>,
}

impl PageSnapshot {
    pub fn new(id: u32, url: impl Into<String>, html: impl Into<String>) -> Self {
        let html = html.into();
        Self {
            id,
            url: url.into(),
            text: visible_text(&html),
            title: page_title(&html),
            html,
            screenshot: None,
            network: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn with_screenshot(mut self, png: Vec<u8>) -> Self {
        self.screenshot = Some(png);
        self
    }

    pub fn with_network(mut self, network: Vec<NetworkResponse>) -> Self {
        self.network = network;
        self
    }

    /// Capture the page the session is currently showing.
    ///
    /// Only the URL and source are required; a failed screenshot or network
    /// read degrades the snapshot unless the session itself is gone.
    pub async fn capture(
        session: &dyn PageSession,
        id: u32,
        with_screenshot: bool,
    ) -> Result<Self, SessionError> {
        let url = session.current_url().await?;
        let html = session.page_source().await?;
        let mut snapshot = Self::new(id, url, html);

        match session.network_responses().await {
            Ok(network) => snapshot.network = network,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Network log unavailable for {}: {}", snapshot.url, e),
        }

        if with_screenshot {
            match session.screenshot().await {
                Ok(png) => snapshot.screenshot = Some(png),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Screenshot unavailable for {}: {}", snapshot.url, e),
            }
        }

        debug!(
            "Captured page {} ({} chars of text, {} network responses)",
            snapshot.url,
            snapshot.text.len(),
            snapshot.network.len()
        );
        Ok(snapshot)
    }

    /// Fingerprint of the visible text, used to spot client-side route changes
    /// that keep the same URL.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.text.hash(&mut hasher);
        hasher.finish()
    }
}
