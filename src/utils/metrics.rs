use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::error::OracleError;

/// Per-scrape counters shared by every component of one run
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    /// Start time of the run
    pub start_time: DateTime<Utc>,

    /// Pages loaded, landing page included
    pub page_loads: usize,

    /// Load durations in milliseconds, keyed by URL
    pub page_load_durations: HashMap<String, Vec<u64>>,

    /// Navigation actions that failed
    pub navigation_failures: usize,

    /// Model calls per component ("classifier", "scorer", "vision")
    pub oracle_calls: HashMap<String, OracleStats>,

    /// Times a component fell back to its heuristic
    pub fallbacks: HashMap<String, usize>,

    /// Strategy that produced each accepted record
    pub strategy_hits: HashMap<String, usize>,
}

/// Model call counters for one component
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct OracleStats {
    pub calls: usize,
    pub failures: usize,
    pub timeouts: usize,
    pub total_ms: u64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record a page load
    pub async fn record_page_load(&self, url: &str, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        metrics.page_loads += 1;
        metrics.page_load_durations
            .entry(url.to_string())
            .or_default()
            .push(duration_ms);
    }

    /// Record a failed navigation attempt
    pub async fn record_navigation_failure(&self) {
        self.metrics.lock().await.navigation_failures += 1;
    }

    /// Record the outcome of one model call
    pub async fn record_oracle_call<T>(&self, component: &str, outcome: &Result<T, OracleError>, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        let stats = metrics.oracle_calls.entry(component.to_string()).or_default();

        stats.calls += 1;
        stats.total_ms += duration_ms;
        match outcome {
            Ok(_) => {}
            Err(OracleError::Timeout(_)) => {
                stats.failures += 1;
                stats.timeouts += 1;
            }
            Err(_) => stats.failures += 1,
        }
    }

    /// Record a heuristic fallback taken by a component
    pub async fn record_fallback(&self, component: &str) {
        *self.metrics.lock().await.fallbacks.entry(component.to_string()).or_default() += 1;
    }

    /// Record the strategy behind an accepted extraction
    pub async fn record_strategy(&self, strategy: &str) {
        *self.metrics.lock().await.strategy_hits.entry(strategy.to_string()).or_default() += 1;
    }

    /// Start timing an operation
    pub fn start_timer(&self) -> CallTimer {
        CallTimer {
            start: Instant::now(),
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Wall time since the run started, in milliseconds
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.start_time).num_milliseconds()
    }

    pub fn total_oracle_failures(&self) -> usize {
        self.oracle_calls.values().map(|s| s.failures).sum()
    }
}

/// Timer for measuring call durations
pub struct CallTimer {
    /// Start time of the call
    start: Instant,
}

impl CallTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_counts_accumulate_across_clones() {
        let metrics = MetricsCollector::new();
        let shared = metrics.clone();

        metrics.record_page_load("https://portal.example.com", 120).await;
        shared.record_page_load("https://portal.example.com/bills", 80).await;
        shared.record_navigation_failure().await;
        metrics.record_oracle_call("classifier", &Ok::<_, OracleError>(()), 30).await;
        metrics.record_oracle_call::<()>("classifier", &Err(OracleError::Timeout(Duration::from_secs(1))), 1000).await;
        metrics.record_oracle_call::<()>("scorer", &Err(OracleError::Malformed("x".into())), 5).await;
        shared.record_fallback("scorer").await;
        shared.record_strategy("html").await;

        let snapshot = metrics.get_metrics().await;
        assert_eq!(snapshot.page_loads, 2);
        assert_eq!(snapshot.navigation_failures, 1);
        assert_eq!(
            snapshot.oracle_calls["classifier"],
            OracleStats { calls: 2, failures: 1, timeouts: 1, total_ms: 1030 }
        );
        assert_eq!(snapshot.total_oracle_failures(), 2);
        assert_eq!(snapshot.fallbacks["scorer"], 1);
        assert_eq!(snapshot.strategy_hits["html"], 1);
    }
}
