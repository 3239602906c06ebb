use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::explorer::visited::VisitedSet;
use crate::extraction::BillingRecord;
use crate::utils::Metrics;

/// Why an exploration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    HighConfidenceFound,
    DepthExceeded,
    NoNavigationOptions,
    NavigationFailedRepeatedly,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::HighConfidenceFound => "high_confidence_found",
            TerminationReason::DepthExceeded => "depth_exceeded",
            TerminationReason::NoNavigationOptions => "no_navigation_options",
            TerminationReason::NavigationFailedRepeatedly => "navigation_failed_repeatedly",
        };
        f.write_str(text)
    }
}

/// Mutable state of one scrape, owned by the controller.
#[derive(Debug, Default)]
pub struct ExplorationState {
    pub visited: VisitedSet,
    /// Pages loaded so far, landing page included
    pub depth: u32,
    pub best_result: Option<BillingRecord>,
    pub terminated_reason: Option<TerminationReason>,
}

impl ExplorationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `record` if it beats the best so far. Ties keep the earlier one.
    pub fn offer(&mut self, record: BillingRecord) -> bool {
        let better = self
            .best_result
            .as_ref()
            .map_or(true, |best| record.confidence > best.confidence);
        if better {
            debug!(
                "New best result from {} (confidence {})",
                record.source_strategy, record.confidence
            );
            self.best_result = Some(record);
        }
        better
    }

    pub fn best_confidence(&self) -> u8 {
        self.best_result.as_ref().map_or(0, |r| r.confidence)
    }

    pub fn finish(mut self, reason: TerminationReason, metrics: Metrics) -> ScrapeOutcome {
        self.terminated_reason = Some(reason);
        ScrapeOutcome {
            billing_record: self.best_result,
            pages_visited: self.visited.len(),
            terminated_reason: reason,
            visited_urls: self.visited.urls().to_vec(),
            metrics,
        }
    }
}

/// What `run_scrape` hands back to its caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub billing_record: Option<BillingRecord>,
    pub pages_visited: usize,
    pub terminated_reason: TerminationReason,
    pub visited_urls: Vec<String>,
    pub metrics: Metrics,
}
