pub mod controller;
pub mod state;
pub mod visited;

// Re-export common types
pub use controller::{run_scrape, Engine, PageReport};
pub use state::{ExplorationState, ScrapeOutcome, TerminationReason};
pub use visited::{normalize_url, VisitedSet};
