//! Navigation and billing-data extraction for authenticated utility portals.
//!
//! [`explorer::run_scrape`] drives a [`browser::PageSession`] from its landing
//! page towards billing data, asking language models which page it is on and
//! which link to follow, and returns the best [`extraction::BillingRecord`] found.

pub mod browser;
pub mod cli;
pub mod error;
pub mod explorer;
pub mod extraction;
pub mod oracle;
pub mod page;
pub mod prompts;
pub mod utils;
