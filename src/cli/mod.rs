pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "billnav", author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explore a logged-in utility portal and extract billing data
    Scrape {
        /// Landing page of the portal
        #[arg(required = true)]
        url: String,

        /// Browser profile directory that already holds the portal login
        #[arg(long)]
        user_data_dir: Option<String>,

        /// Seconds to wait for a manual login before exploring
        #[arg(long)]
        login_wait: Option<u64>,

        /// Write the outcome as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Capture a screenshot of every page
        #[arg(long)]
        screenshots: bool,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Classify, extract and score a saved page without a browser
    Analyze {
        /// Saved HTML file
        #[arg(required = true)]
        html_file: PathBuf,

        /// URL the page was saved from
        #[arg(short, long, default_value = "https://portal.example.com/")]
        url: String,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Check that the model server is reachable and serves the configured models
    CheckOracle {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },

    /// List the model prompt templates, or print one in full
    Prompts {
        /// Template name
        name: Option<String>,
    },
}

/// Settings that can be overridden per run
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Configuration profile to use instead of the default
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Maximum number of pages to load, landing page included
    #[arg(short, long)]
    pub depth: Option<u32>,

    /// Confidence (1-10) at which exploration stops
    #[arg(long)]
    pub stop_threshold: Option<u8>,

    /// Base URL of the model server
    #[arg(long)]
    pub oracle_url: Option<String>,

    /// Text model name
    #[arg(long)]
    pub model: Option<String>,

    /// Vision model name
    #[arg(long)]
    pub vision_model: Option<String>,

    /// Run the browser without a window
    #[arg(long)]
    pub headless: Option<bool>,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Scrape { url, user_data_dir, login_wait, output, screenshots, overrides } => {
            info!("Starting scrape of {}", url);
            commands::scrape(commands::ScrapeArgs {
                url,
                user_data_dir,
                login_wait,
                output,
                screenshots,
                overrides,
            })
            .await
        }
        Commands::Analyze { html_file, url, overrides } => {
            info!("Analyzing saved page {}", html_file.display());
            commands::analyze(html_file, url, overrides).await
        }
        Commands::CheckOracle { overrides } => {
            info!("Checking model server");
            commands::check_oracle(overrides).await
        }
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
            }
        }
        Commands::Prompts { name } => commands::prompts(name.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_scrape_flags() {
        let cli = Cli::try_parse_from([
            "billnav", "--verbose", "scrape", "https://portal.example.com",
            "--depth", "5", "--login-wait", "60", "--headless", "false",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Scrape { url, login_wait, overrides, .. } => {
                assert_eq!(url, "https://portal.example.com");
                assert_eq!(login_wait, Some(60));
                assert_eq!(overrides.depth, Some(5));
                assert_eq!(overrides.headless, Some(false));
            }
            _ => panic!("expected scrape"),
        }
    }

    #[test]
    fn test_prompts_command() {
        let cli = Cli::try_parse_from(["billnav", "prompts", "html_extraction"]).unwrap();
        assert!(matches!(cli.command, Commands::Prompts { name: Some(ref n) } if n == "html_extraction"));

        let cli = Cli::try_parse_from(["billnav", "prompts"]).unwrap();
        assert!(matches!(cli.command, Commands::Prompts { name: None }));
    }
}
