use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::browser::{StaticSite, WebDriverSession};
use crate::cli::config::EngineConfig;
use crate::cli::Overrides;
use crate::explorer::{run_scrape, Engine, PageReport, ScrapeOutcome};
use crate::extraction::BillingRecord;
use crate::oracle::{build_oracles, check_backend};
use crate::page::text::truncate_chars;
use crate::prompts::{get_prompt, list_prompts};

/// Arguments of the `scrape` command
pub struct ScrapeArgs {
    pub url: String,
    pub user_data_dir: Option<String>,
    pub login_wait: Option<u64>,
    pub output: Option<PathBuf>,
    pub screenshots: bool,
    pub overrides: Overrides,
}

/// Load the selected profile and apply command line overrides
fn load_config(overrides: &Overrides) -> Result<EngineConfig> {
    let mut config = EngineConfig::resolve(overrides.profile.as_deref())?;

    if let Some(depth) = overrides.depth {
        config.explorer.depth_ceiling = depth;
    }
    if let Some(threshold) = overrides.stop_threshold {
        config.explorer.stop_threshold = threshold;
    }
    if let Some(url) = &overrides.oracle_url {
        config.oracle.base_url = url.clone();
    }
    if let Some(model) = &overrides.model {
        config.oracle.text_model = model.clone();
    }
    if let Some(model) = &overrides.vision_model {
        config.oracle.vision_model = Some(model.clone());
    }
    if let Some(headless) = overrides.headless {
        config.browser.headless = headless;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Explore a live portal and report what was found
pub async fn scrape(args: ScrapeArgs) -> Result<()> {
    let mut config = load_config(&args.overrides)?;
    if args.screenshots {
        config.explorer.capture_screenshots = true;
    }

    let oracles = build_oracles(&config.oracle).context("Failed to set up model clients")?;
    let engine = Engine::new(&config, oracles);

    let mut session = WebDriverSession::connect(config.browser.clone(), args.user_data_dir.as_deref()).await?;
    let login_wait = args.login_wait.map(Duration::from_secs);

    // The browser is closed whether or not the run succeeds
    let result = match session.open_landing(&args.url, login_wait).await {
        Ok(()) => run_scrape(&mut session, &engine).await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    session.close().await?;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Scrape of {} aborted: {}", args.url, e);
            return Err(e);
        }
    };

    print!("{}", render_outcome(&outcome));

    if let Some(path) = args.output {
        let json = serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?;
        fs::write(&path, json).context(format!("Failed to write {}", path.display()))?;
        info!("Outcome written to: {}", path.display());
    }

    Ok(())
}

/// Run classification, extraction and scoring on a saved page
pub async fn analyze(html_file: PathBuf, url: String, overrides: Overrides) -> Result<()> {
    let config = load_config(&overrides)?;
    let html = fs::read_to_string(&html_file)
        .context(format!("Failed to read {}", html_file.display()))?;

    let oracles = build_oracles(&config.oracle).context("Failed to set up model clients")?;
    let engine = Engine::new(&config, oracles);
    let site = StaticSite::new(&url).page(&url, html);

    let report = engine.analyze(&site).await?;
    print!("{}", render_report(&report));
    Ok(())
}

/// Verify the model server answers and serves the configured models
pub async fn check_oracle(overrides: Overrides) -> Result<()> {
    let config = load_config(&overrides)?;
    let status = check_backend(&config.oracle)
        .await
        .context(format!("Model server at {} is not reachable", config.oracle.base_url))?;

    println!("Model server: {} ({:?})", config.oracle.base_url, config.oracle.backend);
    println!("Available models: {}", status.available.join(", "));

    if status.missing.is_empty() {
        println!("All configured models are available");
    } else {
        for model in &status.missing {
            warn!("Configured model '{}' is not served", model);
            println!("Missing model: {}", model);
        }
        anyhow::bail!("{} configured model(s) missing", status.missing.len());
    }

    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = EngineConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from the defaults if it does not exist
pub fn manage_profile(profile_name: String) -> Result<()> {
    match EngineConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = EngineConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = EngineConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}

/// List the prompt templates, or print the named one
pub fn prompts(name: Option<&str>) -> Result<()> {
    print!("{}", render_prompts(name)?);
    Ok(())
}

/// Template listing, or one template in full when `name` is given
pub fn render_prompts(name: Option<&str>) -> Result<String> {
    let mut out = String::new();
    match name {
        Some(name) => {
            let Some(prompt) = get_prompt(name) else {
                let known: Vec<&str> = list_prompts().iter().map(|t| t.name).collect();
                anyhow::bail!("Unknown prompt '{}'. Available: {}", name, known.join(", "));
            };
            let _ = writeln!(out, "# {}: {}\n", prompt.name, prompt.description);
            let _ = writeln!(out, "{}", prompt.template);
        }
        None => {
            let _ = writeln!(out, "Prompt templates:");
            for prompt in list_prompts() {
                let _ = writeln!(out, "  {:<28}{}", prompt.name, prompt.description);
            }
        }
    }
    Ok(out)
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

fn render_record(out: &mut String, record: &BillingRecord) {
    let rows = [
        ("Current amount", or_dash(record.current_amount.map(|a| format!("${}", a)))),
        ("Current period", or_dash(record.current_period.clone())),
        ("Previous amount", or_dash(record.previous_amount.map(|a| format!("${}", a)))),
        ("Previous period", or_dash(record.previous_period.clone())),
        ("Due date", or_dash(record.due_date.map(|d| d.to_string()))),
        ("Account number", or_dash(record.account_number.clone())),
        ("Source", record.source_strategy.to_string()),
        ("Confidence", format!("{}/10", record.confidence)),
    ];
    for (label, value) in rows {
        let _ = writeln!(out, "  {:<18}{}", label, value);
    }

    if !record.transactions.is_empty() {
        let _ = writeln!(out, "\n  {:<12}{:<36}{:>12}{:>12}", "Date", "Description", "Amount", "Balance");
        for tx in &record.transactions {
            let _ = writeln!(
                out,
                "  {:<12}{:<36}{:>12}{:>12}",
                tx.date.to_string(),
                truncate_chars(&tx.description, 34),
                tx.amount.to_string(),
                or_dash(tx.balance.map(|b| b.to_string()))
            );
        }
    }
}

/// Fixed-width summary of a scrape
pub fn render_outcome(outcome: &ScrapeOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Termination: {}", outcome.terminated_reason);
    let _ = writeln!(out, "Pages visited: {}", outcome.pages_visited);
    for url in &outcome.visited_urls {
        let _ = writeln!(out, "  - {}", url);
    }

    match &outcome.billing_record {
        Some(record) => {
            let _ = writeln!(out, "\nBilling record:");
            render_record(&mut out, record);
        }
        None => {
            let _ = writeln!(out, "\nNo billing data found");
        }
    }
    out
}

/// Fixed-width summary of a single-page analysis
pub fn render_report(report: &PageReport) -> String {
    let mut out = String::new();
    let c = &report.classification;
    let _ = writeln!(out, "Page: {}", report.url);
    let _ = writeln!(
        out,
        "Classification: {:?} (billing data: {}, confidence {}, action {:?})",
        c.page_type, c.has_billing_data, c.confidence, c.recommended_action
    );
    if let Some(reasoning) = &c.reasoning {
        let _ = writeln!(out, "  {}", reasoning);
    }

    match &report.record {
        Some(record) => {
            let _ = writeln!(out, "\nBilling record:");
            render_record(&mut out, record);
        }
        None => {
            let _ = writeln!(out, "\nNo billing data found");
        }
    }
    if let Some(history) = &report.history {
        let _ = writeln!(
            out,
            "\nHistory: {} month(s), {:?}, sufficient: {}{}",
            history.months_found,
            history.data_quality,
            history.sufficient,
            if history.degraded { " (model unavailable)" } else { "" }
        );
    }

    let _ = writeln!(out, "\nNavigation options ({}):", report.options.len());
    for option in &report.options {
        let _ = writeln!(
            out,
            "  {:>2}  {:<40}{}",
            option.relevance_score,
            truncate_chars(&option.text, 38),
            option.destination.as_deref().unwrap_or("(click)")
        );
    }
    out
}
