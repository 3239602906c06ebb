use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{info, debug, error};

use crate::extraction::Amount;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub explorer: ExplorerSettings,
    pub oracle: OracleSettings,
    pub browser: BrowserSettings,
    pub extraction: ExtractionSettings,
}

/// Exploration policy knobs
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExplorerSettings {
    /// Maximum number of page loads in one scrape, landing page included
    pub depth_ceiling: u32,
    /// Record confidence that ends exploration early
    pub stop_threshold: u8,
    /// Confidence a strategy must reach to short-circuit the chain
    pub min_strategy_confidence: u8,
    /// Character budget for page content sent to the model
    pub max_prompt_chars: usize,
    /// Options beyond this many (in document order) are not sent for scoring
    pub max_scored_options: usize,
    /// Capture a screenshot for every page instead of only when vision runs
    pub capture_screenshots: bool,
    /// Offer common billing hash routes on single-page apps with no usable links
    pub try_common_routes: bool,
    /// Open collapsed billing and account menus before reading a page's links
    pub expand_menus: bool,
    /// Months of charges that, once the model confirms them on the page,
    /// end exploration even below the stopping threshold
    pub min_history_months: u32,
}

/// Model backend selection
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OracleBackend {
    Ollama,
    #[value(name = "openai")]
    OpenAi,
}

/// Language and vision model settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OracleSettings {
    pub backend: OracleBackend,
    pub base_url: String,
    /// Falls back to OPENAI_API_KEY for the openai backend
    pub api_key: Option<String>,
    pub text_model: String,
    /// Vision extraction is skipped when unset
    pub vision_model: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Browser settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub viewport: Viewport,
    pub page_load_timeout_secs: u64,
    /// Pause after each navigation so client-side rendering can finish
    pub settle_delay_ms: u64,
    /// Replay JSON calls seen in the page's resource timeline
    pub capture_network: bool,
    pub max_network_responses: usize,
    pub max_response_bytes: usize,
}

/// Browser viewport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Sanity bounds applied to extracted values
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionSettings {
    pub min_amount: Amount,
    pub max_amount: Amount,
    pub max_transactions: usize,
    pub max_years_back: i32,
    pub max_years_forward: i32,
    /// Highest confidence the regex fallback may report
    pub fallback_confidence_cap: u8,
}

impl Default for ExplorerSettings {
    fn default() -> Self {
        Self {
            depth_ceiling: 3,
            stop_threshold: 8,
            min_strategy_confidence: 5,
            max_prompt_chars: 15_000,
            max_scored_options: 40,
            capture_screenshots: false,
            try_common_routes: true,
            expand_menus: true,
            min_history_months: 4,
        }
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            backend: OracleBackend::Ollama,
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            text_model: "qwen2.5:latest".to_string(),
            vision_model: Some("qwen2.5vl:7b".to_string()),
            timeout_secs: 120,
            temperature: 0.1,
            max_tokens: 1000,
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            page_load_timeout_secs: 30,
            settle_delay_ms: 1500,
            capture_network: true,
            max_network_responses: 10,
            max_response_bytes: 512 * 1024,
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            min_amount: Amount::from_cents(100),
            max_amount: Amount::from_cents(500_000),
            max_transactions: 50,
            max_years_back: 15,
            max_years_forward: 2,
            fallback_confidence_cap: 3,
        }
    }
}

impl OracleSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key from the profile, or the environment for OpenAI-compatible servers
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| match self.backend {
            OracleBackend::OpenAi => std::env::var("OPENAI_API_KEY").ok(),
            OracleBackend::Ollama => None,
        })
    }
}

impl ExtractionSettings {
    pub fn amount_in_range(&self, amount: Amount) -> bool {
        amount >= self.min_amount && amount <= self.max_amount
    }
}

impl EngineConfig {
    /// Reject settings the explorer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.explorer.depth_ceiling == 0 {
            anyhow::bail!("explorer.depth_ceiling must be at least 1");
        }
        for (name, value) in [
            ("explorer.stop_threshold", self.explorer.stop_threshold),
            ("explorer.min_strategy_confidence", self.explorer.min_strategy_confidence),
            ("extraction.fallback_confidence_cap", self.extraction.fallback_confidence_cap),
        ] {
            if !(1..=10).contains(&value) {
                anyhow::bail!("{} must be between 1 and 10, got {}", name, value);
            }
        }
        if self.explorer.min_history_months == 0 {
            anyhow::bail!("explorer.min_history_months must be at least 1");
        }
        if self.oracle.timeout_secs == 0 {
            anyhow::bail!("oracle.timeout_secs must be greater than zero");
        }
        if self.extraction.min_amount > self.extraction.max_amount {
            anyhow::bail!(
                "extraction.min_amount ({}) exceeds extraction.max_amount ({})",
                self.extraction.min_amount,
                self.extraction.max_amount
            );
        }
        Ok(())
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "bill-navigator", "bill-navigator") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load the default configuration, writing one out on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a per-site configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Profile if given, otherwise the default configuration
    pub fn resolve(profile: Option<&str>) -> Result<Self> {
        match profile {
            Some(name) => Self::load_profile(name)
                .context(format!("Failed to load profile: {}", name)),
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration as a site profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available site profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.explorer.depth_ceiling, 3);
        assert_eq!(config.explorer.stop_threshold, 8);
        assert_eq!(config.explorer.min_strategy_confidence, 5);
        assert_eq!(config.extraction.fallback_confidence_cap, 3);
        assert!(config.explorer.expand_menus);
        assert_eq!(config.explorer.min_history_months, 4);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
explorer:
  depth_ceiling: 5
oracle:
  backend: openai
  base_url: http://localhost:8000/v1
extraction:
  max_amount: "2500.00"
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.explorer.depth_ceiling, 5);
        assert_eq!(config.explorer.stop_threshold, 8);
        assert_eq!(config.oracle.backend, OracleBackend::OpenAi);
        assert_eq!(config.oracle.text_model, "qwen2.5:latest");
        assert_eq!(config.extraction.max_amount, Amount::from_cents(250_000));
    }

    #[test]
    fn test_validate_rejects_bad_knobs() {
        let mut config = EngineConfig::default();
        config.explorer.depth_ceiling = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.explorer.stop_threshold = 11;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.extraction.min_amount = Amount::from_cents(10_000_000);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.explorer.min_history_months = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = EngineConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back = EngineConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back.oracle.vision_model, config.oracle.vision_model);
        assert_eq!(back.extraction.min_amount, config.extraction.min_amount);
    }
}
