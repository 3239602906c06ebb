pub mod json;
pub mod ollama;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::{OracleBackend, OracleSettings};
use crate::error::OracleError;

// Re-export common types
pub use json::extract_json;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

/// A language model answering a text prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextOracle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError>;
}

/// A vision-capable model answering a prompt about a PNG image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisionOracle: Send + Sync {
    async fn complete_with_image(&self, prompt: &str, png: &[u8]) -> Result<String, OracleError>;
}

/// Run one model call under a hard deadline.
///
/// There is no retry: a timeout is reported like any other oracle failure.
pub async fn bounded<F>(limit: Duration, call: F) -> Result<String, OracleError>
where
    F: Future<Output = Result<String, OracleError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(OracleError::Timeout(limit)),
    }
}

/// Text and vision oracles for the configured backend.
pub struct Oracles {
    pub text: Arc<dyn TextOracle>,
    pub vision: Option<Arc<dyn VisionOracle>>,
}

/// Build the configured model clients.
pub fn build_oracles(settings: &OracleSettings) -> Result<Oracles> {
    let oracles = match settings.backend {
        OracleBackend::Ollama => Oracles {
            text: Arc::new(OllamaClient::new(settings, &settings.text_model)?),
            vision: match &settings.vision_model {
                Some(model) => Some(Arc::new(OllamaClient::new(settings, model)?) as Arc<dyn VisionOracle>),
                None => None,
            },
        },
        OracleBackend::OpenAi => Oracles {
            text: Arc::new(OpenAiClient::new(settings, &settings.text_model)?),
            vision: match &settings.vision_model {
                Some(model) => Some(Arc::new(OpenAiClient::new(settings, model)?) as Arc<dyn VisionOracle>),
                None => None,
            },
        },
    };
    Ok(oracles)
}

/// Result of probing the model server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    /// Models the server reports
    pub available: Vec<String>,
    /// Configured models the server does not list
    pub missing: Vec<String>,
}

/// Check that the model server answers and serves the configured models.
pub async fn check_backend(settings: &OracleSettings) -> Result<BackendStatus> {
    let available = match settings.backend {
        OracleBackend::Ollama => OllamaClient::new(settings, &settings.text_model)?.list_models().await?,
        OracleBackend::OpenAi => OpenAiClient::new(settings, &settings.text_model)?.list_models().await?,
    };

    let missing = std::iter::once(&settings.text_model)
        .chain(settings.vision_model.iter())
        .filter(|model| !model_listed(&available, model))
        .cloned()
        .collect();

    Ok(BackendStatus { available, missing })
}

/// Ollama lists `name:tag`; a bare `name` means `name:latest`.
fn model_listed(available: &[String], wanted: &str) -> bool {
    available.iter().any(|name| {
        name == wanted
            || name.strip_suffix(":latest") == Some(wanted)
            || wanted.strip_suffix(":latest") == Some(name.as_str())
    })
}
