use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::config::OracleSettings;
use crate::error::OracleError;
use crate::oracle::{TextOracle, VisionOracle};

/// Chat request for Ollama's `/api/chat`.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: ChatOptions,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
    /// Base64 images for multimodal models
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Client for a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OllamaClient {
    pub fn new(settings: &OracleSettings, model: &str) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| OracleError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, prompt: &str, images: Vec<String>) -> Result<String, OracleError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
                images,
            }],
            stream: false,
            format: Some("json"),
            options: ChatOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        debug!("Ollama chat with {} ({} prompt chars)", self.model, prompt.len());
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status { status: status.as_u16(), body });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("unexpected chat response: {}", e)))?;
        Ok(parsed.message.content)
    }

    /// Names of the models the server has pulled.
    pub async fn list_models(&self) -> Result<Vec<String>, OracleError> {
        let response = self.client.get(format!("{}/api/tags", self.base_url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status { status: status.as_u16(), body });
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("unexpected tags response: {}", e)))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl TextOracle for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        self.chat(prompt, Vec::new()).await
    }
}

#[async_trait]
impl VisionOracle for OllamaClient {
    async fn complete_with_image(&self, prompt: &str, png: &[u8]) -> Result<String, OracleError> {
        self.chat(prompt, vec![STANDARD.encode(png)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: &str) -> OracleSettings {
        OracleSettings {
            base_url: base_url.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_complete_posts_chat_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({
                "model": "qwen2.5:latest",
                "stream": false,
                "format": "json"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "qwen2.5:latest",
                "message": {"role": "assistant", "content": "{\"page_type\": \"billing\"}"},
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(&settings(&server.uri()), "qwen2.5:latest").unwrap();
        let reply = client.complete("classify").await.unwrap();
        assert_eq!(reply, "{\"page_type\": \"billing\"}");
    }

    #[tokio::test]
    async fn test_vision_sends_base64_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({
                "messages": [{"role": "user", "content": "look", "images": ["iVBORw=="]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "{}"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(&settings(&server.uri()), "qwen2.5vl:7b").unwrap();
        let png = [0x89, b'P', b'N', b'G'];
        assert_eq!(client.complete_with_image("look", &png).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&settings(&server.uri()), "missing").unwrap();
        match client.complete("x").await {
            Err(OracleError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "model not found");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "qwen2.5:latest"}, {"name": "qwen2.5vl:7b"}]
            })))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&settings(&server.uri()), "qwen2.5:latest").unwrap();
        assert_eq!(client.list_models().await.unwrap(), vec!["qwen2.5:latest", "qwen2.5vl:7b"]);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let client = OllamaClient::new(&settings("http://127.0.0.1:9"), "qwen2.5:latest").unwrap();
        assert!(matches!(
            client.complete("x").await,
            Err(OracleError::Unreachable(_)) | Err(OracleError::Timeout(_))
        ));
    }
}
