use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::config::OracleSettings;
use crate::error::OracleError;
use crate::oracle::{TextOracle, VisionOracle};

/// Chat completion request.
#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: MessageContent,
}

/// Message content (string or array).
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Content part for multimodal messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Client for OpenAI-compatible chat completion servers (vLLM, LM Studio,
/// llama.cpp server, hosted APIs).
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(settings: &OracleSettings, model: &str) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| OracleError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.resolved_api_key(),
            model: model.to_string(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, content: MessageContent, json_mode: bool) -> Result<String, OracleError> {
        let request = ApiRequest {
            model: &self.model,
            messages: vec![ApiMessage { role: "user", content }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: json_mode.then_some(ResponseFormat { format_type: "json_object" }),
        };

        debug!("Chat completion with {}", self.model);
        let response = self
            .authorized(self.client.post(format!("{}/chat/completions", self.base_url)))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status { status: status.as_u16(), body });
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("unexpected completion response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| OracleError::Malformed("completion had no content".to_string()))
    }

    /// Model ids the server exposes.
    pub async fn list_models(&self) -> Result<Vec<String>, OracleError> {
        let response = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Status { status: status.as_u16(), body });
        }
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| OracleError::Malformed(format!("unexpected model list: {}", e)))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl TextOracle for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        self.send(MessageContent::Text(prompt.to_string()), true).await
    }
}

#[async_trait]
impl VisionOracle for OpenAiClient {
    async fn complete_with_image(&self, prompt: &str, png: &[u8]) -> Result<String, OracleError> {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: prompt.to_string() },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/png;base64,{}", STANDARD.encode(png)),
                },
            },
        ]);
        // Not every vision server accepts response_format
        self.send(content, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::OracleBackend;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: &str) -> OracleSettings {
        OracleSettings {
            backend: OracleBackend::OpenAi,
            base_url: base_url.to_string(),
            api_key: Some("test-key".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_complete_uses_json_mode_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"scores\": []}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&settings(&server.uri()), "gpt-4o-mini").unwrap();
        assert_eq!(client.complete("score these").await.unwrap(), "{\"scores\": []}");
    }

    #[tokio::test]
    async fn test_vision_sends_data_uri() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "messages": [{"role": "user", "content": [
                    {"type": "text", "text": "find the bill"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBORw=="}}
                ]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "{}"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&settings(&server.uri()), "gpt-4o").unwrap();
        let png = [0x89, b'P', b'N', b'G'];
        assert_eq!(client.complete_with_image("find the bill", &png).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_empty_choices_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(&settings(&server.uri()), "gpt-4o-mini").unwrap();
        assert!(matches!(client.complete("x").await, Err(OracleError::Malformed(_))));
    }
}
