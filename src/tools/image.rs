use super::ToolError;
use crate::config::{ApiConfig, LiveConfig};
use crate::protocol::Content;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// One-shot still image generation from a text prompt.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Returns a URL the UI can display (usually a `data:` URL).
    async fn generate(&self, prompt: &str) -> Result<String, ToolError>;
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

pub struct GeminiImageGenerator {
    client: Client,
    api: Arc<ApiConfig>,
    base_url: String,
    model: String,
}

impl GeminiImageGenerator {
    pub fn new(api: Arc<ApiConfig>, config: &LiveConfig) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api,
            base_url: config.image_api_base.trim_end_matches('/').to_string(),
            model: config.image_model.clone(),
        })
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ToolError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] }
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api.gemini_key())
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Image request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ToolError::ExecutionFailed(format!(
                "Image API error {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Bad image response: {}", e)))?;

        first_image_url(body)
            .ok_or_else(|| ToolError::ExecutionFailed("The model returned no image".to_string()))
    }
}

fn first_image_url(body: GenerateContentResponse) -> Option<String> {
    body.candidates
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .find_map(|part| part.inline_data)
        .map(|inline| {
            let mime = inline.mime_type.unwrap_or_else(|| "image/png".to_string());
            format!("data:{};base64,{}", mime, inline.data)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_inline_part_becomes_data_url() {
        let body: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here you go"},
                    {"inlineData": {"mimeType": "image/jpeg", "data": "QUJD"}}
                ]}
            }]
        }))
        .unwrap();

        assert_eq!(
            first_image_url(body).as_deref(),
            Some("data:image/jpeg;base64,QUJD")
        );
    }

    #[test]
    fn test_text_only_response_has_no_image() {
        let body: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "I can't draw that"}]}}]
        }))
        .unwrap();
        assert!(first_image_url(body).is_none());
    }

    #[cfg(feature = "test-api")]
    #[tokio::test]
    async fn test_generate_with_real_api() {
        let api = match crate::config::load_config() {
            Ok(api) => Arc::new(api),
            Err(_) => return,
        };
        let generator = GeminiImageGenerator::new(api, &LiveConfig::default()).unwrap();
        let url = generator.generate("a smiling cartoon sun").await.unwrap();
        assert!(url.starts_with("data:image/"));
    }
}
