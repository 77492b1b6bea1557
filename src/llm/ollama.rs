//! Ollama HTTP backend.
//!
//! Primary path is the chat endpoint. Older Ollama builds answer 404 there,
//! so the client falls back to the generate endpoint with a flattened
//! transcript prompt.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::error::LlmError;
use crate::llm::{ChatRole, CompletionRequest, CompletionResponse, LlmClient};

pub struct OllamaClient {
    http: reqwest::Client,
    settings: LlmSettings,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    message: ChatApiMessage,
}

#[derive(Deserialize)]
struct ChatApiMessage {
    content: String,
}

#[derive(Deserialize)]
struct GenerateApiResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn options(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut options = json!({
            "temperature": request.temperature.unwrap_or(self.settings.temperature),
        });
        if let Some(max_tokens) = request.max_tokens.or(self.settings.max_tokens) {
            options["num_predict"] = json!(max_tokens);
        }
        options
    }

    async fn chat(&self, request: &CompletionRequest) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/chat", self.settings.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.settings.model,
            "messages": request.messages,
            "stream": false,
            "options": self.options(request),
        });
        self.http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(format!("POST {url}: {e}")))
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!(
            "{}/api/generate",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.settings.model,
            "prompt": flatten_transcript(request),
            "stream": false,
            "options": self.options(request),
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(format!("POST {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(LlmError::RequestFailed(format!(
                "POST {url}: status {}",
                response.status()
            )));
        }

        let parsed: GenerateApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("generate body: {e}")))?;
        Ok(CompletionResponse {
            content: parsed.response.trim().to_string(),
        })
    }
}

/// Flatten a chat transcript into a single prompt for the generate endpoint.
fn flatten_transcript(request: &CompletionRequest) -> String {
    let mut prompt = String::new();
    for message in &request.messages {
        let role = match message.role {
            ChatRole::System => "System",
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        };
        prompt.push_str(role);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = self.chat(request).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!("Chat endpoint unavailable, falling back to generate");
            return self.generate(request).await;
        }
        if !response.status().is_success() {
            return Err(LlmError::RequestFailed(format!(
                "Chat request failed with status {}",
                response.status()
            )));
        }

        let parsed: ChatApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("chat body: {e}")))?;
        debug!(
            model = %self.settings.model,
            chars = parsed.message.content.len(),
            "Completion received"
        );
        Ok(CompletionResponse {
            content: parsed.message.content.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[test]
    fn transcript_flattens_roles_in_order() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("rules"),
            ChatMessage::user("question"),
            ChatMessage::assistant("earlier answer"),
        ]);
        let prompt = flatten_transcript(&request);
        assert_eq!(
            prompt,
            "System: rules\nUser: question\nAssistant: earlier answer\nAssistant:"
        );
    }

    #[test]
    fn options_prefer_request_overrides() {
        let client = OllamaClient::new(LlmSettings {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            confidence_marker: "MANAGER".to_string(),
            temperature: 0.2,
            max_tokens: Some(256),
        });
        let request = CompletionRequest::new(vec![]).with_temperature(0.7);
        let options = client.options(&request);
        assert_eq!(options["temperature"], 0.7);
        assert_eq!(options["num_predict"], 256);
    }
}
