//! Model backends

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ContextError, Result};

/// Prompt sent to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// Backend output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
}

/// A callable model
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

/// OpenAI-compatible `/chat/completions` client
pub struct HttpChatBackend {
    client: Client,
    name: String,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
    max_retries: u32,
}

impl HttpChatBackend {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContextError::Configuration(format!("model client: {}", e)))?;
        Ok(Self {
            client,
            name: name.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            max_retries: 2,
        })
    }

    /// Transport-level attempts for network errors and 5xx responses
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    async fn send_once(&self, body: &ChatCompletionRequest<'_>) -> std::result::Result<ModelResponse, (bool, String)> {
        let mut req = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let response = req.send().await.map_err(|e| (true, format!("network error: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err((status.is_server_error(), format!("HTTP {}: {}", status, text)));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| (false, format!("failed to parse response: {}", e)))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| (false, "no choices in response".to_string()))?;

        Ok(ModelResponse {
            text: choice.message.content,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            prompt_tokens: parsed.usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens: parsed.usage.as_ref().map(|u| u.completion_tokens),
        })
    }
}

#[async_trait]
impl ModelBackend for HttpChatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
        };

        let mut last_error = String::from("no attempts made");
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} for {}", attempt, self.name);
                tokio::time::sleep(Duration::from_millis(100 * (1 << attempt))).await;
            }
            match self.send_once(&body).await {
                Ok(response) => return Ok(response),
                Err((retryable, message)) => {
                    last_error = message;
                    if !retryable {
                        break;
                    }
                }
            }
        }

        warn!("Invocation of {} failed: {}", self.name, last_error);
        Err(ContextError::ModelInvocation(format!("{}: {}", self.name, last_error)))
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ModelRequest {
        ModelRequest {
            system: "sys".to_string(),
            prompt: "Outline Q3".to_string(),
            max_tokens: 64,
            temperature: 0.2,
        }
    }

    #[tokio::test]
    async fn test_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"model":"gpt-x","choices":[{"message":{"role":"assistant","content":"Q3 revenue was $12M [F1]."}}],"usage":{"prompt_tokens":12,"completion_tokens":8}}"#,
            )
            .create_async()
            .await;

        let backend = HttpChatBackend::new(
            "fast",
            format!("{}/v1/chat/completions", server.url()),
            "gpt-x",
            Some(SecretString::new("sk-test".to_string())),
            Duration::from_secs(5),
        )
        .unwrap();

        let response = backend.invoke(&request()).await.unwrap();
        assert_eq!(response.text, "Q3 revenue was $12M [F1].");
        assert_eq!(response.completion_tokens, Some(8));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let backend = HttpChatBackend::new(
            "fast",
            format!("{}/v1/chat/completions", server.url()),
            "gpt-x",
            None,
            Duration::from_secs(5),
        )
        .unwrap()
        .with_max_retries(3);

        let err = backend.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, ContextError::ModelInvocation(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let backend = HttpChatBackend::new(
            "fast",
            format!("{}/v1/chat/completions", server.url()),
            "gpt-x",
            None,
            Duration::from_secs(5),
        )
        .unwrap()
        .with_max_retries(2);

        assert!(backend.invoke(&request()).await.is_err());
        mock.assert_async().await;
    }
}
