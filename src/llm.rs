//! Text-generation service client.
//!
//! The rest of the system only needs "send (system instructions, user content),
//! get back text", so that is the whole trait. The concrete client speaks the
//! OpenAI-compatible chat-completions shape over reqwest.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmConfig;
use crate::retry::{Classify, FailureClass};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("generation service rejected the credentials")]
    Auth,
    #[error("generation service rejected the request: {0}")]
    InvalidRequest(String),
    #[error("generation service rate limit hit")]
    RateLimited,
    #[error("generation service error ({0})")]
    Server(StatusCode),
    #[error("network error talking to the generation service: {0}")]
    Network(#[from] reqwest::Error),
    #[error("generation service returned an empty completion")]
    EmptyCompletion,
}

impl Classify for LlmError {
    fn class(&self) -> FailureClass {
        match self {
            LlmError::Auth | LlmError::InvalidRequest(_) => FailureClass::Permanent,
            LlmError::RateLimited
            | LlmError::Server(_)
            | LlmError::Network(_)
            | LlmError::EmptyCompletion => FailureClass::Transient,
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

/// Shared generation client. Constructed once at startup and passed around by
/// reference (`reqwest::Client` is internally reference-counted, so clones are
/// cheap); there is no hidden global instance.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

impl LlmClient {
    pub fn new(cfg: &LlmConfig) -> Self {
        Self::with_model(cfg, cfg.model.clone())
    }

    /// Same endpoint and credentials, different model. The forum host often
    /// runs on a heavier model than the research agents.
    pub fn with_model(cfg: &LlmConfig, model: String) -> Self {
        LlmClient {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key(),
            model,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
        }
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            top_p: self.top_p,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth,
                StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited,
                s if s.is_server_error() => LlmError::Server(s),
                s => LlmError::InvalidRequest(s.to_string()),
            });
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyCompletion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_bad_request_are_permanent() {
        assert_eq!(LlmError::Auth.class(), FailureClass::Permanent);
        assert_eq!(
            LlmError::InvalidRequest("404".into()).class(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        assert_eq!(LlmError::RateLimited.class(), FailureClass::Transient);
        assert_eq!(
            LlmError::Server(StatusCode::BAD_GATEWAY).class(),
            FailureClass::Transient
        );
        assert_eq!(LlmError::EmptyCompletion.class(), FailureClass::Transient);
    }

    #[test]
    fn response_shape_parses() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "hello"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello");
    }
}
