//! Text-generation backends.
//!
//! - **OpenAI**: hosted API via rig-core
//! - **Ollama**: local `/api/generate` over reqwest

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;
use secrecy::ExposeSecret;
use serde::Deserialize;

use super::prompt::SYSTEM_PREAMBLE;
use crate::config::BackendConfig;
use crate::error::BackendError;

/// Sampling temperature for every backend.
pub const TEMPERATURE: f64 = 0.5;

/// Response token cap for hosted backends.
pub const MAX_RESPONSE_TOKENS: u64 = 300;

/// Anything that turns a prompt into text.
#[async_trait]
pub trait SummaryBackend: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;
}

/// Build the configured backend. Selection happens once, here.
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn SummaryBackend>, BackendError> {
    match config {
        BackendConfig::OpenAi { api_key, model } => {
            tracing::info!("Using OpenAI (model: {})", model);
            Ok(Arc::new(OpenAiBackend::new(api_key, model)?))
        }
        BackendConfig::Ollama { base_url, model } => {
            tracing::info!("Using Ollama at {} (model: {})", base_url, model);
            Ok(Arc::new(OllamaBackend::new(base_url, model)))
        }
    }
}

// ── OpenAI ──────────────────────────────────────────────────────────

pub struct OpenAiBackend {
    client: rig::client::Client<openai::client::OpenAIResponsesExt>,
    model: String,
}

impl OpenAiBackend {
    pub fn new(api_key: &secrecy::SecretString, model: &str) -> Result<Self, BackendError> {
        let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
            openai::Client::new(api_key.expose_secret()).map_err(|e| {
                BackendError::RequestFailed {
                    provider: "openai".to_string(),
                    reason: format!("Failed to create OpenAI client: {}", e),
                }
            })?;
        Ok(Self {
            client,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl SummaryBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(SYSTEM_PREAMBLE)
            .temperature(TEMPERATURE)
            .max_tokens(MAX_RESPONSE_TOKENS)
            .build();

        agent
            .prompt(prompt)
            .await
            .map_err(|e| BackendError::RequestFailed {
                provider: "openai".to_string(),
                reason: e.to_string(),
            })
    }
}

// ── Ollama ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl SummaryBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": TEMPERATURE },
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    tracing::error!(
                        "Cannot connect to Ollama at {}. Is Ollama running? (ollama serve)",
                        self.base_url
                    );
                    BackendError::Unavailable {
                        provider: "ollama".to_string(),
                        url: self.base_url.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    BackendError::RequestFailed {
                        provider: "ollama".to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                provider: "ollama".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| BackendError::InvalidResponse {
                    provider: "ollama".to_string(),
                    reason: e.to_string(),
                })?;

        parsed.response.ok_or_else(|| BackendError::InvalidResponse {
            provider: "ollama".to_string(),
            reason: "missing 'response' field".to_string(),
        })
    }
}
