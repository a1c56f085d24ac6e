//! LLM service access.
//!
//! Everything that talks to a language model goes through the `LlmBackend`
//! trait so the generation pipeline and chat can run against the SOP LLM
//! service in production and against a scripted backend in tests.

mod client;
mod fact_check;

pub use client::SopLlmClient;
pub use fact_check::{FactCheckResult, NEUTRAL_CONFIDENCE, fact_check};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM service unreachable: {0}")]
    Unavailable(String),
    #[error("LLM request timed out")]
    Timeout,
    #[error("LLM service rate limit exceeded")]
    RateLimited(Option<u64>),
    #[error("LLM service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("LLM task failed: {0}")]
    TaskFailed(String),
    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Unavailable(_) | LlmError::Timeout | LlmError::RateLimited(_) => true,
            LlmError::Http { status, .. } => *status >= 500,
            LlmError::TaskFailed(_) | LlmError::InvalidResponse(_) => false,
        }
    }
}

/// One completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Structured output format, see `json_schema_format`
    pub response_format: Option<serde_json::Value>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            temperature: 0.7,
            max_tokens: 2000,
            response_format: None,
        }
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn json_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_format = Some(json_schema_format(schema));
        self
    }
}

/// Wraps a JSON schema in the service's structured output envelope
pub fn json_schema_format(schema: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "type": "json_schema",
        "json_schema": {
            "name": "response",
            "schema": schema,
        },
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: String,
}

/// A language model service
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Runs one completion
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Embeds each text, returning one vector per input in order
    async fn embed(&self, texts: Vec<String>, model: &str) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Whether the service answers its health check
    async fn health(&self) -> bool;

    /// Models the service currently offers, as reported by it
    async fn list_models(&self) -> Vec<serde_json::Value>;
}
