//! Completion-service contract consumed by every agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use leadflow_core::config::LlmConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Failure of a completion call.
///
/// `Unreachable` covers transport problems (connect, timeout); `Service` is a
/// well-formed error answer from the provider.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("completion service unreachable: {0}")]
    Unreachable(String),
    #[error("completion service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("completion service returned an unreadable response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Model parameters applied to every request an agent issues.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionSettings {
    pub fn request(
        &self,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> CompletionRequest {
        CompletionRequest {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self { model: "llama3.1".to_string(), temperature: 0.7, max_tokens: 2000 }
    }
}

impl From<&LlmConfig> for CompletionSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionSettings, TokenUsage};

    #[test]
    fn token_usage_totals_prompt_and_completion() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(TokenUsage::new(u64::MAX, 1).total_tokens, u64::MAX);
    }

    #[test]
    fn settings_stamp_model_parameters_on_requests() {
        let settings =
            CompletionSettings { model: "gpt-4o-mini".to_string(), temperature: 0.2, max_tokens: 64 };

        let request = settings.request("system", "user");

        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.max_tokens, 64);
        assert_eq!(request.system_prompt, "system");
        assert_eq!(request.user_prompt, "user");
    }
}
