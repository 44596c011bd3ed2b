//! HTTP completion providers.
//!
//! One client speaks the three wire dialects the service can be configured
//! with: OpenAI-compatible chat completions, Anthropic messages and the
//! Ollama chat API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use leadflow_core::config::{LlmConfig, LlmProvider};

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_CHARS: usize = 300;

pub struct HttpLlmClient {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpLlmClient {
    pub fn new(
        provider: LlmProvider,
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| LlmError::Unreachable(error.to_string()))?;

        Ok(Self {
            client,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url =
            config.base_url.as_deref().unwrap_or_else(|| config.provider.default_base_url());
        Self::new(
            config.provider,
            base_url,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LlmProvider::OpenAi => format!("{}/chat/completions", self.base_url),
            LlmProvider::Anthropic => format!("{}/messages", self.base_url),
            LlmProvider::Ollama => format!("{}/api/chat", self.base_url),
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let Some(key) = self.api_key.as_ref() else {
            return builder;
        };
        match self.provider {
            LlmProvider::OpenAi => builder.bearer_auth(key.expose_secret()),
            LlmProvider::Anthropic => builder
                .header("x-api-key", key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
            LlmProvider::Ollama => builder,
        }
    }

    fn body(&self, request: &CompletionRequest) -> Result<Value, LlmError> {
        let body = match self.provider {
            LlmProvider::OpenAi => serde_json::to_value(ChatRequest {
                model: &request.model,
                messages: chat_messages(request),
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            }),
            LlmProvider::Anthropic => serde_json::to_value(AnthropicRequest {
                model: &request.model,
                system: &request.system_prompt,
                messages: vec![ChatMessage { role: "user", content: &request.user_prompt }],
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            }),
            LlmProvider::Ollama => serde_json::to_value(OllamaRequest {
                model: &request.model,
                messages: chat_messages(request),
                stream: false,
                options: OllamaOptions {
                    temperature: request.temperature,
                    num_predict: request.max_tokens,
                },
            }),
        };
        body.map_err(|error| LlmError::InvalidResponse(format!("request encoding: {error}")))
    }

    fn decode(&self, body: &str) -> Result<CompletionResponse, LlmError> {
        let invalid = |error: serde_json::Error| LlmError::InvalidResponse(error.to_string());
        match self.provider {
            LlmProvider::OpenAi => {
                let response: ChatResponse = serde_json::from_str(body).map_err(invalid)?;
                let text = response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .ok_or_else(|| LlmError::InvalidResponse("no choices in response".into()))?;
                let usage = response
                    .usage
                    .map(|usage| TokenUsage::new(usage.prompt_tokens, usage.completion_tokens))
                    .unwrap_or_default();
                Ok(CompletionResponse { text, usage })
            }
            LlmProvider::Anthropic => {
                let response: AnthropicResponse = serde_json::from_str(body).map_err(invalid)?;
                let text: String = response
                    .content
                    .into_iter()
                    .filter(|block| block.kind == "text")
                    .filter_map(|block| block.text)
                    .collect();
                if text.is_empty() {
                    return Err(LlmError::InvalidResponse("no text content in response".into()));
                }
                let usage = response
                    .usage
                    .map(|usage| TokenUsage::new(usage.input_tokens, usage.output_tokens))
                    .unwrap_or_default();
                Ok(CompletionResponse { text, usage })
            }
            LlmProvider::Ollama => {
                let response: OllamaResponse = serde_json::from_str(body).map_err(invalid)?;
                let usage = TokenUsage::new(
                    response.prompt_eval_count.unwrap_or(0),
                    response.eval_count.unwrap_or(0),
                );
                Ok(CompletionResponse { text: response.message.content, usage })
            }
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = self.endpoint();
        let body = self.body(&request)?;
        debug!(
            event_name = "llm.request",
            provider = self.provider.as_str(),
            model = %request.model,
            "sending completion request"
        );

        let response =
            self.authorize(self.client.post(&url)).json(&body).send().await.map_err(|error| {
                if error.is_timeout() {
                    LlmError::Unreachable(format!("request to {url} timed out"))
                } else {
                    LlmError::Unreachable(error.to_string())
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|error| LlmError::Unreachable(error.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::Service {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        self.decode(&text)
    }
}

/// Prefers the provider's `error.message` field and never echoes a whole body.
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        let error = value.get("error")?;
        error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .map(str::to_string)
    });
    let message = from_json.unwrap_or_else(|| body.trim().to_string());
    if message.chars().count() > MAX_ERROR_CHARS {
        let truncated: String = message.chars().take(MAX_ERROR_CHARS).collect();
        format!("{truncated}...")
    } else {
        message
    }
}

fn chat_messages(request: &CompletionRequest) -> Vec<ChatMessage<'_>> {
    let mut messages = Vec::with_capacity(2);
    if !request.system_prompt.is_empty() {
        messages.push(ChatMessage { role: "system", content: &request.system_prompt });
    }
    messages.push(ChatMessage { role: "user", content: &request.user_prompt });
    messages
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use leadflow_core::config::LlmProvider;

    use super::HttpLlmClient;
    use crate::llm::{CompletionRequest, LlmClient, LlmError};

    fn request() -> CompletionRequest {
        CompletionRequest {
            system_prompt: "Você qualifica leads.".to_string(),
            user_prompt: "Fui demitido sem justa causa".to_string(),
            model: "test-model".to_string(),
            temperature: 0.1,
            max_tokens: 256,
        }
    }

    fn client(provider: LlmProvider, base_url: &str, key: Option<&str>) -> HttpLlmClient {
        HttpLlmClient::new(
            provider,
            base_url,
            key.map(|key| key.to_string().into()),
            Duration::from_secs(5),
        )
        .expect("build client")
    }

    #[tokio::test]
    async fn openai_dialect_sends_bearer_and_reads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "test-model", "max_tokens": 256})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\":true}"}}],
                "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
            })))
            .mount(&server)
            .await;

        let client =
            client(LlmProvider::OpenAi, &format!("{}/v1/", server.uri()), Some("sk-test"));
        let response = client.complete(request()).await.expect("completion");

        assert_eq!(response.text, "{\"ok\":true}");
        assert_eq!(response.usage.total_tokens, 25);
    }

    #[tokio::test]
    async fn anthropic_dialect_uses_api_key_header_and_system_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({"system": "Você qualifica leads."})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "olá"}],
                "usage": {"input_tokens": 11, "output_tokens": 4}
            })))
            .mount(&server)
            .await;

        let client =
            client(LlmProvider::Anthropic, &format!("{}/v1", server.uri()), Some("ak-test"));
        let response = client.complete(request()).await.expect("completion");

        assert_eq!(response.text, "olá");
        assert_eq!(response.usage.prompt_tokens, 11);
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn ollama_dialect_disables_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"stream": false, "options": {"num_predict": 256}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "resposta"},
                "prompt_eval_count": 7,
                "eval_count": 3,
                "done": true
            })))
            .mount(&server)
            .await;

        let client = client(LlmProvider::Ollama, &server.uri(), None);
        let response = client.complete(request()).await.expect("completion");

        assert_eq!(response.text, "resposta");
        assert_eq!(response.usage.total_tokens, 10);
    }

    #[tokio::test]
    async fn error_status_maps_to_service_error_with_provider_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "rate limit reached", "type": "requests"}
            })))
            .mount(&server)
            .await;

        let client = client(LlmProvider::OpenAi, &server.uri(), Some("sk-test"));
        let error = client.complete(request()).await.expect_err("429 must fail");

        assert_eq!(
            error,
            LlmError::Service { status: 429, message: "rate limit reached".to_string() }
        );
    }

    #[tokio::test]
    async fn undecodable_body_maps_to_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = client(LlmProvider::Ollama, &server.uri(), None);
        let error = client.complete(request()).await.expect_err("garbage body");

        assert!(matches!(error, LlmError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn closed_port_maps_to_unreachable() {
        let client = client(LlmProvider::Ollama, "http://127.0.0.1:1", None);
        let error = client.complete(request()).await.expect_err("nothing listening");

        assert!(matches!(error, LlmError::Unreachable(_)));
    }
}
