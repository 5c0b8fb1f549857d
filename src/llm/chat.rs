//! Legacy chat-completions protocol (`/v1/chat/completions`).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::LlmConfig;
use super::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, TokenUsage};
use super::retry::with_retry;
use super::transport::post_json;
use crate::error::{ConfigError, LlmError};

const PROVIDER: &str = "openai-chat";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Client for models served over chat completions (`gpt-4*`, `gpt-3.5*`).
pub struct ChatCompletionsClient {
    client: Client,
    config: LlmConfig,
}

impl ChatCompletionsClient {
    pub fn new(config: LlmConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "OPENAI_BASE_URL".to_string(),
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = build_request(&self.config.model, request);
        let response: ChatCompletionResponse =
            post_json(&self.client, &self.url(), &self.config.api_key, PROVIDER, &body).await?;
        into_completion(response, &self.config.model)
    }
}

fn build_request<'a>(model: &'a str, request: &'a CompletionRequest) -> ChatCompletionRequest<'a> {
    ChatCompletionRequest {
        model,
        messages: &request.messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        response_format: request.json_output.then_some(ResponseFormat {
            kind: "json_object",
        }),
    }
}

fn into_completion(
    response: ChatCompletionResponse,
    configured_model: &str,
) -> Result<CompletionResponse, LlmError> {
    let choice = response.choices.into_iter().next();
    let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
    let content = choice
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| LlmError::EmptyResponse {
            provider: PROVIDER.to_string(),
            reason: format!(
                "no message content (finish_reason: {})",
                finish_reason.as_deref().unwrap_or("none")
            ),
        })?;

    let usage = response.usage.unwrap_or_default();
    debug!(
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "chat completion parsed"
    );

    Ok(CompletionResponse {
        content,
        usage: TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
        model: response.model.unwrap_or_else(|| configured_model.to_string()),
        response_id: response.id,
    })
}

#[async_trait]
impl LlmProvider for ChatCompletionsClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        with_retry(&self.config.retry, PROVIDER, || self.send_once(&request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmErrorKind;

    fn parse(json: &str) -> Result<CompletionResponse, LlmError> {
        into_completion(serde_json::from_str(json).unwrap(), "gpt-4o-mini")
    }

    #[test]
    fn request_body_shape() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("You answer email."),
            ChatMessage::user("Hello"),
        ])
        .with_max_tokens(1000)
        .with_json_output(true);

        let body = serde_json::to_value(build_request("gpt-4o", &request)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn plain_request_has_no_response_format() {
        let request = CompletionRequest::new(vec![ChatMessage::user("Hi")]);
        let body = serde_json::to_value(build_request("gpt-4o", &request)).unwrap();
        assert!(body.get("response_format").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn parses_content_and_usage() {
        let out = parse(
            r#"{"id":"chatcmpl-1","model":"gpt-4o-mini-2024-07-18",
                "choices":[{"message":{"role":"assistant","content":"Hi there"},"finish_reason":"stop"}],
                "usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#,
        )
        .unwrap();
        assert_eq!(out.content, "Hi there");
        assert_eq!(out.usage, TokenUsage::new(12, 3));
        assert_eq!(out.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(out.response_id.as_deref(), Some("chatcmpl-1"));
    }

    #[test]
    fn missing_model_falls_back_to_configured() {
        let out = parse(r#"{"choices":[{"message":{"content":"ok"}}]}"#).unwrap();
        assert_eq!(out.model, "gpt-4o-mini");
        assert_eq!(out.usage, TokenUsage::default());
    }

    #[test]
    fn empty_content_is_empty_response() {
        for json in [
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{"content":null},"finish_reason":"length"}]}"#,
            r#"{"choices":[{"message":{"content":"   "}}]}"#,
        ] {
            assert_eq!(parse(json).unwrap_err().kind(), LlmErrorKind::EmptyResponse);
        }
    }
}
