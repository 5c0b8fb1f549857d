//! Responses protocol (`/v1/responses`) used by reasoning-era models.
//!
//! System messages travel as `instructions`; the rest go in `input`. Text
//! comes back either as the `output_text` convenience field or nested in
//! `output[].content[]` items of type `output_text`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::LlmConfig;
use super::provider::{CompletionRequest, CompletionResponse, LlmProvider, Role, TokenUsage};
use super::retry::with_retry;
use super::transport::post_json;
use crate::error::{ConfigError, LlmError};

const PROVIDER: &str = "openai-responses";

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    input: Vec<InputMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextOptions>,
}

#[derive(Debug, Serialize)]
struct InputMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct TextOptions {
    format: TextFormat,
}

#[derive(Debug, Serialize)]
struct TextFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    id: Option<String>,
    model: Option<String>,
    status: Option<String>,
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Client for models served over the responses API (`gpt-5*`, `o1`/`o3`/`o4`).
pub struct ResponsesClient {
    client: Client,
    config: LlmConfig,
}

impl ResponsesClient {
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
        format!("{}/v1/responses", self.config.base_url.trim_end_matches('/'))
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = build_request(&self.config.model, request);
        let response: ResponsesResponse =
            post_json(&self.client, &self.url(), &self.config.api_key, PROVIDER, &body).await?;
        into_completion(response, &self.config.model)
    }
}

fn build_request<'a>(model: &'a str, request: &'a CompletionRequest) -> ResponsesRequest<'a> {
    ResponsesRequest {
        model,
        instructions: request.system_prompt(),
        input: request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| InputMessage {
                role: m.role,
                content: &m.content,
            })
            .collect(),
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        text: request.json_output.then_some(TextOptions {
            format: TextFormat {
                kind: "json_object",
            },
        }),
    }
}

fn extract_text(response: &ResponsesResponse) -> Option<String> {
    if let Some(text) = response
        .output_text
        .as_deref()
        .filter(|t| !t.trim().is_empty())
    {
        return Some(text.to_string());
    }

    let joined: Vec<&str> = response
        .output
        .iter()
        .filter(|item| item.kind == "message")
        .flat_map(|item| item.content.iter())
        .filter(|c| c.kind == "output_text")
        .filter_map(|c| c.text.as_deref())
        .collect();
    let text = joined.join("");
    if text.trim().is_empty() { None } else { Some(text) }
}

fn into_completion(
    response: ResponsesResponse,
    configured_model: &str,
) -> Result<CompletionResponse, LlmError> {
    let content = extract_text(&response).ok_or_else(|| LlmError::EmptyResponse {
        provider: PROVIDER.to_string(),
        reason: format!(
            "no output text (status: {})",
            response.status.as_deref().unwrap_or("unknown")
        ),
    })?;

    let usage = response.usage.unwrap_or_default();
    debug!(
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "responses output parsed"
    );

    Ok(CompletionResponse {
        content,
        usage: TokenUsage::new(usage.input_tokens, usage.output_tokens),
        model: response.model.unwrap_or_else(|| configured_model.to_string()),
        response_id: response.id,
    })
}

#[async_trait]
impl LlmProvider for ResponsesClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        with_retry(&self.config.retry, PROVIDER, || self.send_once(&request)).await
    }
}
