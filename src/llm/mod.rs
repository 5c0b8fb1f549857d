//! LLM integration for Mailroom.
//!
//! Two wire protocols sit behind the [`LlmProvider`] trait:
//! - **Chat completions**: `gpt-4*` and `gpt-3.5*` models
//! - **Responses**: `gpt-5*` and the `o1`/`o3`/`o4` reasoning models
//!
//! The protocol is chosen explicitly through [`LlmProtocol`]. An
//! unrecognized model name is a configuration error, never a guess.

pub mod chat;
pub mod costs;
pub mod provider;
pub mod responder;
pub mod responses;
pub mod retry;
mod transport;

pub use chat::ChatCompletionsClient;
pub use costs::calculate_cost;
pub use provider::*;
pub use responder::{EmailResponder, EmailResponse, ResponderConfig};
pub use responses::ResponsesClient;
pub use retry::RetryPolicy;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// Wire protocol spoken to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProtocol {
    ChatCompletions,
    Responses,
}

impl LlmProtocol {
    /// Infer the protocol from a model name prefix.
    pub fn for_model(model: &str) -> Result<Self, ConfigError> {
        let name = model.trim().to_ascii_lowercase();
        if ["gpt-5", "o1", "o3", "o4"]
            .iter()
            .any(|p| name.starts_with(p))
        {
            Ok(Self::Responses)
        } else if ["gpt-4", "gpt-3.5"].iter().any(|p| name.starts_with(p)) {
            Ok(Self::ChatCompletions)
        } else {
            Err(ConfigError::UnknownModelProtocol {
                model: model.to_string(),
            })
        }
    }

    /// An explicit setting wins over inference.
    pub fn resolve(model: &str, explicit: Option<&str>) -> Result<Self, ConfigError> {
        match explicit.map(str::trim).filter(|s| !s.is_empty()) {
            Some(value) => value.parse(),
            None => Self::for_model(model),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat",
            Self::Responses => "responses",
        }
    }
}

impl FromStr for LlmProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "chat_completions" | "chat-completions" => Ok(Self::ChatCompletions),
            "responses" => Ok(Self::Responses),
            other => Err(ConfigError::InvalidValue {
                key: "LLM_PROTOCOL".to_string(),
                message: format!("expected 'chat' or 'responses', got '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for LlmProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub protocol: LlmProtocol,
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let provider: Arc<dyn LlmProvider> = match config.protocol {
        LlmProtocol::ChatCompletions => Arc::new(ChatCompletionsClient::new(config.clone())?),
        LlmProtocol::Responses => Arc::new(ResponsesClient::new(config.clone())?),
    };
    tracing::info!(
        "Using OpenAI {} protocol (model: {})",
        config.protocol,
        config.model
    );
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_inferred_from_model_prefix() {
        for model in ["gpt-5", "gpt-5-mini", "o1-preview", "o3-mini", "o4-mini", "GPT-5"] {
            assert_eq!(LlmProtocol::for_model(model).unwrap(), LlmProtocol::Responses, "{model}");
        }
        for model in ["gpt-4o-mini", "gpt-4.1", "gpt-4-turbo", "gpt-3.5-turbo"] {
            assert_eq!(
                LlmProtocol::for_model(model).unwrap(),
                LlmProtocol::ChatCompletions,
                "{model}"
            );
        }
    }

    #[test]
    fn unknown_model_fails_fast() {
        let err = LlmProtocol::for_model("llama-3-70b").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModelProtocol { ref model } if model == "llama-3-70b"));
    }

    #[test]
    fn explicit_protocol_overrides_inference() {
        assert_eq!(
            LlmProtocol::resolve("llama-3-70b", Some("chat")).unwrap(),
            LlmProtocol::ChatCompletions
        );
        assert_eq!(
            LlmProtocol::resolve("gpt-4o", Some("responses")).unwrap(),
            LlmProtocol::Responses
        );
        assert_eq!(
            LlmProtocol::resolve("gpt-4o", Some("  ")).unwrap(),
            LlmProtocol::ChatCompletions
        );
        assert!(LlmProtocol::resolve("gpt-4o", Some("grpc")).is_err());
    }

    #[test]
    fn create_provider_reports_model() {
        let config = LlmConfig {
            protocol: LlmProtocol::Responses,
            api_key: secrecy::SecretString::from("sk-test"),
            model: "gpt-5-mini".into(),
            base_url: "http://127.0.0.1:9".into(),
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "gpt-5-mini");
    }
}
