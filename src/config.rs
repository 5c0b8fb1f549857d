//! Configuration types.
//!
//! Everything is read from the environment once at startup. Optional
//! values fall back to defaults; malformed values are errors.

use std::time::Duration;

use secrecy::SecretString;

use crate::delivery::{DEFAULT_BLOCKED_PATTERNS, DeliveryConfig, SmtpConfig};
use crate::error::ConfigError;
use crate::llm::{LlmConfig, LlmProtocol, ResponderConfig, RetryPolicy};
use crate::pipeline::{DEFAULT_POLL_INTERVAL, OrchestratorConfig};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_DB_PATH: &str = "./data/mailroom.db";
pub const DEFAULT_PORT: u16 = 8080;

/// Per-request HTTP timeout for LLM calls.
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;

/// Full runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub responder: ResponderConfig,
    pub delivery: DeliveryConfig,
    /// Selects the Resend provider when set.
    pub resend_api_key: Option<SecretString>,
    /// SMTP relay, used when no Resend key is configured.
    pub smtp: Option<SmtpConfig>,
    pub orchestrator: OrchestratorConfig,
    pub poll_interval: Duration,
    /// libSQL file path, or `:memory:`.
    pub db_path: String,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("OPENAI_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;
        let model = get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let protocol = LlmProtocol::resolve(&model, get("LLM_PROTOCOL").as_deref())?;
        let base_url = get("OPENAI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            // total calls, the first one included
            max_attempts: parse_or(&get, "LLM_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            base_delay: Duration::from_millis(parse_or(
                &get,
                "LLM_RETRY_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
            max_delay: defaults.max_delay,
        };

        let llm = LlmConfig {
            protocol,
            api_key: SecretString::from(api_key),
            model,
            base_url,
            request_timeout: Duration::from_secs(parse_or(
                &get,
                "LLM_TIMEOUT_SECS",
                DEFAULT_LLM_TIMEOUT_SECS,
            )?),
            retry,
        };

        let responder_defaults = ResponderConfig::default();
        let responder = ResponderConfig {
            system_prompt: get("OPENAI_SYSTEM_PROMPT"),
            max_tokens: parse_or(&get, "OPENAI_MAX_TOKENS", responder_defaults.max_tokens)?,
            structured_output: parse_flag(&get, "OPENAI_STRUCTURED_OUTPUT")?,
        };

        let delivery_defaults = DeliveryConfig::default();
        let mut blocked_patterns: Vec<String> = DEFAULT_BLOCKED_PATTERNS
            .iter()
            .map(|s| s.to_string())
            .collect();
        for pattern in split_list(get("EMAIL_BLOCKED_DOMAINS")) {
            if !blocked_patterns.contains(&pattern) {
                blocked_patterns.push(pattern);
            }
        }
        let delivery = DeliveryConfig {
            enabled: parse_flag(&get, "EMAIL_SENDING_ENABLED")?,
            test_mode: parse_flag(&get, "EMAIL_TEST_MODE")?,
            from_address: get("EMAIL_FROM_ADDRESS").unwrap_or(delivery_defaults.from_address),
            brand_name: get("EMAIL_BRAND_NAME").unwrap_or(delivery_defaults.brand_name),
            allowed_domains: split_list(get("EMAIL_ALLOWED_DOMAINS")),
            blocked_patterns,
        };

        let orchestrator = OrchestratorConfig {
            record_delay: Duration::from_millis(parse_or(
                &get,
                "QUEUE_RECORD_DELAY_MS",
                OrchestratorConfig::default().record_delay.as_millis() as u64,
            )?),
        };

        let poll_secs = parse_or(&get, "POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL.as_secs())?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLL_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            llm,
            responder,
            delivery,
            resend_api_key: get("RESEND_API_KEY").map(SecretString::from),
            smtp: SmtpConfig::from_lookup(&get),
            orchestrator,
            poll_interval: Duration::from_secs(poll_secs),
            db_path: get("MAILROOM_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            port: parse_or(&get, "MAILROOM_PORT", DEFAULT_PORT)?,
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool, ConfigError> {
    let Some(raw) = get(key) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{other}' is not a boolean"),
        }),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_with_only_api_key() {
        let config = load(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.llm.api_key.expose_secret(), "sk-test");
        assert_eq!(config.llm.model, DEFAULT_MODEL);
        assert_eq!(config.llm.protocol, LlmProtocol::ChatCompletions);
        assert_eq!(config.llm.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.llm.retry, RetryPolicy::default());
        assert_eq!(config.responder.max_tokens, 1000);
        assert!(!config.responder.structured_output);
        assert!(!config.delivery.enabled);
        assert!(!config.delivery.test_mode);
        assert!(config.delivery.allowed_domains.is_empty());
        assert!(config.delivery.blocked_patterns.contains(&"noreply".to_string()));
        assert!(config.resend_api_key.is_none());
        assert!(config.smtp.is_none());
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.orchestrator.record_delay, Duration::from_millis(2000));
        assert_eq!(config.db_path, DEFAULT_DB_PATH);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let err = load(&[("OPENAI_MODEL", "gpt-4o")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "OPENAI_API_KEY"));

        let err = load(&[("OPENAI_API_KEY", "  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn protocol_inferred_or_explicit() {
        let config = load(&[("OPENAI_API_KEY", "k"), ("OPENAI_MODEL", "gpt-5-mini")]).unwrap();
        assert_eq!(config.llm.protocol, LlmProtocol::Responses);

        let err = load(&[("OPENAI_API_KEY", "k"), ("OPENAI_MODEL", "llama-3-70b")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModelProtocol { .. }));

        let config = load(&[
            ("OPENAI_API_KEY", "k"),
            ("OPENAI_MODEL", "llama-3-70b"),
            ("LLM_PROTOCOL", "chat"),
        ])
        .unwrap();
        assert_eq!(config.llm.protocol, LlmProtocol::ChatCompletions);
    }

    #[test]
    fn delivery_settings_parsed() {
        let config = load(&[
            ("OPENAI_API_KEY", "k"),
            ("EMAIL_SENDING_ENABLED", "true"),
            ("EMAIL_TEST_MODE", "1"),
            ("EMAIL_ALLOWED_DOMAINS", "Acme.com, @partner.io ,"),
            ("EMAIL_BLOCKED_DOMAINS", "spam.example, noreply"),
            ("EMAIL_FROM_ADDRESS", "Bot <bot@acme.com>"),
            ("RESEND_API_KEY", "re_123"),
            ("EMAIL_SMTP_HOST", "smtp.acme.com"),
        ])
        .unwrap();
        assert!(config.delivery.enabled);
        assert!(config.delivery.test_mode);
        assert_eq!(config.delivery.allowed_domains, vec!["acme.com", "@partner.io"]);
        let blocked = &config.delivery.blocked_patterns;
        assert!(blocked.contains(&"spam.example".to_string()));
        assert_eq!(blocked.iter().filter(|p| *p == "noreply").count(), 1);
        assert_eq!(config.delivery.from_address, "Bot <bot@acme.com>");
        assert_eq!(config.delivery.brand_name, "Mission Control");
        assert!(config.resend_api_key.is_some());
        assert_eq!(config.smtp.unwrap().host, "smtp.acme.com");
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = load(&[("OPENAI_API_KEY", "k"), ("OPENAI_MAX_TOKENS", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "OPENAI_MAX_TOKENS"));

        let err = load(&[("OPENAI_API_KEY", "k"), ("EMAIL_TEST_MODE", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "EMAIL_TEST_MODE"));

        let err = load(&[("OPENAI_API_KEY", "k"), ("POLL_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "POLL_INTERVAL_SECS"));
    }

    #[test]
    fn retry_and_timing_overrides() {
        let config = load(&[
            ("OPENAI_API_KEY", "k"),
            ("OPENAI_BASE_URL", "http://127.0.0.1:9000/"),
            ("LLM_MAX_ATTEMPTS", "5"),
            ("LLM_RETRY_BASE_MS", "250"),
            ("QUEUE_RECORD_DELAY_MS", "0"),
            ("POLL_INTERVAL_SECS", "5"),
            ("MAILROOM_DB_PATH", ":memory:"),
        ])
        .unwrap();
        assert_eq!(config.llm.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.llm.retry.max_attempts, 5);
        assert_eq!(config.llm.retry.base_delay, Duration::from_millis(250));
        assert!(config.orchestrator.record_delay.is_zero());
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.db_path, ":memory:");
    }

    #[test]
    fn attempt_bound_counts_the_first_call() {
        let config = load(&[("OPENAI_API_KEY", "k")]).unwrap();
        assert_eq!(config.llm.retry.max_attempts, RetryPolicy::default().max_attempts);

        let once = load(&[("OPENAI_API_KEY", "k"), ("LLM_MAX_ATTEMPTS", "0")]).unwrap();
        assert_eq!(once.llm.retry.max_attempts, 1);
        // the old name is not read
        let legacy = load(&[("OPENAI_API_KEY", "k"), ("LLM_MAX_RETRIES", "9")]).unwrap();
        assert_eq!(legacy.llm.retry.max_attempts, RetryPolicy::default().max_attempts);
    }
}
