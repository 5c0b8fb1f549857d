//! Resend transactional email API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{DeliveryProvider, EmailTag, OutboundEmail};
use crate::error::DeliveryError;

pub const RESEND_API_URL: &str = "https://api.resend.com";

const PROVIDER: &str = "resend";

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tags: &'a [EmailTag],
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Sends through `POST /emails`.
pub struct ResendProvider {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl ResendProvider {
    pub fn new(api_key: SecretString) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DeliveryError::Transport {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key,
            base_url: RESEND_API_URL.to_string(),
        })
    }

    /// Point at a different API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl DeliveryProvider for ResendProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, DeliveryError> {
        let url = format!("{}/emails", self.base_url.trim_end_matches('/'));
        let body = SendRequest {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
            tags: &email.tags,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to send request: {e}"),
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let reason = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.message)
                .unwrap_or(text);
            return Err(DeliveryError::Rejected {
                provider: PROVIDER.to_string(),
                status: status.as_u16(),
                reason,
            });
        }

        serde_json::from_str::<SendResponse>(&text)
            .ok()
            .and_then(|r| r.id)
            .ok_or_else(|| DeliveryError::Transport {
                provider: PROVIDER.to_string(),
                reason: format!("response carried no message id: {text}"),
            })
    }
}
