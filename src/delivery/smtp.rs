//! SMTP delivery via lettre.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, header};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use super::{DeliveryProvider, OutboundEmail};
use crate::error::DeliveryError;

const PROVIDER: &str = "smtp";

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let host = lookup("EMAIL_SMTP_HOST").filter(|h| !h.trim().is_empty())?;

        let port: u16 = lookup("EMAIL_SMTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = lookup("EMAIL_SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(lookup("EMAIL_SMTP_PASSWORD").unwrap_or_default());

        Some(Self {
            host,
            port,
            username,
            password,
        })
    }
}

/// Sends multipart (text + HTML) messages through an SMTP relay.
pub struct SmtpProvider {
    transport: SmtpTransport,
    domain: String,
}

impl SmtpProvider {
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| transport_error(format!("SMTP relay error: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            transport,
            domain: config.host.clone(),
        })
    }
}

fn transport_error(reason: String) -> DeliveryError {
    DeliveryError::Transport {
        provider: PROVIDER.to_string(),
        reason,
    }
}

/// Build the MIME message for `email` with the given `Message-ID`.
fn build_message(email: &OutboundEmail, message_id: &str) -> Result<Message, DeliveryError> {
    let from: Mailbox = email
        .from
        .parse()
        .map_err(|e| DeliveryError::InvalidAddress(format!("{}: {e}", email.from)))?;
    let to: Mailbox = email
        .to
        .parse()
        .map_err(|e| DeliveryError::InvalidAddress(format!("{}: {e}", email.to)))?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(email.subject.clone())
        .message_id(Some(message_id.to_string()));

    for tag in &email.tags {
        builder = builder.raw_header(header::HeaderValue::new(
            header::HeaderName::new_from_ascii(format!("X-Mailroom-{}", tag.name))
                .map_err(|e| transport_error(format!("Invalid tag header: {e}")))?,
            tag.value.clone(),
        ));
    }

    builder
        .multipart(MultiPart::alternative_plain_html(
            email.text.clone(),
            email.html.clone(),
        ))
        .map_err(|e| transport_error(format!("Failed to build email: {e}")))
}

#[async_trait]
impl DeliveryProvider for SmtpProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, DeliveryError> {
        let message_id = format!("<{}@{}>", uuid::Uuid::new_v4(), self.domain);
        let message = build_message(email, &message_id)?;
        let transport = self.transport.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| transport_error(format!("SMTP task failed: {e}")))?
            .map_err(|e| transport_error(format!("SMTP send failed: {e}")))?;

        Ok(message_id)
    }
}
