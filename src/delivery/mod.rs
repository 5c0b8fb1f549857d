//! Outbound delivery of generated replies.
//!
//! The [`DeliveryGateway`] applies the feature flag, recipient policy,
//! template choice and test mode, then hands a fully rendered
//! [`OutboundEmail`] to a [`DeliveryProvider`].

pub mod gateway;
pub mod resend;
pub mod smtp;

pub use gateway::{
    DEFAULT_BLOCKED_PATTERNS, DeliveryConfig, DeliveryGateway, DeliveryResult, extract_address,
    is_domain_allowed, reply_subject, select_template,
};
pub use resend::ResendProvider;
pub use smtp::{SmtpConfig, SmtpProvider};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::DeliveryError;

/// Opaque name/value pair the provider echoes back in its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailTag {
    pub name: String,
    pub value: String,
}

impl EmailTag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A rendered message ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub tags: Vec<EmailTag>,
}

/// A transport that can transmit an [`OutboundEmail`].
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Send the message, returning the provider-assigned message id.
    async fn send(&self, email: &OutboundEmail) -> Result<String, DeliveryError>;
}
