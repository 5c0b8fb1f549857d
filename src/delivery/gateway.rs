//! Pre-send checks, template selection and dispatch.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{DeliveryProvider, EmailTag, OutboundEmail};
use crate::error::DeliveryError;
use crate::pipeline::types::EmailRecord;
use crate::render::{TemplateKind, WrapOptions, contains_table, render_email};

/// Address substrings that never receive replies.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "mailer-daemon",
    "postmaster",
];

// Whole words only, so "costume" or "pricey" never pick a template.
static URGENT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:urgent|urgently|asap|immediately|emergency|critical|time-sensitive|deadlines?)\b",
    )
    .expect("valid regex")
});
static PRICING_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:quotes?|quoted|quotation|pricing|prices?|estimates?|costs?|invoices?)\b|\$\s?\d",
    )
    .expect("valid regex")
});

// ── Configuration ───────────────────────────────────────────────────

/// Delivery settings, built by [`crate::config::AppConfig::from_env`].
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Feature flag. When off, every send is a no-op success.
    pub enabled: bool,
    /// Dry run: everything except transmission.
    pub test_mode: bool,
    pub from_address: String,
    pub brand_name: String,
    /// Empty means every domain is allowed.
    pub allowed_domains: Vec<String>,
    /// Checked before the allow-list.
    pub blocked_patterns: Vec<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            test_mode: false,
            from_address: "assistant@localhost".to_string(),
            brand_name: "Mission Control".to_string(),
            allowed_domains: Vec::new(),
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Outcome of [`DeliveryGateway::send`]. Never an `Err`: delivery failures
/// are recorded, not propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sending is disabled; nothing was attempted.
    pub skipped: bool,
    pub template: TemplateKind,
    pub test_mode: bool,
}

impl DeliveryResult {
    fn skipped() -> Self {
        Self {
            success: true,
            message_id: None,
            error: None,
            skipped: true,
            template: TemplateKind::Standard,
            test_mode: false,
        }
    }

    fn sent(message_id: String, template: TemplateKind, test_mode: bool) -> Self {
        Self {
            success: true,
            message_id: Some(message_id),
            error: None,
            skipped: false,
            template,
            test_mode,
        }
    }

    fn failed(error: &DeliveryError, template: TemplateKind, test_mode: bool) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.to_string()),
            skipped: false,
            template,
            test_mode,
        }
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

/// Sends generated replies back to the original sender.
pub struct DeliveryGateway {
    config: DeliveryConfig,
    provider: Option<Arc<dyn DeliveryProvider>>,
}

impl DeliveryGateway {
    pub fn new(config: DeliveryConfig, provider: Option<Arc<dyn DeliveryProvider>>) -> Self {
        Self { config, provider }
    }

    /// A gateway that never sends.
    pub fn disabled() -> Self {
        Self::new(DeliveryConfig::default(), None)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Resolve the bare recipient address and apply domain policy.
    pub fn check_recipient(&self, raw: &str) -> Result<String, DeliveryError> {
        let address =
            extract_address(raw).ok_or_else(|| DeliveryError::InvalidAddress(raw.to_string()))?;
        let lower = address.to_lowercase();

        if let Some(pattern) = self
            .config
            .blocked_patterns
            .iter()
            .find(|p| !p.is_empty() && lower.contains(&p.to_lowercase()))
        {
            return Err(DeliveryError::PolicyRejected {
                reason: format!("{address} matches blocked pattern '{pattern}'"),
            });
        }

        if !is_domain_allowed(&self.config.allowed_domains, &address) {
            return Err(DeliveryError::PolicyRejected {
                reason: format!("{address} is not in the allowed domains"),
            });
        }

        Ok(address)
    }

    /// Render the reply for `record` without sending it.
    pub fn compose(
        &self,
        record: &EmailRecord,
        to: String,
        response_text: &str,
        template: TemplateKind,
    ) -> OutboundEmail {
        let subject = reply_subject(&record.subject);
        let options = WrapOptions::new(template, subject.clone()).with_brand(&self.config.brand_name);
        let wrapped = render_email(response_text, &options);

        OutboundEmail {
            from: self.config.from_address.clone(),
            to,
            subject,
            html: wrapped.html,
            text: wrapped.text,
            tags: vec![
                EmailTag::new("email_id", tag_value(&record.id)),
                EmailTag::new("template", template.as_str()),
            ],
        }
    }

    /// Template for a reply, honoring an explicit override.
    pub fn template_for(
        record: &EmailRecord,
        response_text: &str,
        template_override: Option<TemplateKind>,
    ) -> TemplateKind {
        template_override.unwrap_or_else(|| {
            select_template(&record.subject, &format!("{}\n{}", record.body, response_text))
        })
    }

    /// Send `response_text` as a reply to `record`.
    pub async fn send(
        &self,
        record: &EmailRecord,
        response_text: &str,
        template_override: Option<TemplateKind>,
    ) -> DeliveryResult {
        if !self.config.enabled {
            debug!(id = %record.id, "email sending disabled, skipping delivery");
            return DeliveryResult::skipped();
        }

        let template = Self::template_for(record, response_text, template_override);
        let test_mode = self.config.test_mode;

        let to = match self.check_recipient(&record.from) {
            Ok(to) => to,
            Err(e) => {
                warn!(id = %record.id, from = %record.from, error = %e, "delivery rejected");
                return DeliveryResult::failed(&e, template, test_mode);
            }
        };

        let email = self.compose(record, to, response_text, template);

        if test_mode {
            let message_id = format!("test-{}", uuid::Uuid::new_v4());
            info!(
                id = %record.id,
                to = %email.to,
                template = %template,
                message_id = %message_id,
                "test mode: delivery simulated"
            );
            return DeliveryResult::sent(message_id, template, true);
        }

        let Some(provider) = self.provider.as_ref() else {
            let e = DeliveryError::Transport {
                provider: "none".to_string(),
                reason: "no delivery provider configured".to_string(),
            };
            warn!(id = %record.id, error = %e, "delivery failed");
            return DeliveryResult::failed(&e, template, false);
        };

        match provider.send(&email).await {
            Ok(message_id) => {
                info!(
                    id = %record.id,
                    to = %email.to,
                    provider = provider.name(),
                    template = %template,
                    message_id = %message_id,
                    "reply sent"
                );
                DeliveryResult::sent(message_id, template, false)
            }
            Err(e) => {
                warn!(id = %record.id, provider = provider.name(), error = %e, "delivery failed");
                DeliveryResult::failed(&e, template, false)
            }
        }
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Bare address from `Display Name <addr>` or a plain address.
pub fn extract_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let candidate = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if end > start => &trimmed[start + 1..end],
        _ => trimmed,
    };
    let candidate = candidate.trim().trim_matches('"');

    let (local, domain) = candidate.split_once('@')?;
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || candidate.chars().any(char::is_whitespace)
    {
        return None;
    }
    Some(candidate.to_string())
}

/// Check an address against the allow-list.
///
/// - Empty list → allow all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact address match
pub fn is_domain_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Pick a template from content: urgency first, then quotes. Keywords
/// match whole words. A `$` counts only when an amount follows it.
pub fn select_template(subject: &str, content: &str) -> TemplateKind {
    let haystack = format!("{subject}\n{content}");
    if URGENT_WORDS.is_match(&haystack) {
        TemplateKind::Urgent
    } else if contains_table(content) || PRICING_WORDS.is_match(&haystack) {
        TemplateKind::Quote
    } else {
        TemplateKind::Standard
    }
}

/// `Re: <subject>`, without stacking prefixes.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "Re: (no subject)".to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

/// Tag values are limited to ASCII letters, digits, `_` and `-`.
fn tag_value(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
