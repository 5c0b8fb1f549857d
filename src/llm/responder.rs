//! Turns a stored email into an LLM-drafted reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tracing::{debug, info};

use super::costs::calculate_cost;
use super::provider::{ChatMessage, CompletionRequest, LlmProvider, TokenUsage};
use crate::error::LlmError;
use crate::pipeline::types::EmailRecord;

/// Body characters sent to the model.
const BODY_MAX_CHARS: usize = 8000;

/// Used when `OPENAI_SYSTEM_PROMPT` is unset.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an email assistant drafting replies on behalf of the recipient.\n\n\
     Write a reply to the email below.\n\n\
     Rules:\n\
     - Be concise, warm and professional\n\
     - Answer every direct question that the email asks\n\
     - Use markdown: short paragraphs, bullet lists for steps, a pipe table for prices or comparisons\n\
     - Never invent facts, commitments, prices or dates that the email does not support\n\
     - Do not include a subject line or a signature";

const STRUCTURED_SUFFIX: &str = "\n\nRespond with ONLY a JSON object:\n\
     {\"category\": \"...\", \"response\": \"...\"}\n\n\
     - \"category\": one or two words describing the email (e.g. \"support\", \"sales\", \"scheduling\")\n\
     - \"response\": the full markdown reply";

/// Prompt and output settings for [`EmailResponder`].
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Overrides [`DEFAULT_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    /// Ask for `{category, response}` JSON.
    pub structured_output: bool,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tokens: 1000,
            structured_output: false,
        }
    }
}

/// A generated reply with its accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailResponse {
    /// Markdown reply text. Never empty.
    pub content: String,
    pub token_usage: TokenUsage,
    pub model: String,
    pub processing_time: Duration,
    pub category: Option<String>,
    pub cost: Decimal,
}

/// Drafts replies through whichever protocol client it was given.
pub struct EmailResponder {
    llm: Arc<dyn LlmProvider>,
    config: ResponderConfig,
}

impl EmailResponder {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ResponderConfig) -> Self {
        Self { llm, config }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Ask the model for a reply to `record`.
    pub async fn process_email(&self, record: &EmailRecord) -> Result<EmailResponse, LlmError> {
        let started = Instant::now();
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(build_user_prompt(record)),
        ])
        .with_max_tokens(self.config.max_tokens)
        .with_json_output(self.config.structured_output);

        debug!(id = %record.id, model = self.llm.model_name(), "requesting reply");
        let response = self.llm.complete(request).await?;

        let (content, category) = if self.config.structured_output {
            parse_structured(&response.content)
        } else {
            (response.content, None)
        };

        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: self.llm.model_name().to_string(),
                reason: "reply text is empty".to_string(),
            });
        }

        let model = if response.model.is_empty() {
            self.llm.model_name().to_string()
        } else {
            response.model
        };
        let usage = response.usage;
        let cost = calculate_cost(&model, usage.prompt_tokens, usage.completion_tokens);
        let processing_time = started.elapsed();

        info!(
            id = %record.id,
            model = %model,
            total_tokens = usage.total_tokens,
            elapsed_ms = processing_time.as_millis() as u64,
            "reply generated"
        );

        Ok(EmailResponse {
            content,
            token_usage: usage,
            model,
            processing_time,
            category,
            cost,
        })
    }

    fn system_prompt(&self) -> String {
        let base = self
            .config
            .system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        if self.config.structured_output {
            format!("{base}{STRUCTURED_SUFFIX}")
        } else {
            base.to_string()
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_user_prompt(record: &EmailRecord) -> String {
    let mut prompt = String::with_capacity(512);

    prompt.push_str(&format!("From: {}\n", record.from));
    prompt.push_str(&format!("To: {}\n", record.to));
    prompt.push_str(&format!("Subject: {}\n", record.subject));
    prompt.push_str(&format!(
        "Received: {}\n",
        record.received_at.format("%Y-%m-%d %H:%M UTC")
    ));

    let body = if record.body.trim().is_empty() {
        &record.snippet
    } else {
        &record.body
    };
    let body_preview: String = body.chars().take(BODY_MAX_CHARS).collect();
    prompt.push_str(&format!("\nEmail:\n{}", body_preview));

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct StructuredReply {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    response: String,
}

/// Split a structured reply into text and category. Anything that is not
/// a JSON object with a non-empty `response` is used verbatim.
fn parse_structured(raw: &str) -> (String, Option<String>) {
    let json = extract_json_object(raw);
    match serde_json::from_str::<StructuredReply>(&json) {
        Ok(parsed) if !parsed.response.trim().is_empty() => {
            let category = parsed
                .category
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty());
            (parsed.response, category)
        }
        _ => (raw.to_string(), None),
    }
}

/// Extract a JSON object from text that may wrap it in a code fence or prose.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::error::LlmErrorKind;
    use crate::llm::CompletionResponse;

    /// Returns a fixed reply and remembers the last request.
    struct MockLlm {
        reply: String,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl MockLlm {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "gpt-4o-mini"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            *self.last_request.lock().unwrap() = Some(request);
            Ok(CompletionResponse {
                content: self.reply.clone(),
                usage: TokenUsage::new(1000, 500),
                model: "gpt-4o-mini".into(),
                response_id: None,
            })
        }
    }

    fn record() -> EmailRecord {
        EmailRecord {
            id: "msg-1".into(),
            thread_id: "thr-1".into(),
            subject: "Pricing question".into(),
            from: "Alice <alice@example.com>".into(),
            to: "me@example.com".into(),
            received_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(),
            snippet: "How much is setup?".into(),
            body: "Hi, how much is setup for five seats?".into(),
            history_id: 42,
        }
    }

    #[test]
    fn user_prompt_includes_metadata() {
        let prompt = build_user_prompt(&record());
        assert!(prompt.contains("From: Alice <alice@example.com>"));
        assert!(prompt.contains("Subject: Pricing question"));
        assert!(prompt.contains("Received: 2026-03-02 09:30 UTC"));
        assert!(prompt.contains("five seats"));
    }

    #[test]
    fn user_prompt_falls_back_to_snippet_and_truncates() {
        let mut r = record();
        r.body = "  ".into();
        assert!(build_user_prompt(&r).contains("How much is setup?"));

        r.body = "x".repeat(BODY_MAX_CHARS + 500);
        let prompt = build_user_prompt(&r);
        assert_eq!(prompt.matches('x').count(), BODY_MAX_CHARS);
    }

    #[test]
    fn structured_reply_parsed() {
        let (text, category) =
            parse_structured(r#"{"category": " Sales ", "response": "Setup is **$100**."}"#);
        assert_eq!(text, "Setup is **$100**.");
        assert_eq!(category.as_deref(), Some("sales"));
    }

    #[test]
    fn structured_reply_in_code_fence() {
        let raw = "Here you go:\n```json\n{\"category\": \"support\", \"response\": \"Try again.\"}\n```";
        let (text, category) = parse_structured(raw);
        assert_eq!(text, "Try again.");
        assert_eq!(category.as_deref(), Some("support"));
    }

    #[test]
    fn non_json_reply_used_verbatim() {
        let (text, category) = parse_structured("Thanks, I'll check.");
        assert_eq!(text, "Thanks, I'll check.");
        assert!(category.is_none());

        let (text, _) = parse_structured(r#"{"category": "x", "response": ""}"#);
        assert_eq!(text, r#"{"category": "x", "response": ""}"#);
    }

    #[tokio::test]
    async fn process_email_returns_content_usage_and_cost() {
        let llm = MockLlm::new("Setup is $100 per seat.");
        let responder = EmailResponder::new(llm.clone(), ResponderConfig::default());

        let out = responder.process_email(&record()).await.unwrap();
        assert_eq!(out.content, "Setup is $100 per seat.");
        assert_eq!(out.token_usage.total_tokens, 1500);
        assert_eq!(out.model, "gpt-4o-mini");
        assert_eq!(out.cost, rust_decimal_macros::dec!(0.00045));
        assert!(out.category.is_none());

        let request = llm.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.max_tokens, Some(1000));
        assert!(!request.json_output);
        assert_eq!(request.system_prompt().as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
    }

    #[tokio::test]
    async fn structured_mode_requests_json_and_extracts_category() {
        let llm = MockLlm::new(r#"{"category":"scheduling","response":"Tuesday works."}"#);
        let responder = EmailResponder::new(
            llm.clone(),
            ResponderConfig {
                system_prompt: Some("Custom prompt.".into()),
                max_tokens: 300,
                structured_output: true,
            },
        );

        let out = responder.process_email(&record()).await.unwrap();
        assert_eq!(out.content, "Tuesday works.");
        assert_eq!(out.category.as_deref(), Some("scheduling"));

        let request = llm.last_request.lock().unwrap().clone().unwrap();
        assert!(request.json_output);
        let system = request.system_prompt().unwrap();
        assert!(system.starts_with("Custom prompt."));
        assert!(system.contains("\"category\""));
    }

    #[tokio::test]
    async fn whitespace_reply_is_empty_response() {
        let responder = EmailResponder::new(MockLlm::new("  \n "), ResponderConfig::default());
        let err = responder.process_email(&record()).await.unwrap_err();
        assert_eq!(err.kind(), LlmErrorKind::EmptyResponse);
    }
}
