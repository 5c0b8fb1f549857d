//! Shared types for the email processing pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LlmErrorKind;
use crate::llm::TokenUsage;
use crate::render::TemplateKind;

// ── Email record ────────────────────────────────────────────────────

/// One ingested email. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    /// Raw From header, possibly `Display Name <addr>`.
    pub from: String,
    pub to: String,
    pub received_at: DateTime<Utc>,
    pub snippet: String,
    pub body: String,
    /// Monotonic sequence number from the upstream mailbox.
    pub history_id: u64,
}

// ── Status ──────────────────────────────────────────────────────────

/// Lifecycle status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
    ManualReview,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Processing,
        Status::Completed,
        Status::Failed,
        Status::ManualReview,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ManualReview => "manual-review",
        }
    }

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(self, target: Status) -> bool {
        use Status::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, ManualReview)
                // retry
                | (Failed, Pending)
                | (ManualReview, Pending)
                // rerun
                | (Completed, Pending)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

// ── Failure / delivery detail ───────────────────────────────────────

/// Why a record ended in `failed` or `manual-review`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimit,
    ApiError,
    InvalidRequest,
    Timeout,
    EmptyResponse,
    /// The response could not be persisted.
    Storage,
}

impl From<LlmErrorKind> for FailureKind {
    fn from(kind: LlmErrorKind) -> Self {
        match kind {
            LlmErrorKind::RateLimit => Self::RateLimit,
            LlmErrorKind::ApiError => Self::ApiError,
            LlmErrorKind::InvalidRequest => Self::InvalidRequest,
            LlmErrorKind::Timeout => Self::Timeout,
            LlmErrorKind::EmptyResponse => Self::EmptyResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Outcome of sending the generated reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub status: DeliveryStatus,
    pub template: TemplateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sent through the dry-run path.
    #[serde(default)]
    pub test_mode: bool,
    pub updated_at: DateTime<Utc>,
}

// ── Processing state ────────────────────────────────────────────────

/// Mutable processing state of a record, one variant per status. A
/// completed state always carries a response; pending and processing
/// states carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ProcessingState {
    Pending {
        queued_at: DateTime<Utc>,
    },
    Processing {
        started_at: DateTime<Utc>,
    },
    Completed {
        response: String,
        token_usage: TokenUsage,
        model: String,
        processing_time_ms: u64,
        cost: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delivery: Option<DeliveryRecord>,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        error_kind: FailureKind,
        failed_at: DateTime<Utc>,
    },
    ManualReview {
        error: String,
        error_kind: FailureKind,
        failed_at: DateTime<Utc>,
    },
}

impl ProcessingState {
    pub fn pending() -> Self {
        Self::Pending {
            queued_at: Utc::now(),
        }
    }

    pub fn processing() -> Self {
        Self::Processing {
            started_at: Utc::now(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Pending { .. } => Status::Pending,
            Self::Processing { .. } => Status::Processing,
            Self::Completed { .. } => Status::Completed,
            Self::Failed { .. } => Status::Failed,
            Self::ManualReview { .. } => Status::ManualReview,
        }
    }

    pub fn response(&self) -> Option<&str> {
        match self {
            Self::Completed { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error, .. } | Self::ManualReview { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn delivery(&self) -> Option<&DeliveryRecord> {
        match self {
            Self::Completed { delivery, .. } => delivery.as_ref(),
            _ => None,
        }
    }
}

// ── Dashboard views ─────────────────────────────────────────────────

/// Processing outcome as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingResult {
    pub id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ProcessingResult {
    pub fn from_state(id: impl Into<String>, state: &ProcessingState) -> Self {
        let mut result = Self {
            id: id.into(),
            status: state.status(),
            response: None,
            token_usage: None,
            processing_time_ms: None,
            error: None,
            error_kind: None,
            delivery_status: None,
            category: None,
        };

        match state {
            ProcessingState::Completed {
                response,
                token_usage,
                processing_time_ms,
                category,
                delivery,
                ..
            } => {
                result.response = Some(response.clone());
                result.token_usage = Some(*token_usage);
                result.processing_time_ms = Some(*processing_time_ms);
                result.category = category.clone();
                result.delivery_status = delivery.as_ref().map(|d| d.status);
            }
            ProcessingState::Failed {
                error, error_kind, ..
            }
            | ProcessingState::ManualReview {
                error, error_kind, ..
            } => {
                result.error = Some(error.clone());
                result.error_kind = Some(*error_kind);
            }
            ProcessingState::Pending { .. } | ProcessingState::Processing { .. } => {}
        }

        result
    }
}

/// Append-only running totals across every completed record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenAggregate {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub emails_processed: u64,
    pub total_cost: Decimal,
}

impl TokenAggregate {
    pub fn record(&mut self, usage: TokenUsage, cost: Decimal) {
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.total_tokens += u64::from(usage.total_tokens);
        self.emails_processed += 1;
        self.total_cost += cost;
    }
}

/// Record counts per status plus the token aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub manual_review: usize,
    pub totals: TokenAggregate,
}

impl QueueStats {
    pub fn set_count(&mut self, status: Status, count: usize) {
        match status {
            Status::Pending => self.pending = count,
            Status::Processing => self.processing = count,
            Status::Completed => self.completed = count,
            Status::Failed => self.failed = count,
            Status::ManualReview => self.manual_review = count,
        }
    }
}

/// Live event pushed to dashboard subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessingEvent {
    Ingested { id: String },
    StatusChanged { id: String, status: Status },
    DeliveryUpdated { id: String, status: DeliveryStatus },
}
