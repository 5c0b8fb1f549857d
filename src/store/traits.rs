//! `Store` trait: the key-value persistence contract of the pipeline.
//!
//! Keys are namespaced by record id. The status and the response text live
//! in their own sub-keys so a response write can be verified independently
//! of the state write.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::DatabaseError;
use crate::llm::TokenUsage;
use crate::pipeline::types::{EmailRecord, ProcessingState, Status, TokenAggregate};

/// Key of an immutable email record.
pub fn record_key(id: &str) -> String {
    format!("email:{id}")
}

/// Key of the serialized [`ProcessingState`].
pub fn state_key(id: &str) -> String {
    format!("email:{id}:state")
}

/// Key of the bare status string, used for listing by status.
pub fn status_key(id: &str) -> String {
    format!("email:{id}:status")
}

/// Key of the generated response text.
pub fn response_key(id: &str) -> String {
    format!("email:{id}:response")
}

pub const TOKEN_AGGREGATE_KEY: &str = "stats:tokens";
pub const WATERMARK_KEY: &str = "watermark";

/// Backend-agnostic store for records, states and running totals.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Records ─────────────────────────────────────────────────────

    async fn get_record(&self, id: &str) -> Result<Option<EmailRecord>, DatabaseError>;

    async fn put_record(&self, record: &EmailRecord) -> Result<(), DatabaseError>;

    // ── State ───────────────────────────────────────────────────────

    async fn get_state(&self, id: &str) -> Result<Option<ProcessingState>, DatabaseError>;

    /// Write the state and its status sub-key together.
    async fn put_state(&self, id: &str, state: &ProcessingState) -> Result<(), DatabaseError>;

    /// Ids whose current status is `status`, in key order.
    async fn list_ids_by_status(&self, status: Status) -> Result<Vec<String>, DatabaseError>;

    // ── Response sub-key ────────────────────────────────────────────

    async fn put_response(&self, id: &str, response: &str) -> Result<(), DatabaseError>;

    async fn get_response(&self, id: &str) -> Result<Option<String>, DatabaseError>;

    async fn clear_response(&self, id: &str) -> Result<(), DatabaseError>;

    // ── Aggregates ──────────────────────────────────────────────────

    /// Atomically add one completion to the running totals and return them.
    async fn append_token_aggregate(
        &self,
        usage: TokenUsage,
        cost: Decimal,
    ) -> Result<TokenAggregate, DatabaseError>;

    async fn token_aggregate(&self) -> Result<TokenAggregate, DatabaseError>;

    // ── Ingestion watermark ─────────────────────────────────────────

    /// Highest history id ingested so far, 0 when nothing was ingested.
    async fn watermark(&self) -> Result<u64, DatabaseError>;

    /// Raise the watermark. Lower values are ignored.
    async fn advance_watermark(&self, history_id: u64) -> Result<u64, DatabaseError>;
}
