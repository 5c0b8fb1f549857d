//! In-memory `Store` for tests and ephemeral runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::llm::TokenUsage;
use crate::pipeline::types::{EmailRecord, ProcessingState, Status, TokenAggregate};
use crate::store::traits::Store;

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, EmailRecord>,
    states: BTreeMap<String, ProcessingState>,
    responses: BTreeMap<String, String>,
    totals: TokenAggregate,
    watermark: u64,
}

/// Map-backed store. Every operation takes one lock, so each call is
/// atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_record(&self, id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn put_record(&self, record: &EmailRecord) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .records
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_state(&self, id: &str) -> Result<Option<ProcessingState>, DatabaseError> {
        Ok(self.inner.read().await.states.get(id).cloned())
    }

    async fn put_state(&self, id: &str, state: &ProcessingState) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .states
            .insert(id.to_string(), state.clone());
        Ok(())
    }

    async fn list_ids_by_status(&self, status: Status) -> Result<Vec<String>, DatabaseError> {
        Ok(self
            .inner
            .read()
            .await
            .states
            .iter()
            .filter(|(_, state)| state.status() == status)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn put_response(&self, id: &str, response: &str) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .responses
            .insert(id.to_string(), response.to_string());
        Ok(())
    }

    async fn get_response(&self, id: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.inner.read().await.responses.get(id).cloned())
    }

    async fn clear_response(&self, id: &str) -> Result<(), DatabaseError> {
        self.inner.write().await.responses.remove(id);
        Ok(())
    }

    async fn append_token_aggregate(
        &self,
        usage: TokenUsage,
        cost: Decimal,
    ) -> Result<TokenAggregate, DatabaseError> {
        let mut inner = self.inner.write().await;
        inner.totals.record(usage, cost);
        Ok(inner.totals.clone())
    }

    async fn token_aggregate(&self) -> Result<TokenAggregate, DatabaseError> {
        Ok(self.inner.read().await.totals.clone())
    }

    async fn watermark(&self) -> Result<u64, DatabaseError> {
        Ok(self.inner.read().await.watermark)
    }

    async fn advance_watermark(&self, history_id: u64) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.write().await;
        inner.watermark = inner.watermark.max(history_id);
        Ok(inner.watermark)
    }
}
