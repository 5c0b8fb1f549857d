//! libSQL backend: a single `kv` table behind the `Store` trait.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::llm::TokenUsage;
use crate::pipeline::types::{EmailRecord, ProcessingState, Status, TokenAggregate};
use crate::store::traits::{
    Store, TOKEN_AGGREGATE_KEY, WATERMARK_KEY, record_key, response_key, state_key, status_key,
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);";

const UPSERT: &str = "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// libSQL store.
///
/// One connection is reused for all operations. Every write holds
/// `write_lock`, so a single-key write can never land inside (or be rolled
/// back with) another task's state transaction.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Query(format!("init_schema: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    async fn get_raw(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT value FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get {key}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get {key} row parse: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get {key}: {e}"))),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, DatabaseError> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete_raw(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete {key}: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

async fn put_raw(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    conn.execute(UPSERT, params![key, value, Utc::now().to_rfc3339()])
        .await
        .map_err(|e| DatabaseError::Query(format!("put {key}: {e}")))?;
    Ok(())
}

/// `email:{id}:status` → `id`.
fn id_from_status_key(key: &str) -> Option<&str> {
    key.strip_prefix("email:")?.strip_suffix(":status")
}

// ── Store impl ──────────────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlBackend {
    async fn get_record(&self, id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
        self.get_json(&record_key(id)).await
    }

    async fn put_record(&self, record: &EmailRecord) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().await;
        put_raw(&self.conn, &record_key(&record.id), &json).await
    }

    async fn get_state(&self, id: &str) -> Result<Option<ProcessingState>, DatabaseError> {
        self.get_json(&state_key(id)).await
    }

    async fn put_state(&self, id: &str, state: &ProcessingState) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(state)?;
        let _guard = self.write_lock.lock().await;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("put_state begin: {e}")))?;
        put_raw(&tx, &state_key(id), &json).await?;
        put_raw(&tx, &status_key(id), state.status().as_str()).await?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("put_state commit: {e}")))?;

        debug!(id, status = %state.status(), "state written");
        Ok(())
    }

    async fn list_ids_by_status(&self, status: Status) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT key FROM kv WHERE key LIKE 'email:%:status' AND value = ?1 ORDER BY key",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_ids_by_status: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_ids_by_status: {e}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_ids_by_status row parse: {e}")))?;
            if let Some(id) = id_from_status_key(&key) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    async fn put_response(&self, id: &str, response: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        put_raw(&self.conn, &response_key(id), response).await
    }

    async fn get_response(&self, id: &str) -> Result<Option<String>, DatabaseError> {
        self.get_raw(&response_key(id)).await
    }

    async fn clear_response(&self, id: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.delete_raw(&response_key(id)).await
    }

    async fn append_token_aggregate(
        &self,
        usage: TokenUsage,
        cost: Decimal,
    ) -> Result<TokenAggregate, DatabaseError> {
        let _guard = self.write_lock.lock().await;

        let mut totals: TokenAggregate = self.get_json(TOKEN_AGGREGATE_KEY).await?.unwrap_or_default();
        totals.record(usage, cost);
        put_raw(&self.conn, TOKEN_AGGREGATE_KEY, &serde_json::to_string(&totals)?).await?;
        Ok(totals)
    }

    async fn token_aggregate(&self) -> Result<TokenAggregate, DatabaseError> {
        Ok(self.get_json(TOKEN_AGGREGATE_KEY).await?.unwrap_or_default())
    }

    async fn watermark(&self) -> Result<u64, DatabaseError> {
        match self.get_raw(WATERMARK_KEY).await? {
            Some(raw) => raw
                .parse()
                .map_err(|e| DatabaseError::Serialization(format!("watermark '{raw}': {e}"))),
            None => Ok(0),
        }
    }

    async fn advance_watermark(&self, history_id: u64) -> Result<u64, DatabaseError> {
        let _guard = self.write_lock.lock().await;

        let current = self.watermark().await?;
        if history_id <= current {
            return Ok(current);
        }
        put_raw(&self.conn, WATERMARK_KEY, &history_id.to_string()).await?;
        Ok(history_id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::pipeline::types::FailureKind;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_record(id: &str, history_id: u64) -> EmailRecord {
        EmailRecord {
            id: id.into(),
            thread_id: format!("thread-{id}"),
            subject: "Quarterly numbers".into(),
            from: "Bob <bob@example.com>".into(),
            to: "me@example.com".into(),
            received_at: Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap(),
            snippet: "Can you send".into(),
            body: "Can you send the Q3 report?".into(),
            history_id,
        }
    }

    #[tokio::test]
    async fn record_roundtrip() {
        let db = test_db().await;
        let record = make_record("m1", 7);
        db.put_record(&record).await.unwrap();
        assert_eq!(db.get_record("m1").await.unwrap(), Some(record));
        assert_eq!(db.get_record("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn state_writes_status_subkey() {
        let db = test_db().await;
        db.put_state("m1", &ProcessingState::pending()).await.unwrap();
        db.put_state("m2", &ProcessingState::pending()).await.unwrap();
        db.put_state(
            "m3",
            &ProcessingState::ManualReview {
                error: "bad request".into(),
                error_kind: FailureKind::InvalidRequest,
                failed_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        assert_eq!(db.list_ids_by_status(Status::Pending).await.unwrap(), vec!["m1", "m2"]);
        assert_eq!(db.list_ids_by_status(Status::ManualReview).await.unwrap(), vec!["m3"]);

        db.put_state("m1", &ProcessingState::processing()).await.unwrap();
        assert_eq!(db.list_ids_by_status(Status::Pending).await.unwrap(), vec!["m2"]);
        assert_eq!(
            db.get_state("m1").await.unwrap().unwrap().status(),
            Status::Processing
        );
    }

    #[tokio::test]
    async fn completed_state_roundtrip() {
        let db = test_db().await;
        let state = ProcessingState::Completed {
            response: "Here is the report.".into(),
            token_usage: TokenUsage::new(100, 20),
            model: "gpt-4o-mini".into(),
            processing_time_ms: 840,
            cost: dec!(0.000027),
            category: Some("reporting".into()),
            delivery: None,
            completed_at: Utc::now(),
        };
        db.put_state("m1", &state).await.unwrap();
        assert_eq!(db.get_state("m1").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn response_subkey_lifecycle() {
        let db = test_db().await;
        db.put_response("m1", "Hello").await.unwrap();
        assert_eq!(db.get_response("m1").await.unwrap().as_deref(), Some("Hello"));
        db.clear_response("m1").await.unwrap();
        assert_eq!(db.get_response("m1").await.unwrap(), None);
        // response keys never show up as ids
        db.put_response("m2", "x").await.unwrap();
        assert!(db.list_ids_by_status(Status::Pending).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_all_persist() {
        let db = Arc::new(test_db().await);
        let mut tasks = Vec::new();
        for n in 0..16 {
            let db1 = Arc::clone(&db);
            tasks.push(tokio::spawn(async move {
                let id = format!("m{n:02}");
                db1.put_state(&id, &ProcessingState::pending()).await.unwrap();
            }));
            let db = Arc::clone(&db);
            tasks.push(tokio::spawn(async move {
                let id = format!("r{n:02}");
                db.put_response(&id, "draft").await.unwrap();
                db.put_record(&make_record(&id, n)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(db.list_ids_by_status(Status::Pending).await.unwrap().len(), 16);
        for n in 0..16 {
            let id = format!("r{n:02}");
            assert_eq!(db.get_response(&id).await.unwrap().as_deref(), Some("draft"));
            assert!(db.get_record(&id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn aggregate_and_watermark() {
        let db = test_db().await;
        assert_eq!(db.token_aggregate().await.unwrap(), TokenAggregate::default());

        db.append_token_aggregate(TokenUsage::new(10, 5), dec!(0.01)).await.unwrap();
        let totals = db
            .append_token_aggregate(TokenUsage::new(1, 1), dec!(0.02))
            .await
            .unwrap();
        assert_eq!(totals.total_tokens, 17);
        assert_eq!(totals.total_cost, dec!(0.03));
        assert_eq!(db.token_aggregate().await.unwrap(), totals);

        assert_eq!(db.watermark().await.unwrap(), 0);
        assert_eq!(db.advance_watermark(42).await.unwrap(), 42);
        assert_eq!(db.advance_watermark(41).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mailroom.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.put_record(&make_record("m1", 3)).await.unwrap();
            db.advance_watermark(3).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_record("m1").await.unwrap().is_some());
        assert_eq!(db.watermark().await.unwrap(), 3);
    }

    #[test]
    fn status_key_parsing() {
        assert_eq!(id_from_status_key("email:abc:status"), Some("abc"));
        assert_eq!(id_from_status_key("email:a:b:status"), Some("a:b"));
        assert_eq!(id_from_status_key("email:abc:state"), None);
    }
}
