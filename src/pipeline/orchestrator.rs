//! Processing orchestrator: the per-record state machine.
//!
//! ```text
//! pending ──▶ processing ──▶ completed
//!                  │
//!                  ├──▶ failed          (retryable LLM failure, storage failure)
//!                  └──▶ manual-review   (invalid request)
//! ```
//!
//! Concurrency:
//! - One sweep at a time: a single-permit semaphore taken with `try_acquire`.
//!   A second sweep returns an empty result immediately.
//! - One record at a time: every attempt, sweep or manual, runs in `lane`.
//! - Per-record reservation: ids are reserved atomically in `in_flight`
//!   before any state is read and released on drop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, error, info, warn};

use crate::delivery::{DeliveryGateway, reply_subject};
use crate::error::ProcessingError;
use crate::llm::EmailResponder;
use crate::pipeline::types::{
    DeliveryRecord, DeliveryStatus, EmailRecord, FailureKind, ProcessingEvent, ProcessingResult,
    ProcessingState, QueueStats, Status,
};
use crate::render::{TemplateKind, WrapOptions, render_email};
use crate::store::Store;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Tuning for queue sweeps.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pause between consecutive records within one sweep.
    pub record_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            record_delay: Duration::from_millis(2000),
        }
    }
}

/// A record together with its current processing result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailDetail {
    pub email: EmailRecord,
    pub result: ProcessingResult,
}

/// A rendered reply that was not sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailPreview {
    pub id: String,
    pub template: TemplateKind,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Removes its id from the in-flight set when dropped.
struct Reservation {
    in_flight: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

/// Drives records through the pipeline. Collaborators are injected.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    responder: EmailResponder,
    delivery: DeliveryGateway,
    config: OrchestratorConfig,
    sweep: Semaphore,
    lane: tokio::sync::Mutex<()>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    events: broadcast::Sender<ProcessingEvent>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        responder: EmailResponder,
        delivery: DeliveryGateway,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            store,
            responder,
            delivery,
            config,
            sweep: Semaphore::new(1),
            lane: tokio::sync::Mutex::new(()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            events,
        })
    }

    /// Subscribe to live processing events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn emit(&self, event: ProcessingEvent) {
        // Ok if no receivers are listening
        let _ = self.events.send(event);
    }

    fn reserve(&self, id: &str) -> Option<Reservation> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(Reservation {
            in_flight: Arc::clone(&self.in_flight),
            id: id.to_string(),
        })
    }

    fn reserve_or_err(&self, id: &str) -> Result<Reservation, ProcessingError> {
        self.reserve(id)
            .ok_or_else(|| ProcessingError::AlreadyInFlight { id: id.to_string() })
    }

    async fn load_state(&self, id: &str) -> Result<ProcessingState, ProcessingError> {
        self.store
            .get_state(id)
            .await?
            .ok_or_else(|| ProcessingError::NotFound { id: id.to_string() })
    }

    async fn write_state(&self, id: &str, state: &ProcessingState) -> Result<(), ProcessingError> {
        self.store.put_state(id, state).await?;
        self.emit(ProcessingEvent::StatusChanged {
            id: id.to_string(),
            status: state.status(),
        });
        Ok(())
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Store newly polled records as `pending`.
    ///
    /// Records at or below the watermark and ids already stored are skipped.
    /// Returns the ids that were ingested.
    pub async fn ingest(&self, mut records: Vec<EmailRecord>) -> Result<Vec<String>, ProcessingError> {
        let watermark = self.store.watermark().await?;
        records.sort_by_key(|r| r.history_id);

        let mut ingested = Vec::new();
        let mut highest = watermark;

        for record in records {
            if record.history_id <= watermark {
                debug!(id = %record.id, history_id = record.history_id, "below watermark, skipping");
                continue;
            }
            if self.store.get_record(&record.id).await?.is_some() {
                debug!(id = %record.id, "already stored, skipping");
                continue;
            }

            self.store.put_record(&record).await?;
            self.store.put_state(&record.id, &ProcessingState::pending()).await?;
            highest = highest.max(record.history_id);

            info!(id = %record.id, history_id = record.history_id, subject = %record.subject, "Email ingested");
            self.emit(ProcessingEvent::Ingested {
                id: record.id.clone(),
            });
            ingested.push(record.id);
        }

        if highest > watermark {
            self.store.advance_watermark(highest).await?;
        }
        Ok(ingested)
    }

    // ── Single-record operations ────────────────────────────────────

    /// Process one `pending` record.
    ///
    /// LLM failures are not errors here: they are persisted on the record
    /// and returned as a `failed` or `manual-review` result.
    pub async fn process_email(&self, id: &str) -> Result<ProcessingResult, ProcessingError> {
        let _reservation = self.reserve_or_err(id)?;
        let _lane = self.lane.lock().await;
        self.run_attempt(id).await
    }

    /// Re-run a `failed` or `manual-review` record as a fresh attempt.
    pub async fn retry_email(&self, id: &str) -> Result<ProcessingResult, ProcessingError> {
        let _reservation = self.reserve_or_err(id)?;
        let _lane = self.lane.lock().await;
        self.reset_to_pending(id, &[Status::Failed, Status::ManualReview])
            .await?;
        self.run_attempt(id).await
    }

    /// Force a `completed` record back to `pending`, dropping its response.
    pub async fn reset_email(&self, id: &str) -> Result<ProcessingResult, ProcessingError> {
        let _reservation = self.reserve_or_err(id)?;
        let state = self.reset_to_pending(id, &[Status::Completed]).await?;
        Ok(ProcessingResult::from_state(id, &state))
    }

    /// Reset a `completed` record and process it again.
    pub async fn rerun_email(&self, id: &str) -> Result<ProcessingResult, ProcessingError> {
        let _reservation = self.reserve_or_err(id)?;
        let _lane = self.lane.lock().await;
        self.reset_to_pending(id, &[Status::Completed]).await?;
        self.run_attempt(id).await
    }

    /// Render a completed reply without sending it.
    pub async fn preview_email(
        &self,
        id: &str,
        template: Option<TemplateKind>,
    ) -> Result<EmailPreview, ProcessingError> {
        let record = self.load_record(id).await?;
        let state = self.load_state(id).await?;
        let response = state.response().ok_or_else(|| ProcessingError::NotCompleted {
            id: id.to_string(),
            status: state.status().to_string(),
        })?;

        let template = DeliveryGateway::template_for(&record, response, template);
        let subject = reply_subject(&record.subject);
        let options = WrapOptions::new(template, subject.clone())
            .with_brand(&self.delivery.config().brand_name);
        let wrapped = render_email(response, &options);

        Ok(EmailPreview {
            id: id.to_string(),
            template,
            subject,
            html: wrapped.html,
            text: wrapped.text,
        })
    }

    // ── Queue ───────────────────────────────────────────────────────

    /// Process every `pending` record, oldest first, one at a time.
    ///
    /// Returns an empty list when another sweep is already running.
    pub async fn process_queue(&self) -> Result<Vec<ProcessingResult>, ProcessingError> {
        let Ok(_permit) = self.sweep.try_acquire() else {
            debug!("Sweep already running, skipping");
            return Ok(Vec::new());
        };

        let ids = self.store.list_ids_by_status(Status::Pending).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut queue = Vec::with_capacity(ids.len());
        for id in ids {
            let history_id = match self.store.get_record(&id).await? {
                Some(record) => record.history_id,
                None => {
                    warn!(id = %id, "state without record, skipping");
                    continue;
                }
            };
            queue.push((history_id, id));
        }
        queue.sort();

        info!("Processing {} pending email(s)", queue.len());

        let mut results = Vec::with_capacity(queue.len());
        let mut attempted = 0usize;
        for (_, id) in queue {
            if attempted > 0 && !self.config.record_delay.is_zero() {
                tokio::time::sleep(self.config.record_delay).await;
            }

            let Some(_reservation) = self.reserve(&id) else {
                debug!(id = %id, "already in flight, skipping");
                continue;
            };
            attempted += 1;

            let _lane = self.lane.lock().await;
            match self.run_attempt(&id).await {
                Ok(result) => results.push(result),
                Err(ProcessingError::InvalidTransition { .. }) => {
                    debug!(id = %id, "no longer pending, skipping");
                }
                Err(e) => {
                    error!(id = %id, error = %e, "Failed to process email");
                }
            }
        }

        info!(processed = results.len(), "Sweep finished");
        Ok(results)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_result(&self, id: &str) -> Result<ProcessingResult, ProcessingError> {
        let state = self.load_state(id).await?;
        Ok(ProcessingResult::from_state(id, &state))
    }

    pub async fn get_email(&self, id: &str) -> Result<EmailDetail, ProcessingError> {
        let email = self.load_record(id).await?;
        let result = self.get_result(id).await?;
        Ok(EmailDetail { email, result })
    }

    /// Records with the given status, or all records, newest first.
    pub async fn list(&self, status: Option<Status>) -> Result<Vec<EmailDetail>, ProcessingError> {
        let statuses: Vec<Status> = match status {
            Some(s) => vec![s],
            None => Status::ALL.to_vec(),
        };

        let mut details = Vec::new();
        for status in statuses {
            for id in self.store.list_ids_by_status(status).await? {
                let (Some(email), Some(state)) = (
                    self.store.get_record(&id).await?,
                    self.store.get_state(&id).await?,
                ) else {
                    continue;
                };
                details.push(EmailDetail {
                    result: ProcessingResult::from_state(&id, &state),
                    email,
                });
            }
        }
        details.sort_by(|a, b| b.email.history_id.cmp(&a.email.history_id));
        Ok(details)
    }

    /// Counts per status plus token totals.
    pub async fn queue_stats(&self) -> Result<QueueStats, ProcessingError> {
        let mut stats = QueueStats::default();
        for status in Status::ALL {
            let count = self.store.list_ids_by_status(status).await?.len();
            stats.set_count(status, count);
        }
        stats.totals = self.store.token_aggregate().await?;
        Ok(stats)
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn load_record(&self, id: &str) -> Result<EmailRecord, ProcessingError> {
        self.store
            .get_record(id)
            .await?
            .ok_or_else(|| ProcessingError::NotFound { id: id.to_string() })
    }

    /// Move a record in one of `allowed` back to `pending`, clearing the
    /// response sub-key. Anything else is rejected without a state change.
    async fn reset_to_pending(
        &self,
        id: &str,
        allowed: &[Status],
    ) -> Result<ProcessingState, ProcessingError> {
        let current = self.load_state(id).await?.status();
        if !allowed.contains(&current) || !current.can_transition_to(Status::Pending) {
            return Err(ProcessingError::InvalidTransition {
                id: id.to_string(),
                from: current.to_string(),
                to: Status::Pending.to_string(),
            });
        }

        self.store.clear_response(id).await?;
        let pending = ProcessingState::pending();
        self.write_state(id, &pending).await?;
        info!(id, from = %current, "Email reset to pending");
        Ok(pending)
    }

    /// One attempt on a reserved `pending` record. Caller holds the lane.
    async fn run_attempt(&self, id: &str) -> Result<ProcessingResult, ProcessingError> {
        let record = self.load_record(id).await?;
        let current = self.load_state(id).await?.status();
        if !current.can_transition_to(Status::Processing) {
            return Err(ProcessingError::InvalidTransition {
                id: id.to_string(),
                from: current.to_string(),
                to: Status::Processing.to_string(),
            });
        }

        self.store.clear_response(id).await?;
        self.write_state(id, &ProcessingState::processing()).await?;
        info!(id, subject = %record.subject, "Processing email");

        let final_state = match self.responder.process_email(&record).await {
            Ok(reply) => self.complete(&record, reply).await?,
            Err(e) => {
                let kind = FailureKind::from(e.kind());
                let state = if e.needs_manual_review() {
                    ProcessingState::ManualReview {
                        error: e.to_string(),
                        error_kind: kind,
                        failed_at: Utc::now(),
                    }
                } else {
                    ProcessingState::Failed {
                        error: e.to_string(),
                        error_kind: kind,
                        failed_at: Utc::now(),
                    }
                };
                warn!(id, kind = %e.kind(), status = %state.status(), error = %e, "LLM call failed");
                self.write_state(id, &state).await?;
                state
            }
        };

        Ok(ProcessingResult::from_state(id, &final_state))
    }

    /// Persist a successful reply, account for it, then deliver it.
    async fn complete(
        &self,
        record: &EmailRecord,
        reply: crate::llm::EmailResponse,
    ) -> Result<ProcessingState, ProcessingError> {
        let id = record.id.as_str();

        if let Err(reason) = self.persist_response(id, &reply.content).await {
            let state = ProcessingState::Failed {
                error: reason,
                error_kind: FailureKind::Storage,
                failed_at: Utc::now(),
            };
            error!(id, "Response write not verified, marking failed");
            self.write_state(id, &state).await?;
            return Ok(state);
        }

        let template = DeliveryGateway::template_for(record, &reply.content, None);
        let delivery = self.delivery.is_enabled().then(|| DeliveryRecord {
            status: DeliveryStatus::Pending,
            template,
            message_id: None,
            error: None,
            test_mode: self.delivery.config().test_mode,
            updated_at: Utc::now(),
        });

        let mut state = ProcessingState::Completed {
            response: reply.content.clone(),
            token_usage: reply.token_usage,
            model: reply.model.clone(),
            processing_time_ms: reply.processing_time.as_millis() as u64,
            cost: reply.cost,
            category: reply.category.clone(),
            delivery,
            completed_at: Utc::now(),
        };
        self.write_state(id, &state).await?;

        let totals = self
            .store
            .append_token_aggregate(reply.token_usage, reply.cost)
            .await?;
        info!(
            id,
            model = %reply.model,
            total_tokens = reply.token_usage.total_tokens,
            cost = %reply.cost,
            emails_processed = totals.emails_processed,
            "Email completed"
        );

        if !self.delivery.is_enabled() {
            return Ok(state);
        }

        let outcome = self.delivery.send(record, &reply.content, Some(template)).await;
        let status = if outcome.success {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };
        if let ProcessingState::Completed { delivery, .. } = &mut state {
            *delivery = Some(DeliveryRecord {
                status,
                template: outcome.template,
                message_id: outcome.message_id,
                error: outcome.error,
                test_mode: outcome.test_mode,
                updated_at: Utc::now(),
            });
        }
        // A delivery failure never demotes the completed state.
        self.store.put_state(id, &state).await?;
        self.emit(ProcessingEvent::DeliveryUpdated {
            id: id.to_string(),
            status,
        });
        Ok(state)
    }

    /// Write the response sub-key and read it back.
    async fn persist_response(&self, id: &str, content: &str) -> Result<(), String> {
        self.store
            .put_response(id, content)
            .await
            .map_err(|e| format!("response write failed: {e}"))?;
        match self.store.get_response(id).await {
            Ok(Some(stored)) if stored == content => Ok(()),
            Ok(_) => Err("response write could not be verified".to_string()),
            Err(e) => Err(format!("response read-back failed: {e}")),
        }
    }
}
