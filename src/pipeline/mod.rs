//! Email processing pipeline.
//!
//! Records enter through [`Orchestrator::ingest`] as `pending` and move
//! through the state machine one at a time:
//! 1. `EmailResponder` generates a reply (LLM, with bounded retry)
//! 2. the reply is persisted and verified, totals are updated
//! 3. `DeliveryGateway` renders and sends it when sending is enabled
//!
//! [`spawn_queue_worker`] sweeps the queue on a timer.

pub mod orchestrator;
pub mod types;
pub mod worker;

pub use orchestrator::{EmailDetail, EmailPreview, Orchestrator, OrchestratorConfig};
pub use worker::{DEFAULT_POLL_INTERVAL, spawn_queue_worker};
