//! Dashboard JSON API and live event WebSocket.

mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::ProcessingError;
use crate::pipeline::Orchestrator;
use crate::pipeline::types::{EmailRecord, Status};
use crate::render::TemplateKind;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum router with dashboard REST and WebSocket routes.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .route("/api/emails", get(list_emails).post(ingest_emails))
        .route("/api/emails/{id}", get(get_email))
        .route("/api/emails/{id}/process", post(process_email))
        .route("/api/emails/{id}/retry", post(retry_email))
        .route("/api/emails/{id}/rerun", post(rerun_email))
        .route("/api/emails/{id}/preview", get(preview_email))
        .route("/api/queue/process", post(process_queue))
        .route("/api/stats", get(stats))
        // dashboard is served from a different origin
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message.into()})),
    )
        .into_response()
}

fn error_response(e: ProcessingError) -> Response {
    let status = match &e {
        ProcessingError::NotFound { .. } => StatusCode::NOT_FOUND,
        ProcessingError::InvalidTransition { .. }
        | ProcessingError::AlreadyInFlight { .. }
        | ProcessingError::NotCompleted { .. } => StatusCode::CONFLICT,
        ProcessingError::Store(_) => {
            error!(error = %e, "Store error while serving request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

fn respond<T: serde::Serialize>(result: Result<T, ProcessingError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mailroom"
    }))
}

// ── Emails ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_emails(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let status = match query.status.as_deref().map(str::parse::<Status>).transpose() {
        Ok(status) => status,
        Err(e) => return bad_request(e),
    };
    respond(state.orchestrator.list(status).await)
}

async fn get_email(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.get_email(&id).await)
}

async fn ingest_emails(
    State(state): State<AppState>,
    Json(records): Json<Vec<EmailRecord>>,
) -> Response {
    match state.orchestrator.ingest(records).await {
        Ok(ids) => {
            info!(count = ids.len(), "Emails ingested via API");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({"ingested": ids})),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn process_email(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.process_email(&id).await)
}

async fn retry_email(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.retry_email(&id).await)
}

async fn rerun_email(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(state.orchestrator.rerun_email(&id).await)
}

#[derive(Deserialize)]
struct PreviewQuery {
    template: Option<String>,
}

async fn preview_email(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Response {
    let template = match query
        .template
        .as_deref()
        .map(str::parse::<TemplateKind>)
        .transpose()
    {
        Ok(template) => template,
        Err(e) => return bad_request(e),
    };
    respond(state.orchestrator.preview_email(&id, template).await)
}

// ── Queue ───────────────────────────────────────────────────────────────

async fn process_queue(State(state): State<AppState>) -> Response {
    respond(state.orchestrator.process_queue().await)
}

async fn stats(State(state): State<AppState>) -> Response {
    respond(state.orchestrator.queue_stats().await)
}
