use std::sync::Arc;

use anyhow::Context;

use mailroom::api;
use mailroom::config::AppConfig;
use mailroom::delivery::{DeliveryGateway, DeliveryProvider, ResendProvider, SmtpProvider};
use mailroom::llm::{EmailResponder, create_provider};
use mailroom::pipeline::{Orchestrator, spawn_queue_worker};
use mailroom::store::{LibSqlBackend, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Mailroom v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} ({})", config.llm.model, config.llm.protocol);
    eprintln!("   API: http://0.0.0.0:{}/api/emails", config.port);
    eprintln!("   Events: ws://0.0.0.0:{}/ws", config.port);

    // ── LLM ─────────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let responder = EmailResponder::new(llm, config.responder.clone());

    // ── Database ────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = if config.db_path == ":memory:" {
        Arc::new(LibSqlBackend::new_memory().await?)
    } else {
        Arc::new(
            LibSqlBackend::new_local(std::path::Path::new(&config.db_path))
                .await
                .with_context(|| format!("Failed to open database at {}", config.db_path))?,
        )
    };
    eprintln!("   Database: {}", config.db_path);

    // ── Delivery ────────────────────────────────────────────────────────
    let provider: Option<Arc<dyn DeliveryProvider>> = if let Some(key) = &config.resend_api_key {
        Some(Arc::new(ResendProvider::new(key.clone())?))
    } else if let Some(smtp) = &config.smtp {
        Some(Arc::new(SmtpProvider::new(smtp)?))
    } else {
        None
    };
    eprintln!(
        "   Delivery: {}{}",
        match (&provider, config.delivery.enabled) {
            (_, false) => "disabled".to_string(),
            (Some(p), true) => format!("enabled via {}", p.name()),
            (None, true) => "enabled, no provider configured".to_string(),
        },
        if config.delivery.test_mode {
            " (test mode)"
        } else {
            ""
        }
    );
    let delivery = DeliveryGateway::new(config.delivery.clone(), provider);

    // ── Pipeline ────────────────────────────────────────────────────────
    let orchestrator = Orchestrator::new(store, responder, delivery, config.orchestrator.clone());
    let (_worker, shutdown) = spawn_queue_worker(Arc::clone(&orchestrator), config.poll_interval);
    eprintln!("   Sweep: every {}s\n", config.poll_interval.as_secs());

    // ── API ─────────────────────────────────────────────────────────────
    let app = api::router(orchestrator);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Dashboard API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    tracing::info!("Mailroom stopped");
    Ok(())
}
