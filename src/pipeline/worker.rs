//! Background queue worker: runs a sweep on a fixed timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pipeline::orchestrator::Orchestrator;

/// Default sweep interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn a task that sweeps the pending queue every `interval`.
///
/// The first sweep runs immediately. Setting the returned flag stops the
/// loop at the next tick.
pub fn spawn_queue_worker(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Queue worker started, sweeping every {}s", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Queue worker shutting down");
                return;
            }

            match orchestrator.process_queue().await {
                Ok(results) if results.is_empty() => debug!("Sweep found nothing to do"),
                Ok(results) => debug!(processed = results.len(), "Sweep complete"),
                Err(e) => error!(error = %e, "Sweep failed"),
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::delivery::DeliveryGateway;
    use crate::error::LlmError;
    use crate::llm::{
        CompletionRequest, CompletionResponse, EmailResponder, LlmProvider, ResponderConfig,
        TokenUsage,
    };
    use crate::pipeline::orchestrator::OrchestratorConfig;
    use crate::pipeline::types::{EmailRecord, Status};
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct CountingLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for CountingLlm {
        fn model_name(&self) -> &str {
            "gpt-4o"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionResponse {
                content: "On it.".into(),
                usage: TokenUsage::new(10, 5),
                model: "gpt-4o".into(),
                response_id: None,
            })
        }
    }

    fn record(id: &str, history_id: u64) -> EmailRecord {
        EmailRecord {
            id: id.into(),
            thread_id: id.into(),
            subject: "Hello".into(),
            from: "bob@example.com".into(),
            to: "me@example.com".into(),
            received_at: Utc::now(),
            snippet: String::new(),
            body: "Hi there".into(),
            history_id,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_sweeps_on_each_tick_until_shutdown() {
        let llm = Arc::new(CountingLlm::default());
        let orch = Orchestrator::new(
            Arc::new(MemoryStore::new()),
            EmailResponder::new(llm.clone(), ResponderConfig::default()),
            DeliveryGateway::disabled(),
            OrchestratorConfig {
                record_delay: Duration::ZERO,
            },
        );
        orch.ingest(vec![record("a", 1)]).await.unwrap();

        let (handle, shutdown) = spawn_queue_worker(Arc::clone(&orch), Duration::from_secs(30));

        // first tick fires immediately
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(orch.get_result("a").await.unwrap().status, Status::Completed);

        orch.ingest(vec![record("b", 2)]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(orch.get_result("b").await.unwrap().status, Status::Completed);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);

        shutdown.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.await.unwrap();
    }
}
