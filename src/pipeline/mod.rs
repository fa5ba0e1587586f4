//! Queue consumers and their wiring.
//!
//! Two loops run side by side: the [`Processor`] turns raw message ids into
//! stored analyses and queues actionable ones, and the [`TradeManager`]
//! applies queued analyses to the trade ledger. Each loop handles one item
//! at a time; only the storage layer is shared.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::classifier::Classifier;
use crate::client::{ChatCompletionsClient, LanguageModel};
use crate::ledger::{LedgerError, TradeStateMachine};
use crate::monitoring::dashboard::run_monitoring;
use crate::queue::{QueueError, RedisQueue};
use crate::storage::postgres::{PgAnalysisCache, PgMessageStore, PgTradeLedger};
use crate::storage::{create_pg_pool, StoreError};
use crate::types::AppConfig;
use crate::utils::{Clock, SystemClock};

pub mod ingest;
pub mod processor;
pub mod scheduler;
pub mod trade_manager;

pub use ingest::{ingest_record, run_ingest};
pub use processor::{ProcessOutcome, Processor};
pub use scheduler::PollSchedule;
pub use trade_manager::{ActionOutcome, TradeManager};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the item may succeed when it is delivered again.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Store(err) => err.is_transient(),
            PipelineError::Queue(err) => err.is_transient(),
            PipelineError::Ledger(err) => err.is_transient(),
            PipelineError::Payload(_) => false,
        }
    }
}

/// Which consumers a process runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineMode {
    Both,
    ProcessorOnly,
    TradeManagerOnly,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Both => "both",
            PipelineMode::ProcessorOnly => "processor",
            PipelineMode::TradeManagerOnly => "trade_manager",
        }
    }

    fn runs_processor(&self) -> bool {
        matches!(self, PipelineMode::Both | PipelineMode::ProcessorOnly)
    }

    fn runs_trade_manager(&self) -> bool {
        matches!(self, PipelineMode::Both | PipelineMode::TradeManagerOnly)
    }
}

/// Sleeps for `pause` unless shutdown is requested first.
pub(crate) async fn pause_or_shutdown(pause: Duration, shutdown: &mut watch::Receiver<bool>) {
    if pause.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(pause) => {}
        _ = shutdown.changed() => {}
    }
}

/// Entrypoint used by `main.rs`: connects to Postgres and Redis, builds the
/// consumers for `mode`, and runs them with the monitoring task until ctrl-c.
///
/// Connection failures here are the only fatal errors.
pub async fn run_pipeline(cfg: AppConfig, mode: PipelineMode) -> anyhow::Result<()> {
    info!(target: "bot", mode = mode.as_str(), "run_pipeline starting");

    info!(target: "bot", "connecting to Postgres");
    let pool = create_pg_pool(&cfg.postgres)
        .await
        .context("failed to connect to Postgres")?;
    info!(target: "bot", "Postgres connected");

    let messages = Arc::new(PgMessageStore::new(pool.clone()));
    let analyses = Arc::new(PgAnalysisCache::new(pool.clone()));
    let ledger = Arc::new(PgTradeLedger::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if mode.runs_processor() {
        let model: Arc<dyn LanguageModel> = Arc::new(
            ChatCompletionsClient::new(&cfg.classifier).context("failed to build classifier client")?,
        );
        let queue = Arc::new(
            RedisQueue::new(&cfg.redis)
                .await
                .context("failed to connect to Redis for processor")?,
        );
        let classifier = Classifier::new(
            analyses.clone(),
            messages.clone(),
            ledger.clone(),
            model,
            clock.clone(),
            cfg.classifier.clone(),
            &cfg.pipeline,
        );
        let processor = Processor::new(
            queue,
            messages.clone(),
            classifier,
            &cfg.pipeline,
            PollSchedule::new(cfg.pipeline.pop_timeout()),
        );
        tasks.push(tokio::spawn(processor.run(shutdown_rx.clone())));
    }

    if mode.runs_trade_manager() {
        let queue = Arc::new(
            RedisQueue::new(&cfg.redis)
                .await
                .context("failed to connect to Redis for trade manager")?,
        );
        let manager = TradeManager::new(
            queue,
            analyses.clone(),
            TradeStateMachine::new(ledger.clone(), clock.clone()),
            &cfg.pipeline,
            PollSchedule::new(cfg.pipeline.pop_timeout()),
        );
        tasks.push(tokio::spawn(manager.run(shutdown_rx.clone())));
    }

    let monitoring = tokio::spawn(run_monitoring(cfg.monitoring.clone(), shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(target: "bot", "shutdown requested");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(err) = task.await {
            warn!(target: "bot", error = %err, "consumer task panicked");
        }
    }
    match monitoring.await {
        Ok(Err(err)) => warn!(target: "bot", error = %err, "monitoring task failed"),
        Err(err) => warn!(target: "bot", error = %err, "monitoring task panicked"),
        Ok(Ok(())) => {}
    }

    info!(target: "bot", "pipeline stopped");
    Ok(())
}
