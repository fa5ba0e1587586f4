use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::classifier::Classifier;
use crate::domain::{Classification, TradeAction};
use crate::monitoring::METRICS;
use crate::queue::Queue;
use crate::storage::MessageStore;
use crate::types::PipelineConfig;

use super::scheduler::PollSchedule;
use super::{pause_or_shutdown, PipelineError};

/// What one processor cycle did.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessOutcome {
    /// Nothing arrived within the pop timeout.
    Idle,
    MissingMessage(String),
    EmptyContent(String),
    Classified {
        message_id: String,
        classification: Classification,
        cached: bool,
        queued: bool,
    },
}

/// Consumer of the raw-message queue.
pub struct Processor {
    queue: Arc<dyn Queue>,
    messages: Arc<dyn MessageStore>,
    classifier: Classifier,
    message_queue: String,
    trade_action_queue: String,
    schedule: PollSchedule,
}

impl Processor {
    pub fn new(
        queue: Arc<dyn Queue>,
        messages: Arc<dyn MessageStore>,
        classifier: Classifier,
        config: &PipelineConfig,
        schedule: PollSchedule,
    ) -> Self {
        Self {
            queue,
            messages,
            classifier,
            message_queue: config.message_queue.clone(),
            trade_action_queue: config.trade_action_queue.clone(),
            schedule,
        }
    }

    /// Pops one payload and handles it.
    pub async fn process_next(&self) -> Result<ProcessOutcome, PipelineError> {
        let payload = self
            .queue
            .blocking_pop(&self.message_queue, self.schedule.pop_timeout())
            .await?;
        match payload {
            Some(payload) => self.handle(&message_id_from_payload(&payload)).await,
            None => Ok(ProcessOutcome::Idle),
        }
    }

    pub async fn handle(&self, message_id: &str) -> Result<ProcessOutcome, PipelineError> {
        info!(target: "processor", message_id = %message_id, "processing message");

        let Some(message) = self.messages.get(message_id).await? else {
            warn!(target: "processor", message_id = %message_id, "message not found in store");
            return Ok(ProcessOutcome::MissingMessage(message_id.to_string()));
        };

        if message.content.trim().is_empty() {
            info!(target: "processor", message_id = %message_id, "message has no content");
            self.messages.mark_processed(message_id).await?;
            return Ok(ProcessOutcome::EmptyContent(message_id.to_string()));
        }

        let classified = self.classifier.classify(&message).await?;
        let analysis = &classified.analysis;

        let queued = analysis.classification.is_actionable();
        if queued {
            let action = serde_json::to_string(&TradeAction::from(analysis))?;
            self.queue.push(&self.trade_action_queue, &action).await?;
            METRICS.record_trade_action_queued(message_id, analysis.classification.as_str());
            info!(
                target: "processor",
                message_id = %message_id,
                analysis_id = analysis.id,
                classification = %analysis.classification,
                "queued trade action"
            );
        }

        self.messages.mark_processed(message_id).await?;
        METRICS.record_message_processed(message_id, analysis.classification.as_str());

        Ok(ProcessOutcome::Classified {
            message_id: message_id.to_string(),
            classification: analysis.classification,
            cached: classified.cached,
            queued,
        })
    }

    /// Loops until `shutdown` flips. Failed cycles abandon their item and
    /// pause per the schedule.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "processor", queue = %self.message_queue, "processor started");
        while !*shutdown.borrow() {
            METRICS.heartbeat();
            match self.process_next().await {
                Ok(_) => self.schedule.on_success(),
                Err(err) => {
                    let pause = self.schedule.on_error();
                    warn!(
                        target: "processor",
                        error = %err,
                        transient = err.is_transient(),
                        consecutive_errors = self.schedule.consecutive_errors(),
                        "processor cycle failed"
                    );
                    pause_or_shutdown(pause, &mut shutdown).await;
                }
            }
        }
        info!(target: "processor", "processor stopped");
    }
}

/// Raw-message payloads are bare ids; `{"message_id": ...}` objects from
/// older producers are accepted too.
fn message_id_from_payload(payload: &str) -> String {
    let trimmed = payload.trim();
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| match v.get("message_id")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| trimmed.to_string())
}
