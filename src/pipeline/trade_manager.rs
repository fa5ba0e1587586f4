use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::TradeAction;
use crate::ledger::{TradeStateMachine, Transition};
use crate::monitoring::METRICS;
use crate::queue::Queue;
use crate::storage::AnalysisCache;
use crate::types::PipelineConfig;

use super::scheduler::PollSchedule;
use super::{pause_or_shutdown, PipelineError};

/// What one trade-manager cycle did.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionOutcome {
    Idle,
    /// Payload was not a trade action; logged and discarded.
    Dropped(String),
    /// No stored analysis for the message yet.
    MissingAnalysis(String),
    Applied(Transition),
}

/// Consumer of the trade-action queue.
pub struct TradeManager {
    queue: Arc<dyn Queue>,
    analyses: Arc<dyn AnalysisCache>,
    machine: TradeStateMachine,
    trade_action_queue: String,
    schedule: PollSchedule,
}

impl TradeManager {
    pub fn new(
        queue: Arc<dyn Queue>,
        analyses: Arc<dyn AnalysisCache>,
        machine: TradeStateMachine,
        config: &PipelineConfig,
        schedule: PollSchedule,
    ) -> Self {
        Self {
            queue,
            analyses,
            machine,
            trade_action_queue: config.trade_action_queue.clone(),
            schedule,
        }
    }

    pub async fn process_next(&self) -> Result<ActionOutcome, PipelineError> {
        let payload = self
            .queue
            .blocking_pop(&self.trade_action_queue, self.schedule.pop_timeout())
            .await?;
        match payload {
            Some(payload) => self.handle(&payload).await,
            None => Ok(ActionOutcome::Idle),
        }
    }

    pub async fn handle(&self, payload: &str) -> Result<ActionOutcome, PipelineError> {
        let action: TradeAction = match serde_json::from_str(payload) {
            Ok(action) => action,
            Err(err) => {
                warn!(target: "trade_manager", payload = %payload, error = %err, "dropping malformed trade action");
                return Ok(ActionOutcome::Dropped(err.to_string()));
            }
        };

        // The stored analysis is authoritative; the queued copy only locates it.
        let Some(analysis) = self.analyses.find_by_message(&action.message_id).await? else {
            warn!(
                target: "trade_manager",
                message_id = %action.message_id,
                analysis_id = action.analysis_id,
                "no stored analysis for trade action"
            );
            return Ok(ActionOutcome::MissingAnalysis(action.message_id));
        };
        if analysis.id != action.analysis_id {
            warn!(
                target: "trade_manager",
                message_id = %action.message_id,
                queued_analysis_id = action.analysis_id,
                stored_analysis_id = analysis.id,
                "queued analysis id differs from stored analysis"
            );
        }

        info!(
            target: "trade_manager",
            message_id = %analysis.message_id,
            analysis_id = analysis.id,
            classification = %analysis.classification,
            related_trade_id = ?analysis.related_trade_id,
            "applying analysis"
        );
        let transition = self.machine.apply(&analysis).await?;
        record_transition(analysis.id, &transition);
        Ok(ActionOutcome::Applied(transition))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "trade_manager", queue = %self.trade_action_queue, "trade manager started");
        while !*shutdown.borrow() {
            METRICS.heartbeat();
            match self.process_next().await {
                Ok(_) => self.schedule.on_success(),
                Err(err) => {
                    let pause = self.schedule.on_error();
                    warn!(
                        target: "trade_manager",
                        error = %err,
                        transient = err.is_transient(),
                        consecutive_errors = self.schedule.consecutive_errors(),
                        "trade manager cycle failed"
                    );
                    pause_or_shutdown(pause, &mut shutdown).await;
                }
            }
        }
        info!(target: "trade_manager", "trade manager stopped");
    }
}

fn record_transition(analysis_id: i64, transition: &Transition) {
    match transition {
        Transition::Created(trade) => METRICS.record_trade_created(trade.id, &trade.symbol),
        Transition::Updated { trade, closed } => {
            METRICS.record_trade_updated(trade.id);
            if *closed {
                METRICS.record_trade_closed(trade.id);
            }
        }
        Transition::Closed(trade) => METRICS.record_trade_closed(trade.id),
        Transition::Skipped(skip) => METRICS.record_transition_skipped(analysis_id, skip.as_str()),
    }
}
