//! Cache-first message classification.
//!
//! A message is sent to the language model at most once per stored
//! analysis: the cache is consulted first and the result is written with
//! first-writer-wins semantics, so redelivery and concurrent processors
//! converge on a single row.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{ClientError, LanguageModel};
use crate::domain::{Analysis, Message, NewAnalysis, TradeSummary};
use crate::monitoring::METRICS;
use crate::reply_chain::ReplyChainResolver;
use crate::storage::{AnalysisCache, MessageStore, StoreResult, TradeLedger};
use crate::types::{ClassifierConfig, PipelineConfig};
use crate::utils::Clock;

pub mod prompt;
pub mod validate;

pub use prompt::{build_prompt, PromptContext};
pub use validate::{parse_expiration, validate_response, ValidatedResponse, ValidationError};

/// Result of [`Classifier::classify`].
#[derive(Clone, Debug, PartialEq)]
pub struct Classified {
    pub analysis: Analysis,
    /// True when the analysis came from the cache and no model call was made.
    pub cached: bool,
}

pub struct Classifier {
    analyses: Arc<dyn AnalysisCache>,
    messages: Arc<dyn MessageStore>,
    trades: Arc<dyn TradeLedger>,
    model: Arc<dyn LanguageModel>,
    clock: Arc<dyn Clock>,
    resolver: ReplyChainResolver,
    config: ClassifierConfig,
    history_limit: usize,
}

impl Classifier {
    pub fn new(
        analyses: Arc<dyn AnalysisCache>,
        messages: Arc<dyn MessageStore>,
        trades: Arc<dyn TradeLedger>,
        model: Arc<dyn LanguageModel>,
        clock: Arc<dyn Clock>,
        config: ClassifierConfig,
        pipeline: &PipelineConfig,
    ) -> Self {
        Self {
            resolver: ReplyChainResolver::new(messages.clone(), pipeline.max_reply_depth),
            analyses,
            messages,
            trades,
            model,
            clock,
            config,
            history_limit: pipeline.history_limit,
        }
    }

    /// Returns the stored analysis for `message`, calling the model only on a
    /// cache miss. Only storage errors escape; every model or validation
    /// failure ends up stored as an `other` analysis.
    pub async fn classify(&self, message: &Message) -> StoreResult<Classified> {
        if let Some(analysis) = self.analyses.find_by_message(&message.id).await? {
            METRICS.record_cache_hit(&message.id);
            info!(
                target: "classifier",
                message_id = %message.id,
                classification = %analysis.classification,
                "using cached analysis"
            );
            return Ok(Classified {
                analysis,
                cached: true,
            });
        }

        let prompt = self.assemble_prompt(message).await?;
        debug!(target: "classifier", message_id = %message.id, prompt = %prompt, "classifier prompt");

        let candidate = match self.call_model(&message.id, &prompt).await {
            Ok((raw, attempts)) => {
                debug!(target: "classifier", message_id = %message.id, attempts, raw = %raw, "classifier response");
                match validate_response(&raw, self.clock.today()) {
                    Ok(validated) => validated.into_analysis(&message.id),
                    Err(err) => self.fallback(&message.id, &err.to_string()),
                }
            }
            Err(err) => self.fallback(&message.id, &err.to_string()),
        };

        let analysis = self.analyses.store(&candidate, self.clock.now()).await?;
        if analysis.classification != candidate.classification() {
            debug!(
                target: "classifier",
                message_id = %message.id,
                stored = %analysis.classification,
                discarded = %candidate.classification(),
                "analysis already stored by another writer"
            );
        }
        info!(
            target: "classifier",
            message_id = %message.id,
            analysis_id = analysis.id,
            classification = %analysis.classification,
            related_trade_id = ?analysis.related_trade_id,
            "stored analysis"
        );

        Ok(Classified {
            analysis,
            cached: false,
        })
    }

    async fn assemble_prompt(&self, message: &Message) -> StoreResult<String> {
        let reply_chain = self.resolver.resolve(&message.id).await;
        let history = self
            .messages
            .recent_in_channel(&message.channel, message.timestamp, self.history_limit)
            .await?;
        let active_trades: Vec<TradeSummary> = self
            .trades
            .active_trades()
            .await?
            .iter()
            .map(TradeSummary::from)
            .collect();

        Ok(build_prompt(&PromptContext {
            today: self.clock.today(),
            active_trades: &active_trades,
            reply_chain: &reply_chain,
            history: &history,
            content: &message.content,
        }))
    }

    /// Calls the model with exponential backoff on transient failures.
    /// Returns the raw completion and the number of attempts used.
    async fn call_model(&self, message_id: &str, prompt: &str) -> Result<(String, u32), ClientError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            METRICS.record_classifier_call(self.model.name());
            match self.model.complete(prompt).await {
                Ok(raw) => return Ok((raw, attempt)),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        target: "classifier",
                        message_id = %message_id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "classifier call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        target: "classifier",
                        message_id = %message_id,
                        attempt,
                        error = %err,
                        "classifier call failed; giving up"
                    );
                    return Err(err);
                }
            }
        }
    }

    fn fallback(&self, message_id: &str, reason: &str) -> NewAnalysis {
        METRICS.record_classifier_failure(message_id, reason);
        NewAnalysis::other(message_id, format!("Error: {reason}"))
    }
}
