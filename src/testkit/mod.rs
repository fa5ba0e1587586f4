//! In-process doubles for driving the pipeline without Postgres, Redis or a
//! model endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::classifier::Classifier;
use crate::client::{ClientError, ClientResult, LanguageModel};
use crate::domain::MessageRecord;
use crate::ledger::TradeStateMachine;
use crate::pipeline::{PollSchedule, Processor, TradeManager};
use crate::queue::MemoryQueue;
use crate::storage::memory::MemoryStore;
use crate::types::{ClassifierConfig, PipelineConfig};
use crate::utils::FixedClock;

/// Language model that replays queued responses in order and counts calls.
/// Once the script runs out every call fails with
/// [`ClientError::EmptyResponse`].
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<ClientResult<String>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, raw: impl Into<String>) {
        self.script.lock().push_back(Ok(raw.into()));
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push_response(value.to_string());
    }

    pub fn push_error(&self, err: ClientError) {
        self.script.lock().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> ClientResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        self.script
            .lock()
            .pop_front()
            .unwrap_or(Err(ClientError::EmptyResponse))
    }
}

/// A retryable failure, as returned by an overloaded endpoint.
pub fn unavailable() -> ClientError {
    ClientError::HttpStatus {
        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
        body: "overloaded".to_string(),
    }
}

/// Wednesday 2024-03-06 14:00 UTC.
pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-06T14:00:00Z")
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Listener record in channel `alerts`, `minute` minutes after [`base_time`].
pub fn record(id: &str, minute: i64, content: &str, parent_id: Option<&str>) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        timestamp: base_time() + Duration::minutes(minute),
        content: content.to_string(),
        parent_id: parent_id.map(str::to_string),
        channel: "alerts".to_string(),
        author: "desk".to_string(),
        attachments: Vec::new(),
    }
}

/// Classifier settings with no retry delay.
pub fn fast_classifier_config() -> ClassifierConfig {
    ClassifierConfig {
        api_key: "test".to_string(),
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        ..ClassifierConfig::default()
    }
}

/// Memory-backed pipeline: one store, one queue, a scripted model and a
/// fixed clock shared by every component it builds.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub model: Arc<ScriptedModel>,
    pub clock: Arc<FixedClock>,
    pub pipeline: PipelineConfig,
    pub classifier: ClassifierConfig,
    /// Schedule handed to consumers built by the harness.
    pub schedule: PollSchedule,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(MemoryQueue::new()),
            model: Arc::new(ScriptedModel::new()),
            clock: Arc::new(FixedClock::new(base_time())),
            pipeline: PipelineConfig::default(),
            classifier: fast_classifier_config(),
            schedule: PollSchedule::immediate(),
        }
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.model.clone(),
            self.clock.clone(),
            self.classifier.clone(),
            &self.pipeline,
        )
    }

    pub fn state_machine(&self) -> TradeStateMachine {
        TradeStateMachine::new(self.store.clone(), self.clock.clone())
    }

    pub fn processor(&self) -> Processor {
        Processor::new(
            self.queue.clone(),
            self.store.clone(),
            self.classifier(),
            &self.pipeline,
            self.schedule.clone(),
        )
    }

    pub fn trade_manager(&self) -> TradeManager {
        TradeManager::new(
            self.queue.clone(),
            self.store.clone(),
            self.state_machine(),
            &self.pipeline,
            self.schedule.clone(),
        )
    }

    /// Stores `record` and queues its id, the way the listener does.
    /// Returns whether the record was new.
    pub async fn deliver(&self, record: &MessageRecord) -> anyhow::Result<bool> {
        use crate::queue::Queue;
        use crate::storage::MessageStore;

        let inserted = self.store.append(record).await?;
        self.queue.push(&self.pipeline.message_queue, &record.id).await?;
        Ok(inserted)
    }
}
