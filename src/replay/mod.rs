//! Re-queues stored messages that were never processed, oldest first.
//!
//! Safe to run against a live pipeline: classification is cached per
//! message and trade mutations are idempotent per analysis.

use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::PipelineError;
use crate::queue::{Queue, RedisQueue};
use crate::storage::postgres::PgMessageStore;
use crate::storage::{create_pg_pool, MessageStore};
use crate::types::{AppConfig, PipelineConfig};

#[derive(Clone, Debug)]
pub struct ReplayOptions {
    pub limit: usize,
    /// Pause between pushes.
    pub delay: Duration,
    /// Clear both queues before pushing.
    pub flush: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub flushed: bool,
    pub queued: usize,
    pub message_ids: Vec<String>,
}

pub async fn replay_unprocessed(
    messages: &dyn MessageStore,
    queue: &dyn Queue,
    pipeline: &PipelineConfig,
    opts: &ReplayOptions,
) -> Result<ReplaySummary, PipelineError> {
    if opts.flush {
        queue.clear(&pipeline.message_queue).await?;
        queue.clear(&pipeline.trade_action_queue).await?;
        info!(
            target: "replay",
            message_queue = %pipeline.message_queue,
            trade_action_queue = %pipeline.trade_action_queue,
            "flushed queues"
        );
    }

    let pending = messages.unprocessed(opts.limit).await?;
    info!(target: "replay", count = pending.len(), limit = opts.limit, "replaying unprocessed messages");

    let mut summary = ReplaySummary {
        flushed: opts.flush,
        ..ReplaySummary::default()
    };
    for (i, message) in pending.iter().enumerate() {
        if i > 0 && !opts.delay.is_zero() {
            tokio::time::sleep(opts.delay).await;
        }
        queue.push(&pipeline.message_queue, &message.id).await?;
        debug!(
            target: "replay",
            message_id = %message.id,
            ts = %message.timestamp,
            channel = %message.channel,
            "queued message"
        );
        summary.message_ids.push(message.id.clone());
    }
    summary.queued = summary.message_ids.len();
    Ok(summary)
}

/// Entrypoint for the `replay` subcommand.
pub async fn run_replay(cfg: AppConfig, opts: ReplayOptions) -> anyhow::Result<()> {
    let pool = create_pg_pool(&cfg.postgres)
        .await
        .context("failed to connect to Postgres")?;
    let messages = PgMessageStore::new(pool);
    let queue = RedisQueue::new(&cfg.redis)
        .await
        .context("failed to connect to Redis")?;

    let summary = replay_unprocessed(&messages, &queue, &cfg.pipeline, &opts).await?;
    info!(
        target: "replay",
        summary = serde_json::to_string(&summary).unwrap_or_default().as_str(),
        "replay finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::storage::memory::MemoryStore;
    use crate::testkit::record;

    #[tokio::test]
    async fn replays_oldest_unprocessed_first_and_flushes() {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();
        let pipeline = PipelineConfig::default();

        for r in [record("c", 3, "third", None), record("a", 1, "first", None), record("b", 2, "second", None)] {
            store.append(&r).await.unwrap();
        }
        store.mark_processed("b").await.unwrap();
        queue.push(&pipeline.trade_action_queue, "stale").await.unwrap();

        let opts = ReplayOptions {
            limit: 10,
            delay: Duration::ZERO,
            flush: true,
        };
        let summary = replay_unprocessed(&store, &queue, &pipeline, &opts).await.unwrap();

        assert_eq!(summary.queued, 2);
        assert_eq!(queue.pending(&pipeline.message_queue), vec!["a", "c"]);
        assert!(queue.is_empty(&pipeline.trade_action_queue));
    }

    #[tokio::test]
    async fn limit_caps_batch() {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();
        let pipeline = PipelineConfig::default();
        for i in 0..5 {
            store.append(&record(&format!("m{i}"), i, "x", None)).await.unwrap();
        }

        let opts = ReplayOptions {
            limit: 2,
            delay: Duration::ZERO,
            flush: false,
        };
        let summary = replay_unprocessed(&store, &queue, &pipeline, &opts).await.unwrap();
        assert_eq!(summary.message_ids, vec!["m0", "m1"]);
    }
}
