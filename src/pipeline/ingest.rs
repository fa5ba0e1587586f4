use std::io::Read;

use anyhow::Context;
use tracing::info;

use crate::domain::MessageRecord;
use crate::queue::{Queue, RedisQueue};
use crate::storage::postgres::PgMessageStore;
use crate::storage::{create_pg_pool, MessageStore};
use crate::types::{AppConfig, PipelineConfig};

use super::PipelineError;

/// Stores a listener record and queues it for classification. Returns
/// whether the id was queued.
///
/// A redelivered id is queued again while its stored message is still
/// unprocessed, so a push that failed after the append is recovered by the
/// next delivery. Classification is idempotent per message.
pub async fn ingest_record(
    messages: &dyn MessageStore,
    queue: &dyn Queue,
    pipeline: &PipelineConfig,
    record: &MessageRecord,
) -> Result<bool, PipelineError> {
    if !messages.append(record).await? {
        let pending = messages
            .get(&record.id)
            .await?
            .map_or(false, |stored| !stored.processed);
        if !pending {
            info!(target: "bot", message_id = %record.id, "duplicate message already processed; not queued");
            return Ok(false);
        }
        info!(target: "bot", message_id = %record.id, "duplicate message still unprocessed; queueing again");
    }
    queue.push(&pipeline.message_queue, &record.id).await?;
    info!(
        target: "bot",
        message_id = %record.id,
        channel = %record.channel,
        queue = %pipeline.message_queue,
        "ingested message"
    );
    Ok(true)
}

/// Entrypoint for the `ingest` subcommand. Reads one JSON record from
/// `path`, or stdin when absent.
pub async fn run_ingest(cfg: AppConfig, path: Option<String>) -> anyhow::Result<()> {
    let raw = match path.as_deref() {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read message record at {path}"))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read message record from stdin")?;
            buf
        }
    };
    let record: MessageRecord =
        serde_json::from_str(&raw).context("failed to parse message record")?;

    let pool = create_pg_pool(&cfg.postgres)
        .await
        .context("failed to connect to Postgres")?;
    let messages = PgMessageStore::new(pool);
    let queue = RedisQueue::new(&cfg.redis)
        .await
        .context("failed to connect to Redis")?;

    ingest_record(&messages, &queue, &cfg.pipeline, &record).await?;
    Ok(())
}
