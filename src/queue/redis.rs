use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::types::RedisConfig;

use super::{Queue, QueueResult};

const MIN_BLOCK_SECS: f64 = 0.01;

/// Redis list-backed queue: `LPUSH` to enqueue, `BRPOP` to dequeue, which
/// gives FIFO order per list key.
///
/// A blocking pop occupies its connection, so each consumer loop should own
/// its own `RedisQueue`.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub async fn new(cfg: &RedisConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(cfg.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn push(&self, channel: &str, payload: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(channel, payload).await?;
        debug!(target: "queue", channel = %channel, "payload pushed");
        Ok(())
    }

    async fn blocking_pop(&self, channel: &str, timeout: Duration) -> QueueResult<Option<String>> {
        let mut conn = self.conn.clone();
        // BRPOP treats 0 as "block forever".
        let secs = timeout.as_secs_f64().max(MIN_BLOCK_SECS);
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(channel)
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn clear(&self, channel: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(channel).await?;
        Ok(())
    }
}
