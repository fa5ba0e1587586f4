//! Durable FIFO channels between the listener, the processor and the trade
//! manager.
//!
//! Delivery is at-least-once: there is no acknowledgement, so consumers must
//! tolerate seeing the same payload twice.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Redis(err) => {
                err.is_io_error() || err.is_timeout() || err.is_connection_dropped()
            }
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[async_trait]
pub trait Queue: Send + Sync {
    async fn push(&self, channel: &str, payload: &str) -> QueueResult<()>;

    /// Waits up to `timeout` for the oldest payload on `channel`.
    async fn blocking_pop(&self, channel: &str, timeout: Duration) -> QueueResult<Option<String>>;

    /// Drops every pending payload on `channel`.
    async fn clear(&self, channel: &str) -> QueueResult<()>;
}
