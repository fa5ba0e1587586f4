use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Queue, QueueResult};

/// In-process queue with the same FIFO and timeout behaviour as
/// [`RedisQueue`](super::RedisQueue).
#[derive(Default)]
pub struct MemoryQueue {
    channels: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, channel: &str) -> bool {
        self.len(channel) == 0
    }

    /// Pending payloads on `channel`, oldest first.
    pub fn pending(&self, channel: &str) -> Vec<String> {
        self.channels
            .lock()
            .get(channel)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn try_pop(&self, channel: &str) -> Option<String> {
        self.channels
            .lock()
            .get_mut(channel)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn push(&self, channel: &str, payload: &str) -> QueueResult<()> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push_back(payload.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, channel: &str, timeout: Duration) -> QueueResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            if let Some(payload) = self.try_pop(channel) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(channel));
            }
        }
    }

    async fn clear(&self, channel: &str) -> QueueResult<()> {
        self.channels.lock().remove(channel);
        Ok(())
    }
}
