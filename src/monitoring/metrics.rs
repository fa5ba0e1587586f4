use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

/// Global metrics registry shared by the processor and the trade manager.
pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[derive(Default)]
struct MetricsInner {
    messages_processed: AtomicU64,
    cache_hits: AtomicU64,
    classifier_calls: AtomicU64,
    classifier_failures: AtomicU64,
    trade_actions_queued: AtomicU64,
    trades_created: AtomicU64,
    trades_updated: AtomicU64,
    trades_closed: AtomicU64,
    transitions_skipped: AtomicU64,
    last_event_ts: AtomicU64,
}

/// Lightweight metrics handle backed by atomics so it can be cloned cheaply.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

impl Metrics {
    fn bump(&self, counter: &AtomicU64) -> u64 {
        self.heartbeat();
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_message_processed(&self, message_id: &str, classification: &str) {
        let total = self.bump(&self.inner.messages_processed);
        info!(
            target: "metrics",
            event = "message_processed",
            message_id = %message_id,
            classification = %classification,
            total_messages = total,
            "message processed"
        );
    }

    pub fn record_cache_hit(&self, message_id: &str) {
        let total = self.bump(&self.inner.cache_hits);
        debug!(target: "metrics", event = "cache_hit", message_id = %message_id, total_hits = total);
    }

    pub fn record_classifier_call(&self, model: &str) {
        let total = self.bump(&self.inner.classifier_calls);
        debug!(target: "metrics", event = "classifier_call", model = %model, total_calls = total);
    }

    pub fn record_classifier_failure(&self, message_id: &str, reason: &str) {
        let total = self.bump(&self.inner.classifier_failures);
        info!(
            target: "metrics",
            event = "classifier_failure",
            message_id = %message_id,
            reason = %reason,
            total_failures = total,
            "classifier output unusable"
        );
    }

    pub fn record_trade_action_queued(&self, message_id: &str, classification: &str) {
        let total = self.bump(&self.inner.trade_actions_queued);
        debug!(
            target: "metrics",
            event = "trade_action_queued",
            message_id = %message_id,
            classification = %classification,
            total_actions = total
        );
    }

    pub fn record_trade_created(&self, trade_id: i64, symbol: &str) {
        let total = self.bump(&self.inner.trades_created);
        info!(
            target: "metrics",
            event = "trade_created",
            trade_id,
            symbol = %symbol,
            total_created = total,
            "trade created"
        );
    }

    pub fn record_trade_updated(&self, trade_id: i64) {
        let total = self.bump(&self.inner.trades_updated);
        info!(target: "metrics", event = "trade_updated", trade_id, total_updated = total, "trade updated");
    }

    pub fn record_trade_closed(&self, trade_id: i64) {
        let total = self.bump(&self.inner.trades_closed);
        info!(target: "metrics", event = "trade_closed", trade_id, total_closed = total, "trade closed");
    }

    pub fn record_transition_skipped(&self, analysis_id: i64, reason: &str) {
        let total = self.bump(&self.inner.transitions_skipped);
        debug!(
            target: "metrics",
            event = "transition_skipped",
            analysis_id,
            reason = %reason,
            total_skipped = total
        );
    }

    pub fn heartbeat(&self) {
        self.inner
            .last_event_ts
            .store(now_unix_secs(), Ordering::Relaxed);
    }

    pub fn is_healthy(&self, max_staleness: Duration) -> bool {
        let last = self.inner.last_event_ts.load(Ordering::Relaxed);
        if last == 0 {
            // Nothing seen yet; healthy right after startup.
            return true;
        }
        let now = now_unix_secs();
        now.saturating_sub(last) <= max_staleness.as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_processed: load(&self.inner.messages_processed),
            cache_hits: load(&self.inner.cache_hits),
            classifier_calls: load(&self.inner.classifier_calls),
            classifier_failures: load(&self.inner.classifier_failures),
            trade_actions_queued: load(&self.inner.trade_actions_queued),
            trades_created: load(&self.inner.trades_created),
            trades_updated: load(&self.inner.trades_updated),
            trades_closed: load(&self.inner.trades_closed),
            transitions_skipped: load(&self.inner.transitions_skipped),
            last_event_ts: load(&self.inner.last_event_ts),
        }
    }
}

/// Serializable view of current metrics used by dashboards and health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_processed: u64,
    pub cache_hits: u64,
    pub classifier_calls: u64,
    pub classifier_failures: u64,
    pub trade_actions_queued: u64,
    pub trades_created: u64,
    pub trades_updated: u64,
    pub trades_closed: u64,
    pub transitions_skipped: u64,
    pub last_event_ts: u64,
}

pub fn log_metrics_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        target: "metrics",
        event = "metrics_snapshot",
        messages_processed = snapshot.messages_processed,
        cache_hits = snapshot.cache_hits,
        classifier_calls = snapshot.classifier_calls,
        classifier_failures = snapshot.classifier_failures,
        trade_actions_queued = snapshot.trade_actions_queued,
        trades_created = snapshot.trades_created,
        trades_updated = snapshot.trades_updated,
        trades_closed = snapshot.trades_closed,
        transitions_skipped = snapshot.transitions_skipped,
        last_event_ts = snapshot.last_event_ts,
        "metrics snapshot"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_refresh_heartbeat() {
        let metrics = Metrics::default();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert!(metrics.is_healthy(Duration::from_secs(1)));

        metrics.record_classifier_call("grok-3-mini");
        metrics.record_classifier_call("grok-3-mini");
        metrics.record_trade_closed(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.classifier_calls, 2);
        assert_eq!(snapshot.trades_closed, 1);
        assert!(snapshot.last_event_ts > 0);
        assert!(metrics.is_healthy(Duration::from_secs(60)));
    }
}
