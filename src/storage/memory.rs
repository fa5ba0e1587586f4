//! In-process implementation of every storage trait.
//!
//! Holds all tables behind one lock so each method is atomic the same way a
//! database transaction would be. Used by the test suite and for dry runs
//! without Postgres.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::{
    Analysis, AuditEntry, Message, MessageRecord, NewAnalysis, NewTrade, Trade, TradeChanges,
    TradeEventType, TradeHistoryEvent, TradeStatus,
};

use super::{
    AnalysisCache, AuditLog, MessageStore, StoreError, StoreResult, TradeLedger,
};

#[derive(Default)]
struct Tables {
    messages: BTreeMap<String, Message>,
    analyses: BTreeMap<i64, Analysis>,
    trades: BTreeMap<i64, Trade>,
    history: Vec<TradeHistoryEvent>,
    next_analysis_id: i64,
    next_trade_id: i64,
    next_history_id: i64,
}

impl Tables {
    fn analysis_for_message(&self, message_id: &str) -> Option<&Analysis> {
        self.analyses.values().find(|a| a.message_id == message_id)
    }

    fn has_event(&self, trade_id: i64, analysis_id: i64, event_type: TradeEventType) -> bool {
        self.history.iter().any(|e| {
            e.trade_id == trade_id
                && e.triggering_analysis_id == analysis_id
                && e.event_type == event_type
        })
    }

    fn push_event(
        &mut self,
        trade_id: i64,
        event_type: TradeEventType,
        entry: &AuditEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        if self.has_event(trade_id, entry.triggering_analysis_id, event_type) {
            return Err(StoreError::Conflict(format!(
                "trade_history: {event_type} for trade {trade_id} by analysis {} already recorded",
                entry.triggering_analysis_id
            )));
        }
        self.next_history_id += 1;
        self.history.push(TradeHistoryEvent {
            id: self.next_history_id,
            trade_id,
            triggering_analysis_id: entry.triggering_analysis_id,
            event_type,
            details: entry.details.clone(),
            timestamp: now,
        });
        Ok(())
    }
}

fn close_in_place(trade: &mut Trade, now: DateTime<Utc>) {
    trade.status = TradeStatus::Closed;
    trade.quantity = 0;
    trade.closed_at = Some(now);
    trade.updated_at = now;
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored analyses, across all messages.
    pub fn analysis_count(&self) -> usize {
        self.tables.lock().analyses.len()
    }

    /// Every trade regardless of status, in id order.
    pub fn all_trades(&self) -> Vec<Trade> {
        self.tables.lock().trades.values().cloned().collect()
    }

    /// Every history event in insertion order.
    pub fn all_events(&self) -> Vec<TradeHistoryEvent> {
        self.tables.lock().history.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, record: &MessageRecord) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        if tables.messages.contains_key(&record.id) {
            return Ok(false);
        }
        tables
            .messages
            .insert(record.id.clone(), Message::from(record.clone()));
        Ok(true)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Message>> {
        Ok(self.tables.lock().messages.get(id).cloned())
    }

    async fn replies_to(&self, id: &str) -> StoreResult<Vec<Message>> {
        let tables = self.tables.lock();
        let mut replies: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.parent_id.as_deref() == Some(id))
            .cloned()
            .collect();
        replies.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(replies)
    }

    async fn recent_in_channel(
        &self,
        channel: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let tables = self.tables.lock();
        let mut earlier: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.channel == channel && m.timestamp < before)
            .cloned()
            .collect();
        earlier.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let skip = earlier.len().saturating_sub(limit);
        Ok(earlier.into_iter().skip(skip).collect())
    }

    async fn mark_processed(&self, id: &str) -> StoreResult<()> {
        if let Some(message) = self.tables.lock().messages.get_mut(id) {
            message.processed = true;
        }
        Ok(())
    }

    async fn unprocessed(&self, limit: usize) -> StoreResult<Vec<Message>> {
        let tables = self.tables.lock();
        let mut pending: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| !m.processed)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        pending.truncate(limit);
        Ok(pending)
    }
}

#[async_trait]
impl AnalysisCache for MemoryStore {
    async fn find_by_message(&self, message_id: &str) -> StoreResult<Option<Analysis>> {
        Ok(self.tables.lock().analysis_for_message(message_id).cloned())
    }

    async fn find_by_id(&self, analysis_id: i64) -> StoreResult<Option<Analysis>> {
        Ok(self.tables.lock().analyses.get(&analysis_id).cloned())
    }

    async fn store(&self, analysis: &NewAnalysis, now: DateTime<Utc>) -> StoreResult<Analysis> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.analysis_for_message(&analysis.message_id) {
            return Ok(existing.clone());
        }

        tables.next_analysis_id += 1;
        let stored = Analysis {
            id: tables.next_analysis_id,
            message_id: analysis.message_id.clone(),
            classification: analysis.classification(),
            related_trade_id: analysis.related_trade_id,
            reason: analysis.reason.clone(),
            confidence: analysis.confidence,
            payload: analysis.payload.clone(),
            created_at: now,
        };
        tables.analyses.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn history(&self, trade_id: i64) -> StoreResult<Vec<TradeHistoryEvent>> {
        let tables = self.tables.lock();
        Ok(tables
            .history
            .iter()
            .filter(|e| e.trade_id == trade_id)
            .cloned()
            .collect())
    }

    async fn events_for_analysis(&self, analysis_id: i64) -> StoreResult<Vec<TradeHistoryEvent>> {
        let tables = self.tables.lock();
        Ok(tables
            .history
            .iter()
            .filter(|e| e.triggering_analysis_id == analysis_id)
            .cloned()
            .collect())
    }

    async fn has_event(
        &self,
        trade_id: i64,
        analysis_id: i64,
        event_type: TradeEventType,
    ) -> StoreResult<bool> {
        Ok(self.tables.lock().has_event(trade_id, analysis_id, event_type))
    }
}

#[async_trait]
impl TradeLedger for MemoryStore {
    async fn get_trade(&self, trade_id: i64) -> StoreResult<Option<Trade>> {
        Ok(self.tables.lock().trades.get(&trade_id).cloned())
    }

    async fn find_by_opening_analysis(&self, analysis_id: i64) -> StoreResult<Option<Trade>> {
        let tables = self.tables.lock();
        Ok(tables
            .trades
            .values()
            .find(|t| t.opening_analysis_id == analysis_id)
            .cloned())
    }

    async fn active_trades(&self) -> StoreResult<Vec<Trade>> {
        let tables = self.tables.lock();
        Ok(tables
            .trades
            .values()
            .rev()
            .filter(|t| t.status.is_active())
            .cloned()
            .collect())
    }

    async fn create_trade(
        &self,
        trade: &NewTrade,
        event: &AuditEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<Trade> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.trades.values().find(|t| {
            t.client_order_id == trade.client_order_id
                || t.opening_analysis_id == trade.opening_analysis_id
        }) {
            return Err(StoreError::Conflict(format!(
                "trades: collides with trade {}",
                existing.id
            )));
        }

        tables.next_trade_id += 1;
        let created = Trade {
            id: tables.next_trade_id,
            opening_analysis_id: trade.opening_analysis_id,
            client_order_id: trade.client_order_id.clone(),
            symbol: trade.symbol.clone(),
            option_type: trade.option_type,
            strike: trade.strike,
            expiration: trade.expiration,
            status: TradeStatus::PendingOpen,
            quantity: trade.quantity,
            target_entry_price: trade.target_entry_price,
            filled_entry_price: None,
            filled_exit_price: None,
            stop_loss: trade.stop_loss,
            take_profit: trade.take_profit,
            created_at: now,
            updated_at: now,
            opened_at: None,
            closed_at: None,
        };
        tables.push_event(created.id, TradeEventType::Create, event, now)?;
        tables.trades.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_trade(
        &self,
        trade_id: i64,
        changes: &TradeChanges,
        event: &AuditEntry,
        close: Option<&AuditEntry>,
        now: DateTime<Utc>,
    ) -> StoreResult<Trade> {
        let mut tables = self.tables.lock();
        let mut trade = tables
            .trades
            .get(&trade_id)
            .filter(|t| t.status.is_active())
            .cloned()
            .ok_or_else(|| StoreError::Conflict(format!("trade {trade_id} is not active")))?;

        if let Some(quantity) = changes.quantity {
            if quantity < 0 {
                return Err(StoreError::Conflict(format!(
                    "trade {trade_id}: quantity {quantity} violates quantity >= 0"
                )));
            }
            trade.quantity = quantity;
        }
        if let Some(stop_loss) = changes.stop_loss {
            trade.stop_loss = Some(stop_loss);
        }
        if let Some(take_profit) = changes.take_profit {
            trade.take_profit = Some(take_profit);
        }
        trade.updated_at = now;

        // Validate both events before touching any table so a failure
        // leaves nothing behind.
        let close_dup = close
            .map(|c| tables.has_event(trade_id, c.triggering_analysis_id, TradeEventType::Close))
            .unwrap_or(false);
        if close_dup {
            return Err(StoreError::Conflict(format!(
                "trade_history: close for trade {trade_id} already recorded"
            )));
        }
        tables.push_event(trade_id, TradeEventType::Update, event, now)?;
        if let Some(close_entry) = close {
            close_in_place(&mut trade, now);
            tables.push_event(trade_id, TradeEventType::Close, close_entry, now)?;
        }

        tables.trades.insert(trade_id, trade.clone());
        Ok(trade)
    }

    async fn close_trade(
        &self,
        trade_id: i64,
        event: &AuditEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Trade>> {
        let mut tables = self.tables.lock();
        let Some(mut trade) = tables
            .trades
            .get(&trade_id)
            .filter(|t| t.status.is_active())
            .cloned()
        else {
            return Ok(None);
        };

        tables.push_event(trade_id, TradeEventType::Close, event, now)?;
        close_in_place(&mut trade, now);
        tables.trades.insert(trade_id, trade.clone());
        Ok(Some(trade))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;
    use crate::domain::{AnalysisPayload, OptionType};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn record(id: &str, ts: &str, channel: &str) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            timestamp: at(ts),
            content: format!("message {id}"),
            parent_id: None,
            channel: channel.to_string(),
            author: "desk".to_string(),
            attachments: Vec::new(),
        }
    }

    fn new_trade(analysis_id: i64, client_order_id: &str) -> NewTrade {
        NewTrade {
            opening_analysis_id: analysis_id,
            client_order_id: client_order_id.to_string(),
            symbol: "SPY".to_string(),
            option_type: OptionType::Put,
            strike: 500.0,
            expiration: NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            quantity: 5,
            target_entry_price: None,
            stop_loss: None,
            take_profit: None,
        }
    }

    fn entry(analysis_id: i64) -> AuditEntry {
        AuditEntry {
            triggering_analysis_id: analysis_id,
            details: json!({}),
        }
    }

    #[tokio::test]
    async fn duplicate_message_append_is_ignored() {
        let store = MemoryStore::new();
        assert!(store.append(&record("1", "2024-03-04T14:00:00Z", "a")).await.unwrap());
        let mut again = record("1", "2024-03-04T15:00:00Z", "a");
        again.content = "edited".to_string();
        assert!(!store.append(&again).await.unwrap());
        assert_eq!(store.get("1").await.unwrap().unwrap().content, "message 1");
    }

    #[tokio::test]
    async fn recent_in_channel_keeps_latest_prior_messages_in_order() {
        let store = MemoryStore::new();
        for (id, ts) in [
            ("1", "2024-03-04T14:00:00Z"),
            ("2", "2024-03-04T14:01:00Z"),
            ("3", "2024-03-04T14:02:00Z"),
            ("4", "2024-03-04T14:03:00Z"),
        ] {
            store.append(&record(id, ts, "alerts")).await.unwrap();
        }
        store
            .append(&record("x", "2024-03-04T14:02:30Z", "chatter"))
            .await
            .unwrap();

        let recent = store
            .recent_in_channel("alerts", at("2024-03-04T14:03:00Z"), 2)
            .await
            .unwrap();
        let ids: Vec<_> = recent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn analysis_store_keeps_first_writer() {
        let store = MemoryStore::new();
        let stamped = at("2024-03-04T14:00:00Z");
        let first = store
            .store(&NewAnalysis::other("m1", "first"), stamped)
            .await
            .unwrap();
        assert_eq!(first.created_at, stamped);
        let mut second = NewAnalysis::other("m1", "second");
        second.payload = AnalysisPayload::Irrelevant;
        let again = store
            .store(&second, at("2024-03-04T15:00:00Z"))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(store.analysis_count(), 1);
    }

    #[tokio::test]
    async fn client_order_id_collision_is_a_conflict() {
        let store = MemoryStore::new();
        let now = at("2024-03-04T14:00:00Z");
        store
            .create_trade(&new_trade(1, "bot-a"), &entry(1), now)
            .await
            .unwrap();
        let err = store
            .create_trade(&new_trade(2, "bot-a"), &entry(2), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.all_trades().len(), 1);
        assert_eq!(store.all_events().len(), 1);
    }

    #[tokio::test]
    async fn close_trade_is_idempotent() {
        let store = MemoryStore::new();
        let t0 = at("2024-03-04T14:00:00Z");
        let trade = store
            .create_trade(&new_trade(1, "bot-a"), &entry(1), t0)
            .await
            .unwrap();

        let t1 = at("2024-03-04T15:00:00Z");
        let closed = store.close_trade(trade.id, &entry(2), t1).await.unwrap().unwrap();
        assert_eq!(closed.closed_at, Some(t1));

        let t2 = at("2024-03-04T16:00:00Z");
        assert!(store.close_trade(trade.id, &entry(3), t2).await.unwrap().is_none());
        let stored = store.get_trade(trade.id).await.unwrap().unwrap();
        assert_eq!(stored.closed_at, Some(t1));
        assert_eq!(store.history(trade.id).await.unwrap().len(), 2);
    }
}
