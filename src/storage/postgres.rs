//! Postgres adapters for the storage traits. Schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{query, query_as, Postgres, Transaction};

use crate::domain::{
    Analysis, AuditEntry, Message, MessageRecord, NewAnalysis, NewTrade, Trade, TradeChanges,
    TradeEventType, TradeHistoryEvent, TradeStatus,
};

use super::models::{AnalysisRow, MessageRow, TradeHistoryRow, TradeRow};
use super::{
    AnalysisCache, AuditLog, MessageStore, PgPool, StoreError, StoreResult, TradeLedger,
};

const MESSAGE_COLUMNS: &str =
    "message_id, ts, content, parent_id, channel, author, attachments, processed";

const ANALYSIS_COLUMNS: &str = "analysis_id, message_id, classification, related_trade_id, \
     reason, confidence, payload, created_at";

const TRADE_COLUMNS: &str = "trade_id, opening_analysis_id, client_order_id, symbol, option_type, \
     strike, expiration, status, quantity, target_entry_price, filled_entry_price, \
     filled_exit_price, stop_loss, take_profit, created_at, updated_at, opened_at, closed_at";

const HISTORY_COLUMNS: &str =
    "history_id, trade_id, triggering_analysis_id, event_type, details, ts";

/// Maps unique-key violations to [`StoreError::Conflict`].
fn map_write_error(err: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(format!("{what}: {}", db.message()));
        }
    }
    StoreError::Database(err)
}

/// Stores chat messages captured by the listener.
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn append(&self, record: &MessageRecord) -> StoreResult<bool> {
        let result = query(
            "INSERT INTO messages \
             (message_id, ts, content, parent_id, channel, author, attachments, processed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE) \
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(&record.id)
        .bind(record.timestamp)
        .bind(&record.content)
        .bind(&record.parent_id)
        .bind(&record.channel)
        .bind(&record.author)
        .bind(Json(&record.attachments))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = $1");
        let row: Option<MessageRow> = query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(Message::from))
    }

    async fn replies_to(&self, id: &str) -> StoreResult<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE parent_id = $1 ORDER BY ts ASC, message_id ASC"
        );
        let rows: Vec<MessageRow> = query_as(&sql).bind(id).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn recent_in_channel(
        &self,
        channel: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE channel = $1 AND ts < $2 ORDER BY ts DESC LIMIT $3"
        );
        let rows: Vec<MessageRow> = query_as(&sql)
            .bind(channel)
            .bind(before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        // Newest-first from the index scan; callers want chronological order.
        Ok(rows.into_iter().rev().map(Message::from).collect())
    }

    async fn mark_processed(&self, id: &str) -> StoreResult<()> {
        query("UPDATE messages SET processed = TRUE WHERE message_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unprocessed(&self, limit: usize) -> StoreResult<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE NOT processed ORDER BY ts ASC LIMIT $1"
        );
        let rows: Vec<MessageRow> = query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }
}

/// Classification results keyed by message id.
pub struct PgAnalysisCache {
    pool: PgPool,
}

impl PgAnalysisCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalysisCache for PgAnalysisCache {
    async fn find_by_message(&self, message_id: &str) -> StoreResult<Option<Analysis>> {
        let sql = format!("SELECT {ANALYSIS_COLUMNS} FROM message_analyses WHERE message_id = $1");
        let row: Option<AnalysisRow> = query_as(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Analysis::try_from).transpose()
    }

    async fn find_by_id(&self, analysis_id: i64) -> StoreResult<Option<Analysis>> {
        let sql = format!("SELECT {ANALYSIS_COLUMNS} FROM message_analyses WHERE analysis_id = $1");
        let row: Option<AnalysisRow> = query_as(&sql)
            .bind(analysis_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Analysis::try_from).transpose()
    }

    async fn store(&self, analysis: &NewAnalysis, now: DateTime<Utc>) -> StoreResult<Analysis> {
        let payload = serde_json::to_value(&analysis.payload)?;

        // The no-op assignment makes RETURNING yield the existing row when
        // another delivery of the same message got there first.
        let sql = format!(
            "INSERT INTO message_analyses \
             (message_id, classification, related_trade_id, reason, confidence, payload, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (message_id) DO UPDATE SET message_id = message_analyses.message_id \
             RETURNING {ANALYSIS_COLUMNS}"
        );
        let row: AnalysisRow = query_as(&sql)
            .bind(&analysis.message_id)
            .bind(analysis.classification().as_str())
            .bind(analysis.related_trade_id)
            .bind(&analysis.reason)
            .bind(analysis.confidence)
            .bind(Json(payload))
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Analysis::try_from(row)
    }
}

/// Trade rows and their audit trail.
pub struct PgTradeLedger {
    pool: PgPool,
}

impl PgTradeLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn append_event(
        tx: &mut Transaction<'_, Postgres>,
        trade_id: i64,
        event_type: TradeEventType,
        entry: &AuditEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        query(
            "INSERT INTO trade_history \
             (trade_id, triggering_analysis_id, event_type, details, ts) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(trade_id)
        .bind(entry.triggering_analysis_id)
        .bind(event_type.as_str())
        .bind(Json(&entry.details))
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_write_error(e, "trade_history"))?;
        Ok(())
    }

    async fn lock_trade(
        tx: &mut Transaction<'_, Postgres>,
        trade_id: i64,
    ) -> StoreResult<Option<Trade>> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE trade_id = $1 FOR UPDATE");
        let row: Option<TradeRow> = query_as(&sql)
            .bind(trade_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Trade::try_from).transpose()
    }

    async fn close_locked(
        tx: &mut Transaction<'_, Postgres>,
        trade_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Trade>> {
        let sql = format!(
            "UPDATE trades SET status = $2, quantity = 0, closed_at = $3, updated_at = $3 \
             WHERE trade_id = $1 AND status <> $2 \
             RETURNING {TRADE_COLUMNS}"
        );
        let row: Option<TradeRow> = query_as(&sql)
            .bind(trade_id)
            .bind(TradeStatus::Closed.as_str())
            .bind(now)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Trade::try_from).transpose()
    }
}

#[async_trait]
impl AuditLog for PgTradeLedger {
    async fn history(&self, trade_id: i64) -> StoreResult<Vec<TradeHistoryEvent>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM trade_history WHERE trade_id = $1 ORDER BY history_id ASC"
        );
        let rows: Vec<TradeHistoryRow> = query_as(&sql).bind(trade_id).fetch_all(&self.pool).await?;
        rows.into_iter().map(TradeHistoryEvent::try_from).collect()
    }

    async fn events_for_analysis(&self, analysis_id: i64) -> StoreResult<Vec<TradeHistoryEvent>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM trade_history \
             WHERE triggering_analysis_id = $1 ORDER BY history_id ASC"
        );
        let rows: Vec<TradeHistoryRow> = query_as(&sql)
            .bind(analysis_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TradeHistoryEvent::try_from).collect()
    }

    async fn has_event(
        &self,
        trade_id: i64,
        analysis_id: i64,
        event_type: TradeEventType,
    ) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM trade_history \
             WHERE trade_id = $1 AND triggering_analysis_id = $2 AND event_type = $3)",
        )
        .bind(trade_id)
        .bind(analysis_id)
        .bind(event_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl TradeLedger for PgTradeLedger {
    async fn get_trade(&self, trade_id: i64) -> StoreResult<Option<Trade>> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE trade_id = $1");
        let row: Option<TradeRow> = query_as(&sql)
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trade::try_from).transpose()
    }

    async fn find_by_opening_analysis(&self, analysis_id: i64) -> StoreResult<Option<Trade>> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE opening_analysis_id = $1");
        let row: Option<TradeRow> = query_as(&sql)
            .bind(analysis_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trade::try_from).transpose()
    }

    async fn active_trades(&self) -> StoreResult<Vec<Trade>> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE status <> 'closed' ORDER BY created_at DESC, trade_id DESC"
        );
        let rows: Vec<TradeRow> = query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    async fn create_trade(
        &self,
        trade: &NewTrade,
        event: &AuditEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<Trade> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO trades \
             (opening_analysis_id, client_order_id, symbol, option_type, strike, expiration, \
              status, quantity, target_entry_price, stop_loss, take_profit, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12) \
             RETURNING {TRADE_COLUMNS}"
        );
        let row: TradeRow = query_as(&sql)
            .bind(trade.opening_analysis_id)
            .bind(&trade.client_order_id)
            .bind(&trade.symbol)
            .bind(trade.option_type.as_str())
            .bind(trade.strike)
            .bind(trade.expiration)
            .bind(TradeStatus::PendingOpen.as_str())
            .bind(trade.quantity)
            .bind(trade.target_entry_price)
            .bind(trade.stop_loss)
            .bind(trade.take_profit)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, "trades"))?;
        let created = Trade::try_from(row)?;

        Self::append_event(&mut tx, created.id, TradeEventType::Create, event, now).await?;
        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_trade(&mut tx, trade_id)
            .await?
            .filter(|t| t.status.is_active())
            .ok_or_else(|| StoreError::Conflict(format!("trade {trade_id} is not active")))?;

        let sql = format!(
            "UPDATE trades SET \
             stop_loss = COALESCE($2, stop_loss), \
             take_profit = COALESCE($3, take_profit), \
             quantity = COALESCE($4, quantity), \
             updated_at = $5 \
             WHERE trade_id = $1 \
             RETURNING {TRADE_COLUMNS}"
        );
        let row: TradeRow = query_as(&sql)
            .bind(current.id)
            .bind(changes.stop_loss)
            .bind(changes.take_profit)
            .bind(changes.quantity)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let mut updated = Trade::try_from(row)?;
        Self::append_event(&mut tx, trade_id, TradeEventType::Update, event, now).await?;

        if let Some(close_entry) = close {
            if let Some(closed) = Self::close_locked(&mut tx, trade_id, now).await? {
                Self::append_event(&mut tx, trade_id, TradeEventType::Close, close_entry, now)
                    .await?;
                updated = closed;
            }
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn close_trade(
        &self,
        trade_id: i64,
        event: &AuditEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Trade>> {
        let mut tx = self.pool.begin().await?;

        let closed = Self::close_locked(&mut tx, trade_id, now).await?;
        if let Some(trade) = &closed {
            Self::append_event(&mut tx, trade.id, TradeEventType::Close, event, now).await?;
        }

        tx.commit().await?;
        Ok(closed)
    }
}
