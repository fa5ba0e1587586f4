//! Persistence boundary.
//!
//! The pipeline only talks to the traits below. Any backend that offers a
//! unique key on the analysis message id, a unique key on the trade client
//! order id, and atomic multi-statement writes satisfies them. Postgres is
//! the production backend; [`memory::MemoryStore`] has the same semantics
//! in-process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;

use crate::domain::{
    Analysis, AuditEntry, Message, MessageRecord, NewAnalysis, NewTrade, Trade, TradeChanges,
    TradeEventType, TradeHistoryEvent,
};
use crate::types::PostgresConfig;

pub mod memory;
pub mod models;
pub mod postgres;

pub type PgPool = Pool<Postgres>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("stored row is invalid: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Connectivity failures worth retrying on a later poll cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Append-only record of chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns `false` when the id was already stored; the existing row is
    /// left untouched.
    async fn append(&self, record: &MessageRecord) -> StoreResult<bool>;

    async fn get(&self, id: &str) -> StoreResult<Option<Message>>;

    /// Direct replies to `id`, oldest first.
    async fn replies_to(&self, id: &str) -> StoreResult<Vec<Message>>;

    /// Up to `limit` messages in `channel` strictly before `before`, oldest first.
    async fn recent_in_channel(
        &self,
        channel: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Message>>;

    async fn mark_processed(&self, id: &str) -> StoreResult<()>;

    /// Up to `limit` unprocessed messages, oldest first.
    async fn unprocessed(&self, limit: usize) -> StoreResult<Vec<Message>>;
}

/// Durable classification results keyed by message id.
#[async_trait]
pub trait AnalysisCache: Send + Sync {
    async fn find_by_message(&self, message_id: &str) -> StoreResult<Option<Analysis>>;

    async fn find_by_id(&self, analysis_id: i64) -> StoreResult<Option<Analysis>>;

    /// Atomic write keyed on the message id, stamped `now`. When an analysis
    /// for the same message already exists it is returned unchanged.
    async fn store(&self, analysis: &NewAnalysis, now: DateTime<Utc>) -> StoreResult<Analysis>;
}

/// Read side of the trade history. Events are only ever written by
/// [`TradeLedger`] in the same transaction as the trade row they describe.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Events for a trade in insertion order.
    async fn history(&self, trade_id: i64) -> StoreResult<Vec<TradeHistoryEvent>>;

    async fn events_for_analysis(&self, analysis_id: i64) -> StoreResult<Vec<TradeHistoryEvent>>;

    async fn has_event(
        &self,
        trade_id: i64,
        analysis_id: i64,
        event_type: TradeEventType,
    ) -> StoreResult<bool>;
}

/// Trade rows plus their audit trail. Every mutating method writes the row
/// change and its history event atomically.
#[async_trait]
pub trait TradeLedger: AuditLog {
    async fn get_trade(&self, trade_id: i64) -> StoreResult<Option<Trade>>;

    async fn find_by_opening_analysis(&self, analysis_id: i64) -> StoreResult<Option<Trade>>;

    /// Trades in `pending_open` or `open`, newest first.
    async fn active_trades(&self) -> StoreResult<Vec<Trade>>;

    /// Inserts a `pending_open` trade and its `create` event. A duplicate
    /// client order id is reported as [`StoreError::Conflict`].
    async fn create_trade(
        &self,
        trade: &NewTrade,
        event: &AuditEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<Trade>;

    /// Applies `changes` to an active trade with an `update` event. When
    /// `close` is given the trade is closed in the same transaction and a
    /// `close` event follows the update event.
    async fn update_trade(
        &self,
        trade_id: i64,
        changes: &TradeChanges,
        event: &AuditEntry,
        close: Option<&AuditEntry>,
        now: DateTime<Utc>,
    ) -> StoreResult<Trade>;

    /// Closes an active trade with a `close` event. Returns `None` without
    /// writing anything if the trade is already closed or does not exist.
    async fn close_trade(
        &self,
        trade_id: i64,
        event: &AuditEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Trade>>;
}

/// Create a PostgreSQL connection pool using the provided config.
///
/// Connection establishment is performed eagerly so misconfiguration is
/// surfaced at startup, which is the only point where storage errors are
/// fatal.
pub async fn create_pg_pool(cfg: &PostgresConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(15))
        .connect(&cfg.url)
        .await?;
    Ok(pool)
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
