//! Trade state machine: turns a stored analysis into at most one trade
//! mutation plus its audit events.
//!
//! Trades move `pending_open | open -> closed` and never back. Every path
//! is safe to run again for the same analysis: duplicates come back as
//! [`Skip::AlreadyApplied`] or [`Skip::TradeAlreadyClosed`], never as a
//! second mutation.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{
    Analysis, AnalysisPayload, AuditEntry, Classification, NewTrade, NewTradeSignal, Trade,
    TradeChanges, TradeCloseSignal, TradeEventType, TradeUpdateSignal,
};
use crate::storage::{AuditLog, StoreError, TradeLedger};
use crate::utils::Clock;

pub mod sizing;

pub use sizing::{apply_delta, parse_quantity_delta, Sizing};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("store error: {0}")]
    Store(StoreError),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Store(err) => err.is_transient(),
            LedgerError::Conflict(_) => false,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => LedgerError::Conflict(msg),
            other => LedgerError::Store(other),
        }
    }
}

/// Why an analysis left the ledger untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Skip {
    NotActionable(Classification),
    MissingRelatedTrade,
    TradeNotFound(i64),
    TradeAlreadyClosed(i64),
    NoChanges(i64),
    AlreadyApplied,
}

impl Skip {
    pub fn as_str(&self) -> &'static str {
        match self {
            Skip::NotActionable(_) => "not_actionable",
            Skip::MissingRelatedTrade => "missing_related_trade",
            Skip::TradeNotFound(_) => "trade_not_found",
            Skip::TradeAlreadyClosed(_) => "trade_already_closed",
            Skip::NoChanges(_) => "no_changes",
            Skip::AlreadyApplied => "already_applied",
        }
    }
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Skip::NotActionable(c) => write!(f, "{c} is not actionable"),
            Skip::MissingRelatedTrade => f.write_str("no related trade id"),
            Skip::TradeNotFound(id) => write!(f, "trade {id} not found"),
            Skip::TradeAlreadyClosed(id) => write!(f, "trade {id} already closed"),
            Skip::NoChanges(id) => write!(f, "no changes for trade {id}"),
            Skip::AlreadyApplied => f.write_str("analysis already applied"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    Created(Trade),
    /// `closed` is set when the update took the quantity to zero and the
    /// trade was closed in the same transaction.
    Updated { trade: Trade, closed: bool },
    Closed(Trade),
    Skipped(Skip),
}

pub struct TradeStateMachine {
    ledger: Arc<dyn TradeLedger>,
    clock: Arc<dyn Clock>,
}

impl TradeStateMachine {
    pub fn new(ledger: Arc<dyn TradeLedger>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    pub async fn apply(&self, analysis: &Analysis) -> Result<Transition, LedgerError> {
        let transition = match &analysis.payload {
            AnalysisPayload::NewTrade(signal) => self.create(analysis, signal).await?,
            AnalysisPayload::TradeUpdate(signal) => self.update(analysis, signal).await?,
            AnalysisPayload::TradeClose(signal) => self.close(analysis, signal).await?,
            AnalysisPayload::Irrelevant | AnalysisPayload::Other => {
                Transition::Skipped(Skip::NotActionable(analysis.classification))
            }
        };

        if let Transition::Skipped(skip) = &transition {
            info!(
                target: "trade_manager",
                analysis_id = analysis.id,
                message_id = %analysis.message_id,
                reason = skip.as_str(),
                "skipped: {skip}"
            );
        }
        Ok(transition)
    }

    async fn create(&self, analysis: &Analysis, signal: &NewTradeSignal) -> Result<Transition, LedgerError> {
        if self.ledger.find_by_opening_analysis(analysis.id).await?.is_some() {
            return Ok(Transition::Skipped(Skip::AlreadyApplied));
        }

        let trade = NewTrade {
            opening_analysis_id: analysis.id,
            client_order_id: format!("bot-{}", Uuid::new_v4()),
            symbol: signal.ticker.clone(),
            option_type: signal.option_type,
            strike: signal.strike_price,
            expiration: signal.expiration_date,
            quantity: Sizing::from_hint(signal.sizing.as_deref()).quantity(),
            target_entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
        };
        let event = AuditEntry {
            triggering_analysis_id: analysis.id,
            details: json!({
                "reason": analysis.reason,
                "confidence": analysis.confidence,
                "full_payload": analysis.payload,
            }),
        };

        match self.ledger.create_trade(&trade, &event, self.clock.now()).await {
            Ok(created) => {
                info!(
                    target: "trade_manager",
                    trade_id = created.id,
                    analysis_id = analysis.id,
                    client_order_id = %created.client_order_id,
                    symbol = %created.symbol,
                    quantity = created.quantity,
                    "opened trade"
                );
                Ok(Transition::Created(created))
            }
            Err(StoreError::Conflict(msg)) => {
                // A concurrent delivery of the same analysis may have won.
                if self.ledger.find_by_opening_analysis(analysis.id).await?.is_some() {
                    return Ok(Transition::Skipped(Skip::AlreadyApplied));
                }
                warn!(target: "trade_manager", analysis_id = analysis.id, error = %msg, "trade insert conflict");
                Err(LedgerError::Conflict(msg))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Loads the trade an update or close refers to, or the reason to skip.
    async fn target_trade(&self, analysis: &Analysis) -> Result<Result<Trade, Skip>, LedgerError> {
        let Some(trade_id) = analysis.related_trade_id else {
            return Ok(Err(Skip::MissingRelatedTrade));
        };
        let Some(trade) = self.ledger.get_trade(trade_id).await? else {
            return Ok(Err(Skip::TradeNotFound(trade_id)));
        };
        if !trade.status.is_active() {
            return Ok(Err(Skip::TradeAlreadyClosed(trade_id)));
        }
        Ok(Ok(trade))
    }

    async fn update(&self, analysis: &Analysis, signal: &TradeUpdateSignal) -> Result<Transition, LedgerError> {
        let trade = match self.target_trade(analysis).await? {
            Ok(trade) => trade,
            Err(skip) => return Ok(Transition::Skipped(skip)),
        };
        if self
            .ledger
            .has_event(trade.id, analysis.id, TradeEventType::Update)
            .await?
        {
            return Ok(Transition::Skipped(Skip::AlreadyApplied));
        }

        let (changes, diff) = plan_update(&trade, signal);
        if changes.is_empty() {
            return Ok(Transition::Skipped(Skip::NoChanges(trade.id)));
        }

        let event = AuditEntry {
            triggering_analysis_id: analysis.id,
            details: json!({
                "changes": diff,
                "reason": analysis.reason,
                "confidence": analysis.confidence,
                "instruction": signal.details,
            }),
        };
        let close = (changes.quantity == Some(0)).then(|| AuditEntry {
            triggering_analysis_id: analysis.id,
            details: json!({
                "reason": "quantity reached zero after update",
                "confidence": analysis.confidence,
                "instruction": signal.details,
            }),
        });

        let updated = match self
            .ledger
            .update_trade(trade.id, &changes, &event, close.as_ref(), self.clock.now())
            .await
        {
            Ok(updated) => updated,
            Err(StoreError::Conflict(msg)) => {
                return self.explain_update_conflict(trade.id, analysis.id, msg).await;
            }
            Err(err) => return Err(err.into()),
        };
        let closed = close.is_some();
        info!(
            target: "trade_manager",
            trade_id = updated.id,
            analysis_id = analysis.id,
            quantity = updated.quantity,
            closed,
            "updated trade"
        );
        Ok(Transition::Updated {
            trade: updated,
            closed,
        })
    }

    /// An update lost a race after its checks passed: either a concurrent
    /// delivery applied it or the trade was closed underneath it.
    async fn explain_update_conflict(
        &self,
        trade_id: i64,
        analysis_id: i64,
        msg: String,
    ) -> Result<Transition, LedgerError> {
        if self
            .ledger
            .has_event(trade_id, analysis_id, TradeEventType::Update)
            .await?
        {
            return Ok(Transition::Skipped(Skip::AlreadyApplied));
        }
        let closed = self
            .ledger
            .history(trade_id)
            .await?
            .iter()
            .any(|e| e.event_type == TradeEventType::Close);
        if closed {
            return Ok(Transition::Skipped(Skip::TradeAlreadyClosed(trade_id)));
        }
        warn!(target: "trade_manager", trade_id, analysis_id, error = %msg, "trade update conflict");
        Err(LedgerError::Conflict(msg))
    }

    async fn close(&self, analysis: &Analysis, signal: &TradeCloseSignal) -> Result<Transition, LedgerError> {
        let trade = match self.target_trade(analysis).await? {
            Ok(trade) => trade,
            Err(skip) => return Ok(Transition::Skipped(skip)),
        };

        let event = AuditEntry {
            triggering_analysis_id: analysis.id,
            details: json!({
                "reason": analysis.reason,
                "confidence": analysis.confidence,
                "details": signal.details,
                "full_payload": analysis.payload,
            }),
        };
        match self.ledger.close_trade(trade.id, &event, self.clock.now()).await? {
            Some(closed) => {
                info!(target: "trade_manager", trade_id = closed.id, analysis_id = analysis.id, "closed trade");
                Ok(Transition::Closed(closed))
            }
            None => Ok(Transition::Skipped(Skip::TradeAlreadyClosed(trade.id))),
        }
    }
}

/// Field changes for `trade` plus the `{field: {old, new}}` diff recorded in
/// the audit event. Unchanged values are left out of both.
fn plan_update(trade: &Trade, signal: &TradeUpdateSignal) -> (TradeChanges, Map<String, Value>) {
    let mut changes = TradeChanges::default();
    let mut diff = Map::new();

    if let Some(new) = signal.stop_loss.filter(|v| Some(*v) != trade.stop_loss) {
        changes.stop_loss = Some(new);
        diff.insert("stop_loss".into(), json!({ "old": trade.stop_loss, "new": new }));
    }
    if let Some(new) = signal.take_profit.filter(|v| Some(*v) != trade.take_profit) {
        changes.take_profit = Some(new);
        diff.insert("take_profit".into(), json!({ "old": trade.take_profit, "new": new }));
    }

    let delta = signal
        .details
        .as_deref()
        .map_or(0, |d| parse_quantity_delta(d, trade.quantity));
    let quantity = apply_delta(trade.quantity, delta);
    if quantity != trade.quantity {
        changes.quantity = Some(quantity);
        diff.insert("quantity".into(), json!({ "old": trade.quantity, "new": quantity }));
    }

    (changes, diff)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, Utc};

    use super::*;
    use crate::domain::{OptionType, TradeHistoryEvent, TradeStatus};
    use crate::storage::memory::MemoryStore;
    use crate::storage::StoreResult;
    use crate::utils::FixedClock;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-06T15:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn analysis(id: i64, related: Option<i64>, payload: AnalysisPayload) -> Analysis {
        Analysis {
            id,
            message_id: format!("m{id}"),
            classification: payload.classification(),
            related_trade_id: related,
            reason: "test".to_string(),
            confidence: Some(8.0),
            payload,
            created_at: now(),
        }
    }

    fn open_signal(sizing: Option<&str>) -> AnalysisPayload {
        AnalysisPayload::NewTrade(NewTradeSignal {
            ticker: "AAPL".to_string(),
            option_type: OptionType::Call,
            strike_price: 150.0,
            expiration_date: NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            sizing: sizing.map(str::to_string),
            entry_price: None,
            stop_loss: Some(1.5),
            take_profit: None,
        })
    }

    fn update_signal(details: &str) -> AnalysisPayload {
        AnalysisPayload::TradeUpdate(TradeUpdateSignal {
            details: Some(details.to_string()),
            ..TradeUpdateSignal::default()
        })
    }

    /// Serves a fixed trade snapshot from `get_trade`, as a reader that
    /// loaded the row just before another writer changed it would see.
    struct StaleRead {
        inner: Arc<MemoryStore>,
        snapshot: Trade,
    }

    #[async_trait]
    impl AuditLog for StaleRead {
        async fn history(&self, trade_id: i64) -> StoreResult<Vec<TradeHistoryEvent>> {
            self.inner.history(trade_id).await
        }

        async fn events_for_analysis(&self, analysis_id: i64) -> StoreResult<Vec<TradeHistoryEvent>> {
            self.inner.events_for_analysis(analysis_id).await
        }

        async fn has_event(
            &self,
            trade_id: i64,
            analysis_id: i64,
            event_type: TradeEventType,
        ) -> StoreResult<bool> {
            self.inner.has_event(trade_id, analysis_id, event_type).await
        }
    }

    #[async_trait]
    impl TradeLedger for StaleRead {
        async fn get_trade(&self, _trade_id: i64) -> StoreResult<Option<Trade>> {
            Ok(Some(self.snapshot.clone()))
        }

        async fn find_by_opening_analysis(&self, analysis_id: i64) -> StoreResult<Option<Trade>> {
            self.inner.find_by_opening_analysis(analysis_id).await
        }

        async fn active_trades(&self) -> StoreResult<Vec<Trade>> {
            self.inner.active_trades().await
        }

        async fn create_trade(
            &self,
            trade: &NewTrade,
            event: &AuditEntry,
            now: DateTime<Utc>,
        ) -> StoreResult<Trade> {
            self.inner.create_trade(trade, event, now).await
        }

        async fn update_trade(
            &self,
            trade_id: i64,
            changes: &TradeChanges,
            event: &AuditEntry,
            close: Option<&AuditEntry>,
            now: DateTime<Utc>,
        ) -> StoreResult<Trade> {
            self.inner.update_trade(trade_id, changes, event, close, now).await
        }

        async fn close_trade(
            &self,
            trade_id: i64,
            event: &AuditEntry,
            now: DateTime<Utc>,
        ) -> StoreResult<Option<Trade>> {
            self.inner.close_trade(trade_id, event, now).await
        }
    }

    fn machine() -> (Arc<MemoryStore>, TradeStateMachine) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(now()));
        let sm = TradeStateMachine::new(store.clone(), clock);
        (store, sm)
    }

    async fn open(sm: &TradeStateMachine, analysis_id: i64, sizing: Option<&str>) -> Trade {
        match sm.apply(&analysis(analysis_id, None, open_signal(sizing))).await.unwrap() {
            Transition::Created(trade) => trade,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_opens_pending_trade_with_audit_event() {
        let (store, sm) = machine();
        let trade = open(&sm, 1, Some("medium")).await;

        assert_eq!(trade.status, TradeStatus::PendingOpen);
        assert_eq!(trade.quantity, 5);
        assert_eq!(trade.stop_loss, Some(1.5));
        assert!(trade.client_order_id.starts_with("bot-"));

        let history = store.history(trade.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, TradeEventType::Create);
        assert_eq!(history[0].triggering_analysis_id, 1);
        assert_eq!(history[0].details["full_payload"]["ticker"], "AAPL");
    }

    #[tokio::test]
    async fn redelivered_new_trade_is_skipped() {
        let (store, sm) = machine();
        open(&sm, 1, None).await;
        let again = sm.apply(&analysis(1, None, open_signal(None))).await.unwrap();
        assert_eq!(again, Transition::Skipped(Skip::AlreadyApplied));
        assert_eq!(store.all_trades().len(), 1);
    }

    #[tokio::test]
    async fn update_without_resolvable_trade_is_noop() {
        let (store, sm) = machine();
        let missing = sm.apply(&analysis(2, None, update_signal("trim 50%"))).await.unwrap();
        assert_eq!(missing, Transition::Skipped(Skip::MissingRelatedTrade));

        let unknown = sm.apply(&analysis(3, Some(99), update_signal("trim 50%"))).await.unwrap();
        assert_eq!(unknown, Transition::Skipped(Skip::TradeNotFound(99)));
        assert!(store.all_events().is_empty());
    }

    #[tokio::test]
    async fn trim_half_records_quantity_diff() {
        let (store, sm) = machine();
        let trade = open(&sm, 1, Some("large")).await;

        let result = sm
            .apply(&analysis(2, Some(trade.id), update_signal("trim 50%")))
            .await
            .unwrap();
        let Transition::Updated { trade: updated, closed } = result else {
            panic!("expected Updated");
        };
        assert!(!closed);
        assert_eq!(updated.quantity, 5);

        let history = store.history(trade.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1].details["changes"]["quantity"],
            json!({ "old": 10, "new": 5 })
        );
    }

    #[tokio::test]
    async fn unchanged_stop_loss_is_no_change() {
        let (store, sm) = machine();
        let trade = open(&sm, 1, None).await;
        let same_stop = AnalysisPayload::TradeUpdate(TradeUpdateSignal {
            details: Some("holding".to_string()),
            stop_loss: Some(1.5),
            take_profit: None,
        });
        let result = sm.apply(&analysis(2, Some(trade.id), same_stop)).await.unwrap();
        assert_eq!(result, Transition::Skipped(Skip::NoChanges(trade.id)));
        assert_eq!(store.history(trade.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_to_zero_closes_in_same_step() {
        let (store, sm) = machine();
        let trade = open(&sm, 1, None).await;

        let result = sm
            .apply(&analysis(2, Some(trade.id), update_signal("trim 100%")))
            .await
            .unwrap();
        let Transition::Updated { trade: updated, closed } = result else {
            panic!("expected Updated");
        };
        assert!(closed);
        assert_eq!(updated.status, TradeStatus::Closed);
        assert_eq!(updated.quantity, 0);
        assert_eq!(updated.closed_at, Some(now()));

        let events = store.events_for_analysis(2).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![TradeEventType::Update, TradeEventType::Close]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (store, sm) = machine();
        let trade = open(&sm, 1, None).await;
        let close = AnalysisPayload::TradeClose(TradeCloseSignal::default());

        let first = sm.apply(&analysis(2, Some(trade.id), close.clone())).await.unwrap();
        let Transition::Closed(closed) = first else {
            panic!("expected Closed");
        };

        let second = sm.apply(&analysis(3, Some(trade.id), close)).await.unwrap();
        assert_eq!(second, Transition::Skipped(Skip::TradeAlreadyClosed(trade.id)));

        let reloaded = store.get_trade(trade.id).await.unwrap().unwrap();
        assert_eq!(reloaded.closed_at, closed.closed_at);
        assert_eq!(store.history(trade.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_racing_a_close_is_skipped() {
        let (store, sm) = machine();
        let trade = open(&sm, 1, Some("large")).await;
        let stale = TradeStateMachine::new(
            Arc::new(StaleRead {
                inner: store.clone(),
                snapshot: trade.clone(),
            }),
            Arc::new(FixedClock::new(now())),
        );

        let close = AnalysisPayload::TradeClose(TradeCloseSignal::default());
        sm.apply(&analysis(2, Some(trade.id), close.clone())).await.unwrap();

        let update = stale
            .apply(&analysis(3, Some(trade.id), update_signal("trim 50%")))
            .await
            .unwrap();
        assert_eq!(update, Transition::Skipped(Skip::TradeAlreadyClosed(trade.id)));

        let late_close = stale.apply(&analysis(4, Some(trade.id), close)).await.unwrap();
        assert_eq!(late_close, Transition::Skipped(Skip::TradeAlreadyClosed(trade.id)));

        let kinds: Vec<_> = store
            .history(trade.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![TradeEventType::Create, TradeEventType::Close]);
    }

    #[tokio::test]
    async fn irrelevant_is_not_actionable() {
        let (_, sm) = machine();
        let result = sm.apply(&analysis(5, None, AnalysisPayload::Irrelevant)).await.unwrap();
        assert_eq!(
            result,
            Transition::Skipped(Skip::NotActionable(Classification::Irrelevant))
        );
    }
}
