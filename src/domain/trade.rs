use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::UnknownVariant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "CALL",
            OptionType::Put => "PUT",
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionType {
    type Err = UnknownVariant;

    /// Accepts the loose spellings seen in chat: `CALLS`, `call`, `C`, `puts`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CALL" | "CALLS" | "C" => Ok(OptionType::Call),
            "PUT" | "PUTS" | "P" => Ok(OptionType::Put),
            _ => Err(UnknownVariant::new("option type", s)),
        }
    }
}

/// Lifecycle of a trade. `Closed` is absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    PendingOpen,
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::PendingOpen => "pending_open",
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }

    /// Pending and open trades are equally eligible for updates and closes.
    pub fn is_active(&self) -> bool {
        !matches!(self, TradeStatus::Closed)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_open" => Ok(TradeStatus::PendingOpen),
            "open" => Ok(TradeStatus::Open),
            "closed" => Ok(TradeStatus::Closed),
            _ => Err(UnknownVariant::new("trade status", s)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub opening_analysis_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub status: TradeStatus,
    pub quantity: i64,
    pub target_entry_price: Option<f64>,
    pub filled_entry_price: Option<f64>,
    pub filled_exit_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Row inserted by the `create` transition.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTrade {
    pub opening_analysis_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub quantity: i64,
    pub target_entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// New values for the mutable fields of an active trade; `None` leaves a
/// field untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TradeChanges {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub quantity: Option<i64>,
}

impl TradeChanges {
    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none() && self.take_profit.is_none() && self.quantity.is_none()
    }
}

/// Compact view of an active trade handed to the classifier as context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeSummary {
    pub trade_id: i64,
    pub symbol: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub status: TradeStatus,
    pub quantity: i64,
}

impl From<&Trade> for TradeSummary {
    fn from(trade: &Trade) -> Self {
        Self {
            trade_id: trade.id,
            symbol: trade.symbol.clone(),
            option_type: trade.option_type,
            strike: trade.strike,
            expiration: trade.expiration,
            status: trade.status,
            quantity: trade.quantity,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeEventType {
    Create,
    Update,
    Close,
}

impl TradeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeEventType::Create => "create",
            TradeEventType::Update => "update",
            TradeEventType::Close => "close",
        }
    }
}

impl fmt::Display for TradeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeEventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(TradeEventType::Create),
            "update" => Ok(TradeEventType::Update),
            "close" => Ok(TradeEventType::Close),
            _ => Err(UnknownVariant::new("trade event type", s)),
        }
    }
}

/// Immutable audit record of one trade mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeHistoryEvent {
    pub id: i64,
    pub trade_id: i64,
    pub triggering_analysis_id: i64,
    pub event_type: TradeEventType,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Audit event content written in the same transaction as the trade row.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub triggering_analysis_id: i64,
    pub details: serde_json::Value,
}
