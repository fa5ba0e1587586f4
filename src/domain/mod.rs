//! Core records shared by the processor, the classifier and the trade ledger.

use thiserror::Error;

pub mod analysis;
pub mod message;
pub mod trade;

pub use analysis::{
    Analysis, AnalysisPayload, Classification, NewAnalysis, NewTradeSignal, TradeAction,
    TradeCloseSignal, TradeUpdateSignal,
};
pub use message::{Attachment, Message, MessageRecord};
pub use trade::{
    AuditEntry, NewTrade, OptionType, Trade, TradeChanges, TradeEventType, TradeHistoryEvent,
    TradeStatus, TradeSummary,
};

/// Returned when a stored or received label does not name a known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
