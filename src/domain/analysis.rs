use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::trade::OptionType;
use super::UnknownVariant;

/// Label assigned to a message by the classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    NewTrade,
    TradeUpdate,
    TradeClose,
    Irrelevant,
    Other,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::NewTrade => "new_trade",
            Classification::TradeUpdate => "trade_update",
            Classification::TradeClose => "trade_close",
            Classification::Irrelevant => "irrelevant",
            Classification::Other => "other",
        }
    }

    /// Whether an analysis with this label is forwarded to the trade manager.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            Classification::NewTrade | Classification::TradeUpdate | Classification::TradeClose
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new_trade" => Ok(Classification::NewTrade),
            "trade_update" => Ok(Classification::TradeUpdate),
            "trade_close" => Ok(Classification::TradeClose),
            "irrelevant" => Ok(Classification::Irrelevant),
            "other" => Ok(Classification::Other),
            _ => Err(UnknownVariant::new("classification", s)),
        }
    }
}

/// Fields extracted for a `new_trade` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTradeSignal {
    pub ticker: String,
    pub option_type: OptionType,
    pub strike_price: f64,
    pub expiration_date: NaiveDate,
    /// Descriptive size hint ("small", "lotto", ...), resolved by the ledger.
    #[serde(default)]
    pub sizing: Option<String>,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// Fields extracted for a `trade_update` message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdateSignal {
    /// Free-text instruction, e.g. "trim 50%".
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// Fields extracted for a `trade_close` message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeCloseSignal {
    #[serde(default)]
    pub details: Option<String>,
}

/// Validated classifier output, one variant per classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "classification", rename_all = "snake_case")]
pub enum AnalysisPayload {
    NewTrade(NewTradeSignal),
    TradeUpdate(TradeUpdateSignal),
    TradeClose(TradeCloseSignal),
    Irrelevant,
    Other,
}

impl AnalysisPayload {
    pub fn classification(&self) -> Classification {
        match self {
            AnalysisPayload::NewTrade(_) => Classification::NewTrade,
            AnalysisPayload::TradeUpdate(_) => Classification::TradeUpdate,
            AnalysisPayload::TradeClose(_) => Classification::TradeClose,
            AnalysisPayload::Irrelevant => Classification::Irrelevant,
            AnalysisPayload::Other => Classification::Other,
        }
    }
}

/// Analysis about to be stored. The classification is always derived from
/// the payload so the two cannot disagree.
#[derive(Clone, Debug, PartialEq)]
pub struct NewAnalysis {
    pub message_id: String,
    pub related_trade_id: Option<i64>,
    pub reason: String,
    pub confidence: Option<f64>,
    pub payload: AnalysisPayload,
}

impl NewAnalysis {
    pub fn classification(&self) -> Classification {
        self.payload.classification()
    }

    /// Fallback analysis recorded when the classifier output is unusable.
    pub fn other(message_id: &str, reason: impl Into<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            related_trade_id: None,
            reason: reason.into(),
            confidence: None,
            payload: AnalysisPayload::Other,
        }
    }
}

/// Stored classification result; at most one per message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: i64,
    pub message_id: String,
    pub classification: Classification,
    pub related_trade_id: Option<i64>,
    pub reason: String,
    pub confidence: Option<f64>,
    pub payload: AnalysisPayload,
    pub created_at: DateTime<Utc>,
}

/// Payload of the trade-action queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeAction {
    pub message_id: String,
    pub analysis_id: i64,
    pub classification: Classification,
}

impl From<&Analysis> for TradeAction {
    fn from(analysis: &Analysis) -> Self {
        Self {
            message_id: analysis.message_id.clone(),
            analysis_id: analysis.id,
            classification: analysis.classification,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_by_classification() {
        let payload = AnalysisPayload::TradeUpdate(TradeUpdateSignal {
            details: Some("trim 50%".to_string()),
            stop_loss: Some(1.2),
            take_profit: None,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["classification"], "trade_update");
        assert_eq!(json["details"], "trim 50%");

        let unit = serde_json::to_value(AnalysisPayload::Irrelevant).unwrap();
        assert_eq!(unit, serde_json::json!({ "classification": "irrelevant" }));
    }

    #[test]
    fn only_trade_labels_are_actionable() {
        assert!(Classification::NewTrade.is_actionable());
        assert!(Classification::TradeUpdate.is_actionable());
        assert!(Classification::TradeClose.is_actionable());
        assert!(!Classification::Irrelevant.is_actionable());
        assert!(!Classification::Other.is_actionable());
    }

    #[test]
    fn classification_parses_stored_labels() {
        assert_eq!("trade_close".parse::<Classification>(), Ok(Classification::TradeClose));
        assert_eq!(" New_Trade ".parse::<Classification>(), Ok(Classification::NewTrade));
        assert!("buy".parse::<Classification>().is_err());
    }
}
