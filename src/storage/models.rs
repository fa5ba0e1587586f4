use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::domain::{
    Analysis, AnalysisPayload, Attachment, Message, Trade, TradeHistoryEvent,
};

use super::StoreError;

/// Row model for the `messages` table.
#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub message_id: String,
    pub ts: DateTime<Utc>,
    pub content: String,
    pub parent_id: Option<String>,
    pub channel: String,
    pub author: String,
    pub attachments: Json<Vec<Attachment>>,
    pub processed: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.message_id,
            timestamp: row.ts,
            content: row.content,
            parent_id: row.parent_id,
            channel: row.channel,
            author: row.author,
            attachments: row.attachments.0,
            processed: row.processed,
        }
    }
}

/// Row model for `message_analyses`. The payload column holds the
/// serialized [`AnalysisPayload`], tagged by classification.
#[derive(Debug, Clone, FromRow)]
pub struct AnalysisRow {
    pub analysis_id: i64,
    pub message_id: String,
    pub classification: String,
    pub related_trade_id: Option<i64>,
    pub reason: String,
    pub confidence: Option<f64>,
    pub payload: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AnalysisRow> for Analysis {
    type Error = StoreError;

    fn try_from(row: AnalysisRow) -> Result<Self, Self::Error> {
        let classification = row
            .classification
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("analysis {}: {e}", row.analysis_id)))?;
        let payload: AnalysisPayload = serde_json::from_value(row.payload.0).map_err(|e| {
            StoreError::Corrupt(format!("analysis {} payload: {e}", row.analysis_id))
        })?;
        if payload.classification() != classification {
            return Err(StoreError::Corrupt(format!(
                "analysis {} payload is tagged {} but row says {}",
                row.analysis_id,
                payload.classification(),
                classification
            )));
        }

        Ok(Self {
            id: row.analysis_id,
            message_id: row.message_id,
            classification,
            related_trade_id: row.related_trade_id,
            reason: row.reason,
            confidence: row.confidence,
            payload,
            created_at: row.created_at,
        })
    }
}

/// Row model for `trades`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRow {
    pub trade_id: i64,
    pub opening_analysis_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub option_type: String,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub status: String,
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

impl TryFrom<TradeRow> for Trade {
    type Error = StoreError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let corrupt = |e: crate::domain::UnknownVariant| {
            StoreError::Corrupt(format!("trade {}: {e}", row.trade_id))
        };
        let option_type = row.option_type.parse().map_err(corrupt)?;
        let status = row.status.parse().map_err(corrupt)?;

        Ok(Self {
            id: row.trade_id,
            opening_analysis_id: row.opening_analysis_id,
            client_order_id: row.client_order_id,
            symbol: row.symbol,
            option_type,
            strike: row.strike,
            expiration: row.expiration,
            status,
            quantity: row.quantity,
            target_entry_price: row.target_entry_price,
            filled_entry_price: row.filled_entry_price,
            filled_exit_price: row.filled_exit_price,
            stop_loss: row.stop_loss,
            take_profit: row.take_profit,
            created_at: row.created_at,
            updated_at: row.updated_at,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
        })
    }
}

/// Row model for `trade_history`.
#[derive(Debug, Clone, FromRow)]
pub struct TradeHistoryRow {
    pub history_id: i64,
    pub trade_id: i64,
    pub triggering_analysis_id: i64,
    pub event_type: String,
    pub details: Json<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

impl TryFrom<TradeHistoryRow> for TradeHistoryEvent {
    type Error = StoreError;

    fn try_from(row: TradeHistoryRow) -> Result<Self, Self::Error> {
        let event_type = row
            .event_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("history {}: {e}", row.history_id)))?;

        Ok(Self {
            id: row.history_id,
            trade_id: row.trade_id,
            triggering_analysis_id: row.triggering_analysis_id,
            event_type,
            details: row.details.0,
            timestamp: row.ts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Classification, TradeStatus};

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-04T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn analysis_row_rejects_mismatched_payload_tag() {
        let row = AnalysisRow {
            analysis_id: 7,
            message_id: "m1".to_string(),
            classification: "trade_close".to_string(),
            related_trade_id: Some(3),
            reason: "exit".to_string(),
            confidence: Some(9.0),
            payload: Json(serde_json::json!({ "classification": "irrelevant" })),
            created_at: ts(),
        };
        assert!(matches!(Analysis::try_from(row), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn analysis_row_converts() {
        let row = AnalysisRow {
            analysis_id: 7,
            message_id: "m1".to_string(),
            classification: "trade_close".to_string(),
            related_trade_id: Some(3),
            reason: "exit".to_string(),
            confidence: Some(9.0),
            payload: Json(serde_json::json!({
                "classification": "trade_close",
                "details": "all out"
            })),
            created_at: ts(),
        };
        let analysis = Analysis::try_from(row).unwrap();
        assert_eq!(analysis.classification, Classification::TradeClose);
        assert_eq!(analysis.related_trade_id, Some(3));
    }

    #[test]
    fn trade_row_with_unknown_status_is_corrupt() {
        let row = TradeRow {
            trade_id: 1,
            opening_analysis_id: 1,
            client_order_id: "bot-1".to_string(),
            symbol: "AAPL".to_string(),
            option_type: "CALL".to_string(),
            strike: 150.0,
            expiration: ts().date_naive(),
            status: "half_open".to_string(),
            quantity: 1,
            target_entry_price: None,
            filled_entry_price: None,
            filled_exit_price: None,
            stop_loss: None,
            take_profit: None,
            created_at: ts(),
            updated_at: ts(),
            opened_at: None,
            closed_at: None,
        };
        assert!(Trade::try_from(row.clone()).is_err());

        let ok = TradeRow {
            status: "pending_open".to_string(),
            ..row
        };
        assert_eq!(Trade::try_from(ok).unwrap().status, TradeStatus::PendingOpen);
    }
}
