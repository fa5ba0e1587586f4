//! Boundary check for raw classifier output.
//!
//! Everything the model says is untyped until it passes through
//! [`validate_response`]; downstream code only ever sees an
//! [`AnalysisPayload`].

use chrono::{Datelike, Duration, NaiveDate};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{
    AnalysisPayload, Classification, NewAnalysis, NewTradeSignal, OptionType, TradeCloseSignal,
    TradeUpdateSignal,
};
use crate::utils::next_friday;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%b %d, %Y", "%B %d, %Y"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("response is not JSON: {0}")]
    NotJson(String),

    #[error("response is not a JSON object")]
    NotObject,

    #[error("missing required 'classification' field")]
    MissingClassification,

    #[error("unknown classification {0:?}")]
    UnknownClassification(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Classifier output that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedResponse {
    pub payload: AnalysisPayload,
    pub related_trade_id: Option<i64>,
    pub reason: String,
    pub confidence: Option<f64>,
}

impl ValidatedResponse {
    pub fn into_analysis(self, message_id: &str) -> NewAnalysis {
        NewAnalysis {
            message_id: message_id.to_string(),
            related_trade_id: self.related_trade_id,
            reason: self.reason,
            confidence: self.confidence,
            payload: self.payload,
        }
    }
}

/// Maps a free-text expiration to a date relative to `today`. Unparseable
/// text falls back to `today`.
pub fn parse_expiration(text: &str, today: NaiveDate) -> NaiveDate {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();

    if lower.contains("this week") || lower.contains("end of week") {
        return next_friday(today);
    }
    if lower.contains("0dte") || lower.contains("today") {
        return today;
    }
    if lower.contains("tomorrow") {
        return today + Duration::days(1);
    }

    // `%Y` happily reads "24" as year 24, so two-digit years only count
    // through the `%y` format.
    DATE_FORMATS
        .iter()
        .filter_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .find(|date| date.year() >= 1000)
        .unwrap_or(today)
}

/// Lenient numeric read: JSON numbers, or strings such as `"150"` and `"$1.50"`.
pub fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('$').trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// `0`, negative, fractional or missing ids mean "no related trade".
pub fn normalize_trade_id(value: Option<&Value>) -> Option<i64> {
    let n = coerce_number(value?)?;
    (n.fract() == 0.0 && n >= 1.0 && n <= i64::MAX as f64).then_some(n as i64)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn present<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match present(obj, key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn optional_price(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    present(obj, key).and_then(coerce_number)
}

fn new_trade_signal(
    obj: &Map<String, Value>,
    today: NaiveDate,
) -> Result<NewTradeSignal, ValidationError> {
    let ticker = text(obj, "ticker")
        .map(|t| t.trim_start_matches('$').to_ascii_uppercase())
        .filter(|t| !t.is_empty())
        .ok_or(ValidationError::MissingField("ticker"))?;

    let option_type: OptionType = text(obj, "option_type")
        .ok_or(ValidationError::MissingField("option_type"))?
        .parse()
        .map_err(|e: crate::domain::UnknownVariant| ValidationError::InvalidField {
            field: "option_type",
            reason: e.to_string(),
        })?;

    let strike_raw = present(obj, "strike_price").ok_or(ValidationError::MissingField("strike_price"))?;
    let strike_price = coerce_number(strike_raw)
        .filter(|s| *s > 0.0)
        .ok_or_else(|| ValidationError::InvalidField {
            field: "strike_price",
            reason: format!("not a positive number: {strike_raw}"),
        })?;

    // Absent or non-text expirations parse like any other unreadable date.
    let expiration_text = text(obj, "expiration_date").unwrap_or_default();

    Ok(NewTradeSignal {
        ticker,
        option_type,
        strike_price,
        expiration_date: parse_expiration(&expiration_text, today),
        sizing: text(obj, "sizing"),
        entry_price: optional_price(obj, "entry_price"),
        stop_loss: optional_price(obj, "stop_loss"),
        take_profit: optional_price(obj, "take_profit"),
    })
}

/// Parses and validates one raw completion. `today` anchors relative
/// expirations.
pub fn validate_response(raw: &str, today: NaiveDate) -> Result<ValidatedResponse, ValidationError> {
    let value: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| ValidationError::NotJson(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(ValidationError::NotObject);
    };

    let label = present(&obj, "classification")
        .or_else(|| present(&obj, "action"))
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingClassification)?;
    let classification: Classification = label
        .parse()
        .map_err(|_| ValidationError::UnknownClassification(label.to_string()))?;

    let payload = match classification {
        Classification::NewTrade => AnalysisPayload::NewTrade(new_trade_signal(&obj, today)?),
        Classification::TradeUpdate => AnalysisPayload::TradeUpdate(TradeUpdateSignal {
            details: text(&obj, "details"),
            stop_loss: optional_price(&obj, "stop_loss"),
            take_profit: optional_price(&obj, "take_profit"),
        }),
        Classification::TradeClose => AnalysisPayload::TradeClose(TradeCloseSignal {
            details: text(&obj, "details"),
        }),
        Classification::Irrelevant => AnalysisPayload::Irrelevant,
        Classification::Other => AnalysisPayload::Other,
    };

    let confidence = present(&obj, "confidence_score")
        .or_else(|| present(&obj, "confidence"))
        .and_then(coerce_number);

    Ok(ValidatedResponse {
        payload,
        related_trade_id: normalize_trade_id(present(&obj, "related_trade_id")),
        reason: text(&obj, "reason").unwrap_or_default(),
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    // A Wednesday.
    fn today() -> NaiveDate {
        d("2024-03-06")
    }

    #[test]
    fn relative_expirations() {
        assert_eq!(parse_expiration("0DTE", today()), today());
        assert_eq!(parse_expiration("Today", today()), today());
        assert_eq!(parse_expiration("tomorrow", today()), d("2024-03-07"));
        assert_eq!(parse_expiration("this week", today()), d("2024-03-08"));
        assert_eq!(parse_expiration("End of Week", today()), d("2024-03-08"));
    }

    #[test]
    fn explicit_expiration_formats() {
        assert_eq!(parse_expiration("2024-04-19", today()), d("2024-04-19"));
        assert_eq!(parse_expiration("04/19/2024", today()), d("2024-04-19"));
        assert_eq!(parse_expiration("04/19/24", today()), d("2024-04-19"));
        assert_eq!(parse_expiration("Apr 19, 2024", today()), d("2024-04-19"));
    }

    #[test]
    fn unparseable_expiration_defaults_to_today() {
        assert_eq!(parse_expiration("next month-ish", today()), today());
        assert_eq!(parse_expiration("", today()), today());
    }

    #[test]
    fn related_trade_id_normalization() {
        assert_eq!(normalize_trade_id(Some(&serde_json::json!(0))), None);
        assert_eq!(normalize_trade_id(Some(&serde_json::json!(42))), Some(42));
        assert_eq!(normalize_trade_id(Some(&serde_json::json!("42"))), Some(42));
        assert_eq!(normalize_trade_id(Some(&serde_json::json!(-3))), None);
        assert_eq!(normalize_trade_id(Some(&serde_json::json!("abc"))), None);
        assert_eq!(normalize_trade_id(None), None);
    }

    #[test]
    fn new_trade_with_string_numbers_and_plural_option_type() {
        let raw = r#"{
            "classification": "new_trade",
            "reason": "explicit entry",
            "confidence_score": "8",
            "ticker": "$aapl",
            "option_type": "calls",
            "strike_price": "150",
            "expiration_date": "2024-03-08",
            "sizing": "lotto",
            "stop_loss": 1.5
        }"#;
        let v = validate_response(raw, today()).unwrap();
        assert_eq!(v.confidence, Some(8.0));
        assert_eq!(v.related_trade_id, None);
        let AnalysisPayload::NewTrade(signal) = v.payload else {
            panic!("expected new_trade");
        };
        assert_eq!(signal.ticker, "AAPL");
        assert_eq!(signal.option_type, OptionType::Call);
        assert_eq!(signal.strike_price, 150.0);
        assert_eq!(signal.expiration_date, d("2024-03-08"));
        assert_eq!(signal.sizing.as_deref(), Some("lotto"));
        assert_eq!(signal.stop_loss, Some(1.5));
    }

    #[test]
    fn new_trade_missing_strike_is_rejected() {
        let raw = r#"{"classification":"new_trade","ticker":"SPY","option_type":"PUT","expiration_date":"0DTE"}"#;
        assert_eq!(
            validate_response(raw, today()),
            Err(ValidationError::MissingField("strike_price"))
        );
    }

    #[test]
    fn new_trade_without_expiration_expires_today() {
        let raw = r#"{"classification":"new_trade","ticker":"AAPL","option_type":"CALL","strike_price":150,"reason":"entry"}"#;
        let v = validate_response(raw, today()).unwrap();
        let AnalysisPayload::NewTrade(signal) = v.payload else {
            panic!("expected new_trade");
        };
        assert_eq!(signal.expiration_date, today());

        let numeric = r#"{"classification":"new_trade","ticker":"AAPL","option_type":"CALL","strike_price":150,"expiration_date":20240308}"#;
        let AnalysisPayload::NewTrade(signal) = validate_response(numeric, today()).unwrap().payload else {
            panic!("expected new_trade");
        };
        assert_eq!(signal.expiration_date, today());
    }

    #[test]
    fn action_alias_and_fenced_output() {
        let raw = "```json\n{\"action\": \"trade_close\", \"related_trade_id\": 7, \"confidence\": 9}\n```";
        let v = validate_response(raw, today()).unwrap();
        assert_eq!(v.payload, AnalysisPayload::TradeClose(TradeCloseSignal::default()));
        assert_eq!(v.related_trade_id, Some(7));
        assert_eq!(v.confidence, Some(9.0));
    }

    #[test]
    fn malformed_outputs() {
        assert!(matches!(
            validate_response("not json", today()),
            Err(ValidationError::NotJson(_))
        ));
        assert_eq!(validate_response("[1,2]", today()), Err(ValidationError::NotObject));
        assert_eq!(
            validate_response(r#"{"reason":"?"}"#, today()),
            Err(ValidationError::MissingClassification)
        );
        assert_eq!(
            validate_response(r#"{"classification":"buy"}"#, today()),
            Err(ValidationError::UnknownClassification("buy".to_string()))
        );
    }
}
