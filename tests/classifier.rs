use serde_json::json;

use trade_signal_desk::client::ClientError;
use trade_signal_desk::domain::{AnalysisPayload, Classification};
use trade_signal_desk::storage::{AnalysisCache, MessageStore};
use trade_signal_desk::testkit::{base_time, record, unavailable, Harness};

async fn stored(h: &Harness, id: &str, minute: i64, content: &str, parent: Option<&str>) {
    h.store.append(&record(id, minute, content, parent)).await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = Harness::new();
    stored(&h, "m1", 0, "SPY 500 PUTS 0DTE", None).await;
    h.model.push_error(unavailable());
    h.model.push_error(unavailable());
    h.model.push_json(json!({
        "classification": "new_trade",
        "ticker": "SPY",
        "option_type": "P",
        "strike_price": 500,
        "expiration_date": "0DTE"
    }));

    let message = h.store.get("m1").await.unwrap().unwrap();
    let classified = h.classifier().classify(&message).await.unwrap();

    assert_eq!(h.model.calls(), 3);
    let AnalysisPayload::NewTrade(signal) = &classified.analysis.payload else {
        panic!("expected new_trade");
    };
    // 0DTE resolves against the injected clock, which also stamps the row.
    assert_eq!(signal.expiration_date.to_string(), "2024-03-06");
    assert_eq!(classified.analysis.created_at, base_time());
}

#[tokio::test]
async fn exhausted_retries_store_other() {
    let h = Harness::new();
    stored(&h, "m1", 0, "NVDA 900c", None).await;
    for _ in 0..3 {
        h.model.push_error(unavailable());
    }

    let message = h.store.get("m1").await.unwrap().unwrap();
    let classified = h.classifier().classify(&message).await.unwrap();

    assert_eq!(h.model.calls(), 3);
    assert_eq!(classified.analysis.classification, Classification::Other);
    assert!(classified.analysis.reason.starts_with("Error:"));

    // The fallback is durable: no further model calls for this message.
    let again = h.classifier().classify(&message).await.unwrap();
    assert!(again.cached);
    assert_eq!(h.model.calls(), 3);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let h = Harness::new();
    stored(&h, "m1", 0, "hello", None).await;
    h.model.push_error(ClientError::HttpStatus {
        status: reqwest::StatusCode::UNAUTHORIZED,
        body: "bad key".to_string(),
    });

    let message = h.store.get("m1").await.unwrap().unwrap();
    let classified = h.classifier().classify(&message).await.unwrap();
    assert_eq!(h.model.calls(), 1);
    assert_eq!(classified.analysis.classification, Classification::Other);
}

#[tokio::test]
async fn invalid_output_becomes_other() {
    let h = Harness::new();
    stored(&h, "a", 0, "one", None).await;
    stored(&h, "b", 1, "two", None).await;
    h.model.push_response("I think this is a new trade!");
    h.model.push_json(json!({ "reason": "no label" }));

    for id in ["a", "b"] {
        let message = h.store.get(id).await.unwrap().unwrap();
        let classified = h.classifier().classify(&message).await.unwrap();
        assert_eq!(classified.analysis.payload, AnalysisPayload::Other);
        assert!(classified.analysis.related_trade_id.is_none());
    }
    assert_eq!(h.model.calls(), 2);
}

#[tokio::test]
async fn related_trade_zero_means_none() {
    let h = Harness::new();
    stored(&h, "m1", 0, "stop to BE", None).await;
    h.model.push_json(json!({
        "action": "trade_update",
        "related_trade_id": 0,
        "confidence": "7",
        "stop_loss": "2.10"
    }));

    let message = h.store.get("m1").await.unwrap().unwrap();
    let analysis = h.classifier().classify(&message).await.unwrap().analysis;
    assert_eq!(analysis.classification, Classification::TradeUpdate);
    assert_eq!(analysis.related_trade_id, None);
    assert_eq!(analysis.confidence, Some(7.0));
    let stored = h.store.find_by_message("m1").await.unwrap().unwrap();
    assert_eq!(stored, analysis);
}

#[tokio::test]
async fn prompt_carries_thread_history_and_message() {
    let h = Harness::new();
    stored(&h, "old", 0, "morning all", None).await;
    stored(&h, "root", 1, "TSLA 200 CALLS 03/08/2024", None).await;
    stored(&h, "reply", 2, "adding here", Some("root")).await;
    h.model.push_json(json!({ "classification": "irrelevant", "reason": "context test" }));

    let message = h.store.get("reply").await.unwrap().unwrap();
    h.classifier().classify(&message).await.unwrap();

    let prompts = h.model.prompts();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert!(prompt.contains("Today is 2024-03-06."));
    assert!(prompt.contains("**Active Trades (JSON)**:\n[]"));
    assert!(prompt.contains(
        "**Reply Chain (oldest to newest)**:\n[2024-03-06 14:01:00] desk: TSLA 200 CALLS 03/08/2024\n[2024-03-06 14:02:00] desk: adding here"
    ));
    assert!(prompt.contains("[2024-03-06 14:00:00] desk: morning all"));
    assert!(prompt.ends_with("**Message to Analyze**:\nadding here"));
}
