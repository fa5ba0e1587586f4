use chrono::NaiveDate;

use crate::domain::{Message, TradeSummary};
use crate::reply_chain::ReplyChain;

/// Everything the model sees for one message.
pub struct PromptContext<'a> {
    pub today: NaiveDate,
    pub active_trades: &'a [TradeSummary],
    pub reply_chain: &'a ReplyChain,
    pub history: &'a [Message],
    pub content: &'a str,
}

const INSTRUCTIONS: &str = r#"You are a trading assistant reading messages from an options alert channel. Classify the message under "Message to Analyze" as exactly one of:
- "new_trade": opens a position and names the ticker, CALL or PUT, strike and expiration.
- "trade_update": changes an active trade (trim, add, scale out, stop-loss or take-profit change).
- "trade_close": fully exits an active trade.
- "irrelevant": anything without actionable trade information.

Rules:
- Use "new_trade" only when ticker, CALL/PUT, strike and expiration are all explicit. Otherwise use "irrelevant".
- "trade_update" and "trade_close" must refer to one of the active trades by symbol or details. Set "related_trade_id" to that trade's integer "trade_id". If no active trade matches, use "irrelevant".
- Sizing for new trades: "small" for lotto or small size, "medium" for high risk or medium size, "large" only when large or full size is stated. Omit "sizing" when the message gives no hint.
- Dates are YYYY-MM-DD. Today is {today}. "0DTE" means today. "this week" means the coming Friday.

Respond with ONE JSON object and nothing else. Always include "classification", "reason" (short) and "confidence_score" (1-10).
For "new_trade" add "ticker", "option_type", "strike_price", "expiration_date", "sizing", and when given "entry_price", "stop_loss", "take_profit".
For "trade_update" add "related_trade_id", "details" (the instruction, e.g. "trim 50%"), and any new "stop_loss" or "take_profit".
For "trade_close" add "related_trade_id" and "details"."#;

fn section(title: &str, body: &str) -> String {
    let body = if body.trim().is_empty() { "(none)" } else { body };
    format!("**{title}**:\n{body}")
}

pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let trades = serde_json::to_string_pretty(ctx.active_trades).unwrap_or_else(|_| "[]".to_string());
    let history = ctx
        .history
        .iter()
        .map(Message::context_line)
        .collect::<Vec<_>>()
        .join("\n");

    [
        INSTRUCTIONS.replace("{today}", &ctx.today.format("%Y-%m-%d").to_string()),
        section("Active Trades (JSON)", &trades),
        section("Reply Chain (oldest to newest)", &ctx.reply_chain.render()),
        section("Recent Channel History (oldest to newest)", &history),
        section("Message to Analyze", ctx.content),
    ]
    .join("\n\n")
}
