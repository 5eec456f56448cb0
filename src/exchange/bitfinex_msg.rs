//! Bitfinex public websocket (v2) message decoding.
//!
//! Text frames come in two shapes: JSON objects carrying an `event` field
//! (`info`, `subscribed`, `error`, ...) and JSON arrays addressed to a channel
//! id (`[chanId, ...]`). Every frame is decoded once into a [`FeedMessage`].

use serde::Deserialize;
use serde_json::Value;

use crate::error::ParseError;

pub const TRADES_CHANNEL: &str = "trades";
pub const TRADE_UPDATE_TAG: &str = "tu";

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Control message (`{"event": ...}`).
    Event(EventMessage),
    /// `[chanId, "tu", [id, mts, amount, price]]`
    Update(TradeUpdate),
    /// Valid frame we do not consume: snapshots, heartbeats, `te` executions, other objects.
    Unrecognized,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EventMessage {
    pub event: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default, rename = "chanId")]
    pub chan_id: Option<u64>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub pair: Option<String>,
    // `info` only
    #[serde(default)]
    pub version: Option<u64>,
    // `error` / `info`
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl EventMessage {
    /// `(chanId, symbol)` when this acknowledges a trades subscription.
    pub fn trades_subscription(&self) -> Option<(u64, &str)> {
        if self.event != "subscribed" || self.channel.as_deref() != Some(TRADES_CHANNEL) {
            return None;
        }
        Some((self.chan_id?, self.symbol.as_deref()?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    pub chan_id: u64,
    pub id: u64,
    pub timestamp: i64, // ms
    pub amount: f64,
    pub price: f64,
}

pub fn classify(text: &str) -> Result<FeedMessage, ParseError> {
    let v: Value = serde_json::from_str(text)?;
    if v.get("event").is_some() {
        let ev: EventMessage = serde_json::from_value(v)?;
        return Ok(FeedMessage::Event(ev));
    }
    match v.as_array() {
        Some(items) => classify_array(items),
        None => Ok(FeedMessage::Unrecognized),
    }
}

fn classify_array(items: &[Value]) -> Result<FeedMessage, ParseError> {
    let Some(chan_id) = items.first().and_then(Value::as_u64) else {
        return Ok(FeedMessage::Unrecognized);
    };
    if items.get(1).and_then(Value::as_str) != Some(TRADE_UPDATE_TAG) {
        return Ok(FeedMessage::Unrecognized);
    }

    let payload = items
        .get(2)
        .and_then(Value::as_array)
        .ok_or_else(|| ParseError::field("payload", "expected [id, mts, amount, price]"))?;
    if payload.len() != 4 {
        return Err(ParseError::field(
            "payload",
            format!("expected 4 elements, got {}", payload.len()),
        ));
    }

    let id = payload[0]
        .as_u64()
        .ok_or_else(|| ParseError::field("id", format!("not an unsigned integer: {}", payload[0])))?;
    let timestamp = payload[1]
        .as_i64()
        .filter(|ts| *ts >= 0)
        .ok_or_else(|| ParseError::field("mts", format!("not an epoch ms: {}", payload[1])))?;
    let amount = number_at(payload, 2, "amount")?;
    let price = number_at(payload, 3, "price")?;
    if price <= 0.0 {
        return Err(ParseError::field("price", format!("must be positive: {price}")));
    }

    Ok(FeedMessage::Update(TradeUpdate {
        chan_id,
        id,
        timestamp,
        amount,
        price,
    }))
}

fn number_at(payload: &[Value], idx: usize, field: &'static str) -> Result<f64, ParseError> {
    payload[idx]
        .as_f64()
        .filter(|x| x.is_finite())
        .ok_or_else(|| ParseError::field(field, format!("not a number: {}", payload[idx])))
}

pub fn subscribe_request(symbol: &str) -> String {
    serde_json::json!({
        "event": "subscribe",
        "channel": TRADES_CHANNEL,
        "symbol": symbol
    })
    .to_string()
}
