/// One executed trade as reported by the feed.
///
/// Built in a single step from a decoded `tu` update and never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub id: u64,
    pub timestamp: i64, // ms
    pub pair: String,   // tBTCUSD
    // Negative for sells.
    pub amount: f64,
    pub price: f64,
}

impl Trade {
    pub fn new(id: u64, timestamp: i64, pair: impl Into<String>, amount: f64, price: f64) -> Self {
        Self {
            id,
            timestamp,
            pair: pair.into(),
            amount,
            price,
        }
    }
}

pub const TRADES_MEASUREMENT: &str = "trades";

/// A trade as stored: measurement `trades`, tags `pair`/`uniq`, fields `amount`/`price`.
#[derive(Debug, Clone, PartialEq)]
pub struct TradePoint {
    pub pair: String,
    pub uniq: u64,
    pub amount: f64,
    pub price: f64,
    pub timestamp: i64, // ms
}

impl TradePoint {
    pub fn from_trade(trade: &Trade, uniq: u64) -> Self {
        Self {
            pair: trade.pair.clone(),
            uniq,
            amount: trade.amount,
            price: trade.price,
            timestamp: trade.timestamp,
        }
    }
}
