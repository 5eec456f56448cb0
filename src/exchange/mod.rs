pub mod bitfinex;
pub mod bitfinex_msg;
pub mod subscriptions;
