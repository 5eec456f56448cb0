pub mod client;

pub use client::{WsOptions, WsSession};
