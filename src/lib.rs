pub mod config;
pub mod error;
pub mod exchange;
pub mod pipeline;
pub mod schema;
pub mod util;
pub mod writer;
pub mod ws;
