pub mod batch;
pub mod influx;

use async_trait::async_trait;

use crate::schema::trade::TradePoint;

pub use batch::{BatchWriter, TradeBatch, WriterState};
pub use influx::InfluxSink;

/// Storage backend behind the batch writer.
#[async_trait]
pub trait TradeSink: Send {
    /// (Re)establishes the backend connection. Called before the first write
    /// and again after every failed write.
    async fn connect(&mut self) -> anyhow::Result<()>;

    /// Writes all `points` in a single request.
    async fn write_points(&mut self, points: &[TradePoint]) -> anyhow::Result<()>;
}
