use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{FeedConfig, WriterConfig};
use crate::exchange::bitfinex::FeedConnector;
use crate::schema::trade::Trade;
use crate::writer::{BatchWriter, TradeSink};

/// The feed connector and the batch writer, joined by a bounded trade queue.
///
/// Each worker has its own cancellation token; `cancel` fires both.
pub struct Pipeline {
    feed_cancel: CancellationToken,
    writer_cancel: CancellationToken,
    feed: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Pipeline {
    pub fn spawn<S>(feed_cfg: FeedConfig, writer_cfg: WriterConfig, sink: S) -> Self
    where
        S: TradeSink + 'static,
    {
        let (tx, rx) = mpsc::channel::<Trade>(writer_cfg.queue_capacity.max(1));
        let feed_cancel = CancellationToken::new();
        let writer_cancel = CancellationToken::new();

        let writer = tokio::spawn(BatchWriter::new(writer_cfg, sink, rx).run(writer_cancel.clone()));
        let feed = tokio::spawn(FeedConnector::new(feed_cfg, tx).run(feed_cancel.clone()));

        Self {
            feed_cancel,
            writer_cancel,
            feed,
            writer,
        }
    }

    pub fn cancel(&self) {
        self.feed_cancel.cancel();
        self.writer_cancel.cancel();
    }

    /// Waits for both workers to exit.
    pub async fn join(self) {
        if let Err(err) = self.feed.await {
            warn!("feed task failed: {err}");
        }
        if let Err(err) = self.writer.await {
            warn!("writer task failed: {err}");
        }
        info!("pipeline stopped");
    }

    pub async fn shutdown(self) {
        self.cancel();
        self.join().await;
    }

    pub fn is_finished(&self) -> bool {
        self.feed.is_finished() && self.writer.is_finished()
    }
}
