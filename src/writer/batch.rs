use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::schema::trade::{Trade, TradePoint};
use crate::util::metrics;
use crate::util::time::{format_time_str_ms, lag_ms};
use crate::writer::TradeSink;

const BACKLOG_WARN_PCT: usize = 80;

/// Points waiting for the next flush, in arrival order.
///
/// Consecutive trades with the same pair and timestamp get increasing `uniq`
/// tags (0, 1, 2, ...) so the backend keeps them as distinct points. The
/// counter survives `clear`, so a run of equal keys split by a flush keeps
/// counting.
#[derive(Debug, Default)]
pub struct TradeBatch {
    points: Vec<TradePoint>,
    uniq: u64,
    prev_key: Option<(String, i64)>,
}

impl TradeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `trade` and returns the `uniq` tag it was given.
    pub fn push(&mut self, trade: &Trade) -> u64 {
        let repeat = matches!(
            &self.prev_key,
            Some((pair, ts)) if *pair == trade.pair && *ts == trade.timestamp
        );
        if repeat {
            self.uniq += 1;
        } else {
            self.uniq = 0;
            self.prev_key = Some((trade.pair.clone(), trade.timestamp));
        }
        self.points.push(TradePoint::from_trade(trade, self.uniq));
        self.uniq
    }

    pub fn points(&self) -> &[TradePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn newest_timestamp(&self) -> Option<i64> {
        self.points.iter().map(|p| p.timestamp).max()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Connecting,
    Collecting,
    Stopped,
}

/// Drains the trade queue into a [`TradeBatch`] and writes it to the sink on
/// every flush tick. A failed write keeps the batch and reconnects the sink.
pub struct BatchWriter<S> {
    cfg: WriterConfig,
    sink: S,
    receiver: mpsc::Receiver<Trade>,
    batch: TradeBatch,
    state: WriterState,
    connect_failures: u64,
}

impl<S: TradeSink> BatchWriter<S> {
    pub fn new(cfg: WriterConfig, sink: S, receiver: mpsc::Receiver<Trade>) -> Self {
        Self {
            cfg,
            sink,
            receiver,
            batch: TradeBatch::new(),
            state: WriterState::Connecting,
            connect_failures: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn accept(&mut self, trade: &Trade) -> u64 {
        self.batch.push(trade)
    }

    /// Writes the pending batch in one call. The batch is cleared only after
    /// the sink accepted it.
    pub async fn flush(&mut self) -> anyhow::Result<usize> {
        if self.batch.is_empty() {
            return Ok(0);
        }
        let n = self.batch.len();
        self.sink
            .write_points(self.batch.points())
            .await
            .with_context(|| format!("write {n} points"))?;

        let newest = self.batch.newest_timestamp();
        self.batch.clear();
        metrics::add_points_written(n as u64);
        match newest {
            Some(ts) => info!(
                "flushed {n} trades: newest={} lag_ms={}",
                format_time_str_ms(ts),
                lag_ms(ts)
            ),
            None => info!("flushed {n} trades"),
        }
        Ok(n)
    }

    /// Runs until `cancel` fires or every producer is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = self.cfg.flush_interval();
        info!(
            "batch writer start: flush_interval_ms={} queue_capacity={}",
            self.cfg.flush_interval_ms, self.cfg.queue_capacity
        );
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                self.state = WriterState::Stopped;
            }
            let next = match self.state {
                WriterState::Stopped => break,
                WriterState::Connecting => self.connect(&cancel).await,
                WriterState::Collecting => self.collect(&cancel, &mut tick).await,
            };
            if next != self.state {
                debug!("writer state {:?} -> {:?}", self.state, next);
            }
            // Full flush period after every (re)connect.
            if self.state == WriterState::Connecting && next == WriterState::Collecting {
                tick.reset();
            }
            self.state = next;
        }

        if !self.batch.is_empty() {
            if self.cfg.flush_on_shutdown {
                if let Err(err) = self.flush().await {
                    metrics::inc_flush_failures();
                    warn!("shutdown flush failed: {err:#} dropped={}", self.batch.len());
                }
            } else {
                warn!("batch writer stopped with {} unflushed trades", self.batch.len());
            }
        }
        info!(
            "batch writer stopped: points_written={} flush_failures={}",
            metrics::points_written_total(),
            metrics::flush_failures_total()
        );
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> WriterState {
        let res = tokio::select! {
            _ = cancel.cancelled() => return WriterState::Stopped,
            res = self.sink.connect() => res,
        };
        match res {
            Ok(()) => {
                info!("storage connected: pending={}", self.batch.len());
                self.connect_failures = 0;
                WriterState::Collecting
            }
            Err(err) => {
                self.connect_failures += 1;
                let backoff = self.cfg.reconnect_backoff();
                if self.connect_failures == 1 || self.connect_failures % 10 == 0 {
                    warn!(
                        "storage connect failed: {err:#} backoff_ms={} failures={} pending={}",
                        backoff.as_millis(),
                        self.connect_failures,
                        self.batch.len()
                    );
                } else {
                    debug!("storage connect failed: {err:#}");
                }
                tokio::select! {
                    _ = cancel.cancelled() => WriterState::Stopped,
                    _ = tokio::time::sleep(backoff) => WriterState::Connecting,
                }
            }
        }
    }

    async fn collect(&mut self, cancel: &CancellationToken, tick: &mut Interval) -> WriterState {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return WriterState::Stopped,
                _ = tick.tick() => {
                    self.report_backlog();
                    let res = tokio::select! {
                        _ = cancel.cancelled() => return WriterState::Stopped,
                        res = self.flush() => res,
                    };
                    if let Err(err) = res {
                        metrics::inc_flush_failures();
                        warn!("flush failed: {err:#} pending={}", self.batch.len());
                        return WriterState::Connecting;
                    }
                }
                msg = self.receiver.recv() => match msg {
                    Some(trade) => {
                        self.accept(&trade);
                    }
                    None => {
                        info!("trade queue closed");
                        return WriterState::Stopped;
                    }
                },
            }
        }
    }

    fn report_backlog(&self) {
        let queued = self.receiver.len();
        let cap = self.cfg.queue_capacity.max(1);
        if queued * 100 >= cap * BACKLOG_WARN_PCT {
            warn!("trade queue backlog: queued={queued} capacity={cap} pending={}", self.batch.len());
        } else {
            debug!("trade queue: queued={queued} pending={}", self.batch.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct SinkLog {
        connects: usize,
        fail_connects: usize,
        fail_writes: usize,
        writes: Vec<Vec<TradePoint>>,
    }

    #[derive(Clone, Default)]
    struct MemorySink {
        log: Arc<Mutex<SinkLog>>,
    }

    impl MemorySink {
        fn failing(connects: usize, writes: usize) -> Self {
            let sink = Self::default();
            {
                let mut log = sink.log.lock().unwrap();
                log.fail_connects = connects;
                log.fail_writes = writes;
            }
            sink
        }

        fn writes(&self) -> Vec<Vec<TradePoint>> {
            self.log.lock().unwrap().writes.clone()
        }

        fn connects(&self) -> usize {
            self.log.lock().unwrap().connects
        }
    }

    #[async_trait]
    impl TradeSink for MemorySink {
        async fn connect(&mut self) -> anyhow::Result<()> {
            let mut log = self.log.lock().unwrap();
            log.connects += 1;
            if log.fail_connects > 0 {
                log.fail_connects -= 1;
                anyhow::bail!("connection refused");
            }
            Ok(())
        }

        async fn write_points(&mut self, points: &[TradePoint]) -> anyhow::Result<()> {
            let mut log = self.log.lock().unwrap();
            if log.fail_writes > 0 {
                log.fail_writes -= 1;
                anyhow::bail!("http 503");
            }
            log.writes.push(points.to_vec());
            Ok(())
        }
    }

    fn trade(id: u64, ts: i64) -> Trade {
        Trade::new(id, ts, "tBTCUSD", 0.5, 63000.0)
    }

    fn cfg() -> WriterConfig {
        WriterConfig {
            flush_interval_ms: 10_000,
            queue_capacity: 16,
            flush_on_shutdown: false,
            reconnect_backoff_ms: 5_000,
        }
    }

    #[test]
    fn uniq_counts_runs_of_equal_timestamps() {
        let mut batch = TradeBatch::new();
        let tags: Vec<u64> = [1000, 1000, 1000, 1001]
            .iter()
            .enumerate()
            .map(|(i, ts)| batch.push(&trade(i as u64, *ts)))
            .collect();
        assert_eq!(tags, vec![0, 1, 2, 0]);
        let points: Vec<u64> = batch.points().iter().map(|p| p.uniq).collect();
        assert_eq!(points, vec![0, 1, 2, 0]);
    }

    #[test]
    fn uniq_resets_on_pair_change() {
        let mut batch = TradeBatch::new();
        assert_eq!(batch.push(&Trade::new(1, 1000, "tBTCUSD", 1.0, 1.0)), 0);
        assert_eq!(batch.push(&Trade::new(2, 1000, "tETHUSD", 1.0, 1.0)), 0);
        assert_eq!(batch.push(&Trade::new(3, 1000, "tBTCUSD", 1.0, 1.0)), 0);
    }

    #[test]
    fn uniq_survives_clear() {
        let mut batch = TradeBatch::new();
        batch.push(&trade(1, 1000));
        batch.push(&trade(2, 1000));
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.push(&trade(3, 1000)), 2);
    }

    #[tokio::test]
    async fn flush_writes_whole_batch_once() {
        let sink = MemorySink::default();
        let (_tx, rx) = mpsc::channel(16);
        let mut writer = BatchWriter::new(cfg(), sink.clone(), rx);
        for i in 0..5 {
            writer.accept(&trade(i, 1000 + i as i64));
        }
        assert_eq!(writer.flush().await.unwrap(), 5);
        assert_eq!(writer.pending(), 0);

        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        let ids: Vec<i64> = writes[0].iter().map(|p| p.timestamp).collect();
        assert_eq!(ids, vec![1000, 1001, 1002, 1003, 1004]);

        assert_eq!(writer.flush().await.unwrap(), 0);
        assert_eq!(sink.writes().len(), 1);
    }

    #[tokio::test]
    async fn failed_write_keeps_batch_for_next_flush() {
        let sink = MemorySink::failing(0, 1);
        let (_tx, rx) = mpsc::channel(16);
        let mut writer = BatchWriter::new(cfg(), sink.clone(), rx);
        for i in 0..3 {
            writer.accept(&trade(i, 1000));
        }
        assert!(writer.flush().await.is_err());
        assert_eq!(writer.pending(), 3);
        assert!(sink.writes().is_empty());

        writer.accept(&trade(3, 1001));
        assert_eq!(writer.flush().await.unwrap(), 4);
        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        let tags: Vec<u64> = writes[0].iter().map(|p| p.uniq).collect();
        assert_eq!(tags, vec![0, 1, 2, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_on_tick() {
        let sink = MemorySink::default();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(BatchWriter::new(cfg(), sink.clone(), rx).run(cancel.clone()));

        for i in 0..3 {
            tx.send(trade(i, 1000)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(9_000)).await;
        assert!(sink.writes().is_empty());

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 3);
        assert_eq!(sink.connects(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_reconnects_after_failed_write() {
        let sink = MemorySink::failing(0, 1);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(BatchWriter::new(cfg(), sink.clone(), rx).run(cancel.clone()));

        tx.send(trade(1, 1000)).await.unwrap();
        tx.send(trade(2, 1001)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(11_000)).await;
        assert!(sink.writes().is_empty());
        assert_eq!(sink.connects(), 2);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_connect_with_backoff() {
        let sink = MemorySink::failing(2, 0);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(BatchWriter::new(cfg(), sink.clone(), rx).run(cancel.clone()));

        tx.send(trade(1, 1000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(6_000)).await;
        assert_eq!(sink.connects(), 2);

        tokio::time::sleep(Duration::from_millis(25_000)).await;
        assert_eq!(sink.connects(), 3);
        let points: usize = sink.writes().iter().map(Vec::len).sum();
        assert_eq!(points, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_partial_batch_by_default() {
        let sink = MemorySink::default();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(BatchWriter::new(cfg(), sink.clone(), rx).run(cancel.clone()));

        tx.send(trade(1, 1000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("writer should stop")
            .unwrap();
        assert!(sink.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_flushes_when_configured() {
        let sink = MemorySink::default();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let cfg = WriterConfig {
            flush_on_shutdown: true,
            ..cfg()
        };
        let handle = tokio::spawn(BatchWriter::new(cfg, sink.clone(), rx).run(cancel.clone()));

        tx.send(trade(1, 1000)).await.unwrap();
        tx.send(trade(2, 1000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        cancel.cancel();
        handle.await.unwrap();

        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_stops_writer() {
        let sink = MemorySink::default();
        let (tx, rx) = mpsc::channel::<Trade>(16);
        let handle = tokio::spawn(BatchWriter::new(cfg(), sink, rx).run(CancellationToken::new()));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("writer should stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn long_reconnect_restarts_flush_period() {
        let sink = MemorySink::failing(0, 1);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let cfg = WriterConfig {
            reconnect_backoff_ms: 7_000,
            ..cfg()
        };
        let handle = tokio::spawn(BatchWriter::new(cfg, sink.clone(), rx).run(cancel.clone()));

        tx.send(trade(1, 1000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        sink.log.lock().unwrap().fail_connects = 2;

        // t=10 write fails; connects fail at 10 and 17, succeed at 24.
        tokio::time::sleep(Duration::from_millis(29_000)).await;
        assert_eq!(sink.connects(), 4);
        assert!(sink.writes().is_empty());

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        let writes = sink.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_holds_trades_while_connecting() {
        let sink = MemorySink::failing(3, 0);
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let cfg = WriterConfig {
            queue_capacity: 1,
            ..cfg()
        };
        let handle = tokio::spawn(BatchWriter::new(cfg, sink.clone(), rx).run(cancel.clone()));

        tx.send(trade(0, 1000)).await.unwrap();
        // Nothing is drained while the sink is down, so the producer waits.
        let blocked = tokio::time::timeout(Duration::from_millis(12_000), tx.send(trade(1, 1001))).await;
        assert!(blocked.is_err());
        assert_eq!(sink.connects(), 3);

        let producer_tx = tx.clone();
        let producer = tokio::spawn(async move {
            for i in 1..20 {
                producer_tx.send(trade(i, 1000 + i as i64)).await.unwrap();
            }
        });
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        producer.await.unwrap();
        tokio::time::sleep(Duration::from_millis(11_000)).await;

        let ids: Vec<i64> = sink.writes().iter().flatten().map(|p| p.timestamp).collect();
        assert_eq!(ids, (1000..1020).collect::<Vec<i64>>());

        cancel.cancel();
        handle.await.unwrap();
    }
}
