use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::exchange::bitfinex_msg::{self, EventMessage, FeedMessage};
use crate::exchange::subscriptions::SubscriptionTracker;
use crate::schema::trade::Trade;
use crate::util::{metrics, truncate_for_log};
use crate::ws::{WsOptions, WsSession};

// `info` code asking clients to reconnect (server restart).
const INFO_CODE_RECONNECT: i64 = 20051;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribing,
    AwaitingAck,
    Active,
    Stopped,
}

/// Outcome of handling one text frame.
#[derive(Debug, PartialEq)]
pub enum Step {
    Continue,
    Emit(Trade),
    Reconnect(String),
}

/// Owns the Bitfinex websocket: connects, subscribes every configured symbol to
/// the `trades` channel, checks the acknowledgements and forwards trade updates.
pub struct FeedConnector {
    cfg: FeedConfig,
    sender: mpsc::Sender<Trade>,
    subscriptions: SubscriptionTracker,
    session: Option<WsSession>,
    state: FeedState,
    connect_failures: u64,
    restarts: u64,
}

impl FeedConnector {
    pub fn new(cfg: FeedConfig, sender: mpsc::Sender<Trade>) -> Self {
        Self {
            cfg,
            sender,
            subscriptions: SubscriptionTracker::new(),
            session: None,
            state: FeedState::Connecting,
            connect_failures: 0,
            restarts: 0,
        }
    }

    /// Runs until `cancel` fires or the trade queue is closed.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "feed connector start: endpoint={} symbols={:?}",
            self.cfg.endpoint, self.cfg.symbols
        );
        loop {
            if cancel.is_cancelled() {
                self.state = FeedState::Stopped;
            }
            let next = match self.state {
                FeedState::Stopped => break,
                FeedState::Connecting => self.connect(&cancel).await,
                FeedState::Subscribing => self.subscribe(&cancel).await,
                FeedState::AwaitingAck => self.await_acks(&cancel).await,
                FeedState::Active => self.read_loop(&cancel).await,
                FeedState::Disconnected => self.disconnect(&cancel).await,
            };
            if next != self.state {
                debug!("feed state {:?} -> {:?}", self.state, next);
            }
            self.state = next;
        }

        self.subscriptions.reset();
        if let Some(session) = self.session.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await;
        }
        info!(
            "feed connector stopped: restarts={} trades={} parse_errors={}",
            self.restarts,
            metrics::trades_received_total(),
            metrics::parse_errors_total()
        );
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> FeedState {
        let opts = WsOptions {
            connect_timeout: Duration::from_secs(self.cfg.connect_timeout_secs),
            ping_every: Duration::from_secs(self.cfg.ping_every_secs),
            idle_dead: Duration::from_secs(self.cfg.idle_dead_secs),
        };
        let res = tokio::select! {
            _ = cancel.cancelled() => return FeedState::Stopped,
            res = WsSession::connect(&self.cfg.endpoint, opts) => res,
        };
        match res {
            Ok(session) => {
                info!("connect bitfinex: endpoint={}", self.cfg.endpoint);
                self.connect_failures = 0;
                self.session = Some(session);
                FeedState::Subscribing
            }
            Err(err) => {
                self.connect_failures += 1;
                let backoff = self.cfg.reconnect_backoff();
                if self.connect_failures == 1 || self.connect_failures % 10 == 0 {
                    warn!(
                        "bitfinex connect failed: {err:#} backoff_ms={} failures={}",
                        backoff.as_millis(),
                        self.connect_failures
                    );
                } else {
                    debug!("bitfinex connect failed: {err:#}");
                }
                tokio::select! {
                    _ = cancel.cancelled() => FeedState::Stopped,
                    _ = tokio::time::sleep(backoff) => FeedState::Connecting,
                }
            }
        }
    }

    async fn subscribe(&mut self, cancel: &CancellationToken) -> FeedState {
        let Some(session) = self.session.as_mut() else {
            return FeedState::Disconnected;
        };
        for symbol in &self.cfg.symbols {
            let req = bitfinex_msg::subscribe_request(symbol);
            let res = tokio::select! {
                _ = cancel.cancelled() => return FeedState::Stopped,
                res = session.send_text(req) => res,
            };
            if let Err(err) = res {
                warn!("bitfinex subscribe {symbol} failed: {err:#}");
                return FeedState::Disconnected;
            }
        }
        debug!("bitfinex subscribe sent: symbols={}", self.cfg.symbols.len());
        FeedState::AwaitingAck
    }

    async fn await_acks(&mut self, cancel: &CancellationToken) -> FeedState {
        let deadline = tokio::time::Instant::now() + self.cfg.ack_window();
        loop {
            let Some(session) = self.session.as_mut() else {
                return FeedState::Disconnected;
            };
            let frame = tokio::select! {
                _ = cancel.cancelled() => return FeedState::Stopped,
                _ = tokio::time::sleep_until(deadline) => break,
                frame = session.next_text() => frame,
            };
            if let Some(next) = self.on_frame(frame, cancel).await {
                return next;
            }
        }

        if self.subscriptions.is_complete(&self.cfg.symbols) {
            info!(
                "bitfinex subscriptions complete: channels={}",
                self.subscriptions.len()
            );
            FeedState::Active
        } else {
            warn!(
                "bitfinex subscriptions incomplete after {}ms: missing={:?}",
                self.cfg.ack_window_ms,
                self.subscriptions.missing(&self.cfg.symbols)
            );
            FeedState::Disconnected
        }
    }

    async fn read_loop(&mut self, cancel: &CancellationToken) -> FeedState {
        loop {
            let Some(session) = self.session.as_mut() else {
                return FeedState::Disconnected;
            };
            let frame = tokio::select! {
                _ = cancel.cancelled() => return FeedState::Stopped,
                frame = session.next_text() => frame,
            };
            if let Some(next) = self.on_frame(frame, cancel).await {
                return next;
            }
        }
    }

    /// Sessions that end before the ack window elapses are followed by the
    /// reconnect backoff, so a server that drops us right after the upgrade
    /// does not get hammered.
    async fn disconnect(&mut self, cancel: &CancellationToken) -> FeedState {
        self.subscriptions.reset();
        self.restarts += 1;
        let Some(session) = self.session.take() else {
            return FeedState::Connecting;
        };
        let lived = session.duration();
        info!(
            "bitfinex ws ended: frames={} duration_ms={}",
            session.frames(),
            lived.as_millis()
        );
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await;

        if lived >= self.cfg.ack_window() {
            return FeedState::Connecting;
        }
        let backoff = self.cfg.reconnect_backoff();
        debug!(
            "bitfinex session ended after {}ms; backoff_ms={}",
            lived.as_millis(),
            backoff.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => FeedState::Stopped,
            _ = tokio::time::sleep(backoff) => FeedState::Connecting,
        }
    }

    /// `None` keeps the current state; `Some` is the next state.
    async fn on_frame(
        &mut self,
        frame: anyhow::Result<Option<String>>,
        cancel: &CancellationToken,
    ) -> Option<FeedState> {
        let text = match frame {
            Ok(Some(text)) => text,
            Ok(None) => {
                warn!("bitfinex ws closed");
                return Some(FeedState::Disconnected);
            }
            Err(err) => {
                warn!("bitfinex ws read failed: {err:#}");
                return Some(FeedState::Disconnected);
            }
        };

        match self.on_text(&text) {
            Step::Continue => None,
            Step::Reconnect(reason) => {
                warn!("bitfinex reconnect: {reason}");
                Some(FeedState::Disconnected)
            }
            Step::Emit(trade) => {
                tokio::select! {
                    _ = cancel.cancelled() => Some(FeedState::Stopped),
                    res = self.sender.send(trade) => match res {
                        Ok(()) => None,
                        Err(_) => {
                            warn!("trade queue closed; stopping feed");
                            Some(FeedState::Stopped)
                        }
                    },
                }
            }
        }
    }

    pub fn on_text(&mut self, text: &str) -> Step {
        match bitfinex_msg::classify(text) {
            Ok(FeedMessage::Event(ev)) => self.on_event(ev),
            Ok(FeedMessage::Update(update)) => match self.subscriptions.resolve(update.chan_id) {
                Some(pair) => {
                    metrics::inc_trades_received();
                    Step::Emit(Trade::new(
                        update.id,
                        update.timestamp,
                        pair,
                        update.amount,
                        update.price,
                    ))
                }
                None => Step::Continue,
            },
            Ok(FeedMessage::Unrecognized) => Step::Continue,
            Err(err) => {
                metrics::inc_parse_errors();
                warn!(
                    "bitfinex parse failed: {err} text={}",
                    truncate_for_log(text, 512)
                );
                Step::Continue
            }
        }
    }

    fn on_event(&mut self, ev: EventMessage) -> Step {
        if let Some((chan_id, symbol)) = ev.trades_subscription() {
            info!("bitfinex subscribed: symbol={symbol} chan_id={chan_id}");
            self.subscriptions.record(chan_id, symbol);
            return Step::Continue;
        }
        match ev.event.as_str() {
            "info" => {
                if let Some(version) = ev.version {
                    if version != self.cfg.api_version {
                        return Step::Reconnect(format!(
                            "api version {version} not supported (expected {})",
                            self.cfg.api_version
                        ));
                    }
                    info!("bitfinex api version {version}");
                }
                if ev.code == Some(INFO_CODE_RECONNECT) {
                    return Step::Reconnect("server requested reconnect (20051)".to_string());
                }
                if let Some(code) = ev.code {
                    info!("bitfinex info: code={code} msg={:?}", ev.msg);
                }
                Step::Continue
            }
            "error" => {
                warn!(
                    "bitfinex error: code={:?} msg={:?} symbol={:?}",
                    ev.code, ev.msg, ev.symbol
                );
                Step::Continue
            }
            other => {
                debug!("bitfinex event ignored: {other}");
                Step::Continue
            }
        }
    }
}
