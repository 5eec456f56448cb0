use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WS_WATCHDOG_TICK_SECS: u64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct WsOptions {
    pub connect_timeout: Duration,
    pub ping_every: Duration,
    pub idle_dead: Duration,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            ping_every: Duration::from_secs(15),
            idle_dead: Duration::from_secs(90),
        }
    }
}

/// One websocket connection: text frames out, text frames in.
///
/// Keeps the connection alive with periodic pings, answers server pings, and
/// reports an error once nothing has arrived for `idle_dead`.
pub struct WsSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    ping: Interval,
    watchdog: Interval,
    idle_dead: Duration,
    last_msg_ts: Instant,
    started: Instant,
    frames: u64,
}

impl WsSession {
    pub async fn connect(url: &str, opts: WsOptions) -> anyhow::Result<Self> {
        let (ws, _) = tokio::time::timeout(opts.connect_timeout, connect_async(url))
            .await
            .context("connect ws: timeout")?
            .context("connect ws")?;
        let (write, read) = ws.split();

        let mut ping = interval(opts.ping_every.max(Duration::from_millis(100)));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; nothing to ping yet.
        ping.reset();
        let mut watchdog = interval(Duration::from_secs(WS_WATCHDOG_TICK_SECS));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            write,
            read,
            ping,
            watchdog,
            idle_dead: opts.idle_dead,
            last_msg_ts: Instant::now(),
            started: Instant::now(),
            frames: 0,
        })
    }

    pub async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.write
            .send(Message::Text(text))
            .await
            .context("send ws text")
    }

    /// Next text frame, or `None` once the server closed the connection.
    pub async fn next_text(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            tokio::select! {
                _ = self.ping.tick() => {
                    self.write.send(Message::Ping(Vec::new())).await.context("send active ping")?;
                }
                _ = self.watchdog.tick() => {
                    if self.last_msg_ts.elapsed() > self.idle_dead {
                        let _ = self.write.send(Message::Close(None)).await;
                        anyhow::bail!("ws watchdog: idle for >{}s", self.idle_dead.as_secs());
                    }
                }
                next = self.read.next() => {
                    let Some(msg) = next else { return Ok(None) };
                    let msg = msg.context("read ws msg")?;
                    self.frames += 1;
                    self.last_msg_ts = Instant::now();
                    match msg {
                        Message::Text(text) => return Ok(Some(text)),
                        Message::Binary(_) => {}
                        Message::Ping(payload) => {
                            self.write
                                .send(Message::Pong(payload))
                                .await
                                .context("send pong")?;
                        }
                        Message::Pong(_) => {}
                        Message::Close(c) => {
                            if let Some(cf) = c {
                                tracing::warn!("ws closed by server: code={} reason={}", cf.code, cf.reason);
                            } else {
                                tracing::warn!("ws closed by server: (no info)");
                            }
                            return Ok(None);
                        }
                        Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sends our close frame; later sends fail.
    #[cfg(test)]
    pub(crate) async fn close_write(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }

    pub async fn close(mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}
