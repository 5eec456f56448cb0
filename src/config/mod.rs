use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub influxdb: InfluxConfig,

    #[serde(default)]
    pub writer: WriterConfig,
}

impl Config {
    /// Reads `path` (a missing file means defaults), applies environment overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            Self::from_path(path)?
        } else {
            Self::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Overlays the deployment environment variables on top of the file values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("TICKER_SYMBOLS") {
            self.feed.symbols = parse_symbol_list(&raw);
        }
        if let Some(host) = lookup("INFLUXDB_HOST") {
            self.influxdb.host = host;
        }
        if let Some(raw) = lookup("INFLUXDB_PORT") {
            self.influxdb.port = raw
                .trim()
                .parse::<u16>()
                .map_err(|err| ConfigError::invalid("INFLUXDB_PORT", err.to_string()))?;
        }
        if let Some(raw) = lookup("INFLUXDB_USE_SSL") {
            self.influxdb.use_ssl = parse_bool("INFLUXDB_USE_SSL", &raw)?;
        }
        if let Some(raw) = lookup("INFLUXDB_VERIFY_SSL") {
            self.influxdb.verify_ssl = parse_bool("INFLUXDB_VERIFY_SSL", &raw)?;
        }
        if let Some(db) = lookup("INFLUXDB_DATABASE") {
            self.influxdb.database = db;
        }
        if let Some(user) = lookup("INFLUXDB_USERNAME") {
            self.influxdb.username = user;
        }
        if let Some(pass) = lookup("INFLUXDB_PASSWORD") {
            self.influxdb.password = pass;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.symbols.is_empty() {
            return Err(ConfigError::Missing("feed.symbols / TICKER_SYMBOLS"));
        }
        let mut seen = HashSet::new();
        for symbol in &self.feed.symbols {
            if symbol.trim().is_empty() {
                return Err(ConfigError::invalid("feed.symbols", "blank symbol"));
            }
            if !seen.insert(symbol.as_str()) {
                return Err(ConfigError::invalid(
                    "feed.symbols",
                    format!("duplicate symbol {symbol}"),
                ));
            }
        }

        let endpoint = url::Url::parse(&self.feed.endpoint)
            .map_err(|err| ConfigError::invalid("feed.endpoint", err.to_string()))?;
        if endpoint.scheme() != "ws" && endpoint.scheme() != "wss" {
            return Err(ConfigError::invalid(
                "feed.endpoint",
                format!("unsupported scheme {}", endpoint.scheme()),
            ));
        }
        if self.feed.ack_window_ms == 0 {
            return Err(ConfigError::invalid("feed.ack_window_ms", "must be > 0"));
        }

        if self.influxdb.host.trim().is_empty() {
            return Err(ConfigError::Missing("influxdb.host / INFLUXDB_HOST"));
        }
        if self.influxdb.port == 0 {
            return Err(ConfigError::invalid("influxdb.port", "must be > 0"));
        }
        if self.influxdb.database.trim().is_empty() {
            return Err(ConfigError::Missing("influxdb.database / INFLUXDB_DATABASE"));
        }
        if self.influxdb.username.is_empty() {
            return Err(ConfigError::Missing("influxdb.username / INFLUXDB_USERNAME"));
        }
        if self.influxdb.password.is_empty() {
            return Err(ConfigError::Missing("influxdb.password / INFLUXDB_PASSWORD"));
        }

        if self.writer.queue_capacity == 0 {
            return Err(ConfigError::invalid("writer.queue_capacity", "must be > 0"));
        }
        if self.writer.flush_interval_ms == 0 {
            return Err(ConfigError::invalid("writer.flush_interval_ms", "must be > 0"));
        }
        Ok(())
    }
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("not a boolean: {other}"))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_endpoint")]
    pub endpoint: String,

    // Subscribed in this order.
    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default = "default_feed_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// How long to wait for every symbol's `subscribed` event after the requests went out.
    #[serde(default = "default_feed_ack_window_ms")]
    pub ack_window_ms: u64,

    #[serde(default = "default_feed_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_feed_ping_every_secs")]
    pub ping_every_secs: u64,

    #[serde(default = "default_feed_idle_dead_secs")]
    pub idle_dead_secs: u64,

    #[serde(default = "default_feed_api_version")]
    pub api_version: u64,
}

impl FeedConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn ack_window(&self) -> Duration {
        Duration::from_millis(self.ack_window_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: default_feed_endpoint(),
            symbols: vec![],
            reconnect_backoff_ms: default_feed_reconnect_backoff_ms(),
            ack_window_ms: default_feed_ack_window_ms(),
            connect_timeout_secs: default_feed_connect_timeout_secs(),
            ping_every_secs: default_feed_ping_every_secs(),
            idle_dead_secs: default_feed_idle_dead_secs(),
            api_version: default_feed_api_version(),
        }
    }
}

fn default_feed_endpoint() -> String {
    "wss://api-pub.bitfinex.com/ws/2".to_string()
}

fn default_feed_reconnect_backoff_ms() -> u64 {
    10_000
}

fn default_feed_ack_window_ms() -> u64 {
    5_000
}

fn default_feed_connect_timeout_secs() -> u64 {
    15
}

fn default_feed_ping_every_secs() -> u64 {
    15
}

fn default_feed_idle_dead_secs() -> u64 {
    90
}

fn default_feed_api_version() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_influx_port")]
    pub port: u16,

    #[serde(default)]
    pub use_ssl: bool,

    #[serde(default)]
    pub verify_ssl: bool,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_influx_timeout_secs")]
    pub timeout_secs: u64,
}

impl InfluxConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_influx_port(),
            use_ssl: false,
            verify_ssl: false,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_secs: default_influx_timeout_secs(),
        }
    }
}

fn default_influx_port() -> u16 {
    8086
}

fn default_influx_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_writer_flush_interval_ms")]
    pub flush_interval_ms: u64,

    // Bounded queue between the feed connector and the writer. A full queue
    // blocks the feed read loop instead of dropping trades.
    #[serde(default = "default_writer_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempt one last write of the pending batch when cancelled.
    #[serde(default)]
    pub flush_on_shutdown: bool,

    /// Pause between failed storage connection attempts.
    #[serde(default = "default_writer_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_writer_flush_interval_ms(),
            queue_capacity: default_writer_queue_capacity(),
            flush_on_shutdown: false,
            reconnect_backoff_ms: default_writer_reconnect_backoff_ms(),
        }
    }
}

fn default_writer_flush_interval_ms() -> u64 {
    10_000
}

fn default_writer_queue_capacity() -> usize {
    1_000
}

fn default_writer_reconnect_backoff_ms() -> u64 {
    5_000
}
