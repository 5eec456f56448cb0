//! InfluxDB 1.x HTTP sink.
//!
//! Points go out as line protocol, one `POST /write` per flush:
//!
//! ```text
//! trades,pair=tBTCUSD,uniq=0 amount=-0.25,price=63000.5 1690000000000
//! ```

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::config::InfluxConfig;
use crate::schema::trade::{TradePoint, TRADES_MEASUREMENT};
use crate::util::truncate_for_log;
use crate::writer::TradeSink;

pub struct InfluxSink {
    cfg: InfluxConfig,
    client: Option<reqwest::Client>,
}

impl InfluxSink {
    pub fn new(cfg: InfluxConfig) -> Self {
        Self { cfg, client: None }
    }

    fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.cfg.timeout_secs.max(1)))
            .danger_accept_invalid_certs(!self.cfg.verify_ssl)
            .build()
            .context("build influxdb http client")
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.cfg.base_url())
    }
}

#[async_trait]
impl TradeSink for InfluxSink {
    async fn connect(&mut self) -> anyhow::Result<()> {
        self.client = None;
        let client = self.build_client()?;

        let resp = client
            .get(self.url("ping"))
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .send()
            .await
            .with_context(|| format!("ping influxdb {}", self.cfg.base_url()))?;
        ensure_success(resp, "ping").await?;

        let resp = client
            .get(self.url("query"))
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .query(&[("q", "SHOW DATABASES")])
            .send()
            .await
            .context("influxdb show databases")?;
        let body: QueryResponse = ensure_success(resp, "show databases")
            .await?
            .json()
            .await
            .context("decode show databases")?;
        if !body.lists_database(&self.cfg.database)? {
            anyhow::bail!("influxdb database {:?} does not exist", self.cfg.database);
        }

        info!(
            "influxdb connected: url={} db={}",
            self.cfg.base_url(),
            self.cfg.database
        );
        self.client = Some(client);
        Ok(())
    }

    async fn write_points(&mut self, points: &[TradePoint]) -> anyhow::Result<()> {
        let client = self.client.as_ref().context("influxdb not connected")?;
        let resp = client
            .post(self.url("write"))
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .query(&[("db", self.cfg.database.as_str()), ("precision", "ms")])
            .body(encode_lines(points))
            .send()
            .await
            .context("influxdb write")?;
        ensure_success(resp, "write").await?;
        Ok(())
    }
}

async fn ensure_success(resp: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!(
        "influxdb {what}: http {status}: {}",
        truncate_for_log(body.trim(), 256)
    )
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl QueryResponse {
    fn lists_database(&self, name: &str) -> anyhow::Result<bool> {
        if let Some(err) = self.results.iter().find_map(|r| r.error.as_deref()) {
            anyhow::bail!("influxdb query error: {err}");
        }
        Ok(self
            .results
            .iter()
            .flat_map(|r| &r.series)
            .flat_map(|s| &s.values)
            .any(|row| row.first().and_then(|v| v.as_str()) == Some(name)))
    }
}

pub fn encode_line(p: &TradePoint) -> String {
    format!(
        "{TRADES_MEASUREMENT},pair={},uniq={} amount={},price={} {}",
        escape_tag(&p.pair),
        p.uniq,
        p.amount,
        p.price,
        p.timestamp
    )
}

pub fn encode_lines(points: &[TradePoint]) -> String {
    points.iter().map(encode_line).collect::<Vec<_>>().join("\n")
}

fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
