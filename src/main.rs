use anyhow::Context;
use tracing::info;

use trade_recorder::config::Config;
use trade_recorder::pipeline::Pipeline;
use trade_recorder::writer::InfluxSink;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

fn config_path(args: &[String]) -> anyhow::Result<String> {
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" {
            return args
                .get(i + 1)
                .cloned()
                .context("--config requires a path");
        }
        i += 1;
    }
    Ok(DEFAULT_CONFIG_PATH.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let path = config_path(&args)?;
    let cfg = Config::load(&path).with_context(|| format!("load config {path}"))?;
    log_config_summary(&cfg);

    let pipeline = Pipeline::spawn(
        cfg.feed.clone(),
        cfg.writer.clone(),
        InfluxSink::new(cfg.influxdb.clone()),
    );

    wait_for_shutdown().await?;
    info!("shutdown requested");
    pipeline.shutdown().await;
    Ok(())
}

fn log_config_summary(cfg: &Config) {
    info!(
        "feed: endpoint={} symbols={:?} reconnect_backoff_ms={} ack_window_ms={}",
        cfg.feed.endpoint, cfg.feed.symbols, cfg.feed.reconnect_backoff_ms, cfg.feed.ack_window_ms
    );
    info!(
        "influxdb: url={} db={} user={} verify_ssl={}",
        cfg.influxdb.base_url(),
        cfg.influxdb.database,
        cfg.influxdb.username,
        cfg.influxdb.verify_ssl
    );
    info!(
        "writer: flush_interval_ms={} queue_capacity={} flush_on_shutdown={}",
        cfg.writer.flush_interval_ms, cfg.writer.queue_capacity, cfg.writer.flush_on_shutdown
    );
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
