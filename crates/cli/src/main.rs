use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ksync_api::{InClusterAdapter, LoggingCallbacks};
use ksync_core::config::Config;
use ksync_kubehub::KubeCluster;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ksyncd", version, about = "Sync cluster resources with a remote backend")]
struct Cli {
    /// Path to the YAML or JSON configuration file
    #[arg(long = "config", env = "KSYNC_CONFIG", default_value = "/etc/config/config.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long = "check")]
    check: bool,

    /// Log filter directives, e.g. `info,ksync_kubehub=debug`
    #[arg(long = "log", env = "KSYNC_LOG", default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address (host:port)
    #[arg(long = "metrics-addr", env = "KSYNC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

fn init_tracing(directives: &str) {
    let filter = EnvFilter::from_str(directives);
    let invalid = filter.is_err();
    tracing_subscriber::fmt()
        .with_env_filter(filter.unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();
    if invalid {
        warn!(directives, "invalid log filter; using info");
    }
}

/// Install the Prometheus exporter for the `ksync_*` counters and histograms.
/// Without an address the metrics macros stay no-ops.
fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("installing metrics exporter on {addr}"))?;
    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    let cfg = Config::load(&cli.config).with_context(|| format!("loading config {}", cli.config.display()))?;
    info!(cluster = %cfg.cluster, kinds = cfg.resources.len(), "configuration loaded");
    if cli.check {
        return Ok(());
    }
    init_metrics(cli.metrics_addr)?;

    let cluster = KubeCluster::try_default().await.context("connecting to the cluster")?;
    let cancel = CancellationToken::new();
    let adapter = InClusterAdapter::new(&cfg, &cluster, Arc::new(LoggingCallbacks), cancel.clone());
    adapter.start();

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");
    adapter.shutdown().await;
    Ok(())
}
