use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use curlme_controller::{Controller, ControllerConfig};
use curlme_kubehub::{get_kube_client, ConfigMapFeed, KubeRecorder, KubeStore};
use curlme_transform::{DataPopulator, HttpFetcher, DEFAULT_ANNOTATION};
use tokio::sync::watch;
use tracing::{info, warn};

mod health;

const CONTROLLER_NAME: &str = "curlme-controller";

#[derive(Parser, Debug)]
#[command(name = "curlme", version, about = "Fills ConfigMap data from URLs named in an annotation")]
struct Cli {
    /// Watch a single namespace (default: all namespaces)
    #[arg(long = "ns", env = "CURLME_NAMESPACE")]
    namespace: Option<String>,

    /// Annotation holding the `<dataKey>=<url>` directive
    #[arg(long, env = "CURLME_ANNOTATION", default_value = DEFAULT_ANNOTATION)]
    annotation: String,

    /// Number of reconcile workers
    #[arg(long, env = "CURLME_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Timeout for URL fetches, API writes and event publishing
    #[arg(long, env = "CURLME_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    request_timeout_secs: u64,

    /// First retry delay for a failing key
    #[arg(long, env = "CURLME_BASE_DELAY_MS", default_value_t = 5)]
    base_delay_ms: u64,

    /// Retry delay cap for a failing key
    #[arg(long, env = "CURLME_MAX_DELAY_SECS", default_value_t = 1000)]
    max_delay_secs: u64,

    /// Overall retry rate across all keys
    #[arg(long, env = "CURLME_QPS", default_value_t = 10.0)]
    qps: f64,

    #[arg(long, env = "CURLME_BURST", default_value_t = 100)]
    burst: u32,

    /// Drop a key after this many failed retries (default: retry forever)
    #[arg(long, env = "CURLME_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Re-enqueue every cached ConfigMap at this interval; 0 disables
    #[arg(long, env = "CURLME_RESYNC_SECS", default_value_t = 0)]
    resync_secs: u64,

    /// Capacity of the watch event channel
    #[arg(long, env = "CURLME_QUEUE_CAP", default_value_t = 2048)]
    queue_cap: usize,

    #[arg(long, env = "CURLME_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 120)]
    cache_sync_timeout_secs: u64,

    /// Grace period for in-flight reconciles on shutdown; keep it above twice
    /// the request timeout
    #[arg(long, env = "CURLME_SHUTDOWN_TIMEOUT_SECS", default_value_t = 25)]
    shutdown_timeout_secs: u64,

    /// Address for /health and /readiness
    #[arg(long, env = "CURLME_HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    health_addr: SocketAddr,

    /// Prometheus exporter address (disabled when unset)
    #[arg(long, env = "CURLME_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

impl Cli {
    fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            request_timeout: self.request_timeout(),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            qps: self.qps,
            burst: self.burst,
            max_retries: self.max_retries,
            resync: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            channel_cap: self.queue_cap,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("CURLME_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid CURLME_METRICS_ADDR; expected host:port"),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = term => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    let client = get_kube_client().await?;
    let fetcher = HttpFetcher::new(cli.request_timeout()).context("building HTTP client")?;
    let transform = DataPopulator::new(Arc::new(fetcher), cli.annotation.clone());
    let feed = ConfigMapFeed::new(client.clone(), cli.namespace.as_deref());
    let store = KubeStore::new(client.clone());
    let instance = std::env::var("POD_NAME").ok();
    let recorder = KubeRecorder::new(client, CONTROLLER_NAME, instance, cli.request_timeout());

    let mut controller =
        Controller::new(cli.controller_config(), Arc::new(feed), Arc::new(store), Arc::new(transform), Arc::new(recorder));

    let (stop_tx, stop_rx) = watch::channel(false);
    let health = tokio::spawn(health::serve(cli.health_addr, controller.readiness(), stop_rx));

    info!(ns = ?cli.namespace, annotation = %cli.annotation, workers = cli.workers, "starting controller");
    let started = tokio::select! {
        res = controller.start() => {
            res.context("starting controller")?;
            true
        }
        _ = shutdown_signal() => false,
    };
    if started {
        shutdown_signal().await;
    }
    info!("shutting down gracefully");
    controller.stop().await.context("stopping controller")?;

    stop_tx.send_replace(true);
    match health.await {
        Ok(Err(e)) => warn!(error = %e, "health server exited with error"),
        Err(e) => warn!(error = %e, "health server task failed"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
