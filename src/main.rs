//! Gridwatch service binary.
//!
//! Wires the camera registry, batch collector, worker pool, stats
//! aggregator, and HTTP control/streaming server together, then runs until
//! SIGINT/SIGTERM.
//!
//! # Configuration
//!
//! Loaded from config/default.toml, config/{RUN_MODE}.toml, then environment
//! variables prefixed with GRIDWATCH_ (e.g. GRIDWATCH_SERVER__PORT=9090).
//! See `config.rs` for the full set of options and defaults.

use anyhow::{Context, Result};
use gridwatch::collector::BatchCollector;
use gridwatch::config::{EngineConfig, LoggingConfig};
use gridwatch::detector::SyntheticDetector;
use gridwatch::registry::CameraRegistry;
use gridwatch::server::{start_api_server, AppState};
use gridwatch::source::{SyntheticSourceConfig, SyntheticSourceFactory};
use gridwatch::stats::StatsAggregator;
use gridwatch::worker_pool::WorkerPool;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.logging);

    info!(
        service = "gridwatch",
        version = env!("CARGO_PKG_VERSION"),
        channels = format!(
            "{}..={}",
            config.capture.channel_min, config.capture.channel_max
        ),
        "Starting detection serving engine"
    );

    config.validate().context("Invalid configuration")?;

    if config.stats.enable_metrics {
        init_metrics(config.stats.metrics_port)?;
    }

    // Data-plane components
    let factory = Arc::new(SyntheticSourceFactory::new(SyntheticSourceConfig {
        width: config.capture.source_width,
        height: config.capture.source_height,
        fps: config.capture.source_fps,
    }));
    let registry = Arc::new(CameraRegistry::new(config.capture.clone(), factory));
    let pool = Arc::new(WorkerPool::new(config.batch.workers));
    let detector = Arc::new(SyntheticDetector::new());

    let collector = Arc::new(BatchCollector::new(
        registry.clone(),
        pool.clone(),
        detector,
        config.batch.clone(),
    ));

    let aggregator = Arc::new(StatsAggregator::new(
        registry.clone(),
        collector.metrics(),
        config.stats.interval(),
        config.stats.broadcast_capacity,
    ));

    // Background cadence loops
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let collector_handle = tokio::spawn(collector.clone().run(shutdown_rx.clone()));
    let aggregator_handle = tokio::spawn(aggregator.clone().run(shutdown_rx));

    // Control/streaming server
    let api_state = AppState {
        registry: registry.clone(),
        stats: aggregator.clone(),
    };
    let server_config = config.server.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &server_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Engine started");

    shutdown_signal().await;
    info!("Initiating graceful shutdown");

    // Stop cadence loops first so no new batches are assembled, then tear
    // down cameras and drain the pool.
    let _ = shutdown_tx.send(true);
    let _ = collector_handle.await;
    let _ = aggregator_handle.await;
    server_handle.abort();

    let stop_registry = registry.clone();
    tokio::task::spawn_blocking(move || stop_registry.stop_all())
        .await
        .context("Failed to stop cameras")?;

    let stop_pool = pool.clone();
    tokio::task::spawn_blocking(move || stop_pool.shutdown())
        .await
        .context("Failed to drain worker pool")?;

    log_final_stats(&aggregator);
    info!("Shutdown complete");

    Ok(())
}

/// Initialize tracing/logging.
fn init_tracing(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Initialize the Prometheus metrics exporter.
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(aggregator: &StatsAggregator) {
    let snapshot = aggregator.build_snapshot();
    info!(
        frames_processed = snapshot.frames_processed_total,
        frames_dropped = snapshot.frames_dropped_total,
        batches_completed = snapshot.batches_completed,
        batches_failed = snapshot.batches_failed,
        "Final statistics"
    );
}
