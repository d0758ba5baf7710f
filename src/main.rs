//! protorpc - demo server
//!
//! Serves the diagnostics service over a ZeroMQ ROUTER socket using the
//! configured execution strategy.

mod diagnostics;

use protorpc_server::{
    run_metrics_server, Config, ExecutionStrategy, Metrics, Server, StrategyKind,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if PROTORPC_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("PROTORPC_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting protorpc server");
    tracing::info!("  Bind endpoint: {}", config.server.bind);
    tracing::info!("  Service: {}", diagnostics::SERVICE_NAME);

    match config.server.strategy {
        StrategyKind::Pooled => {
            tracing::info!("  Strategy: pooled (pool size {})", config.server.pool_size);
            serve(&config, config.server.pooled_strategy()).await
        }
        StrategyKind::Broker => {
            tracing::info!(
                "  Strategy: broker ({} workers, poll {} ms)",
                config.server.workers,
                config.server.poll_interval_ms
            );
            serve(&config, config.server.broker_strategy()).await
        }
    }
}

async fn serve<S: ExecutionStrategy>(
    config: &Config,
    strategy: S,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = Arc::new(diagnostics::service());

    let server = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        let server = Arc::new(Server::with_metrics(service, strategy, metrics.clone()));

        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
        tracing::info!("  Metrics: enabled on {}", addr);
        server
    } else {
        tracing::info!("  Metrics: disabled");
        Arc::new(Server::new(service, strategy))
    };

    server.bind(&config.server.bind).await?;

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Served {} requests ({} replies, {} dropped)",
        stats.received(),
        stats.replied(),
        stats.dropped()
    );
    Ok(())
}
