//! Tributary Server - Main entry point

use anyhow::Result;
use std::{net::SocketAddr, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tributary_common::logging::{init_logging, LogConfig};
use tributary_engine::IntegrationService;

use tributary_server::{config::Config, create_app, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over these defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("tributary-server")
        .filter_directives("tributary_server=debug,tributary_engine=info,tower_http=debug")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting Tributary server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let service = build_service(&config).await?;

    let recovered = service.recover_orphaned_runs().await?;
    if recovered > 0 {
        warn!(recovered, "Finalized sync runs left unfinished by a previous process");
    }

    let shutdown = CancellationToken::new();
    let scheduler = service.spawn_scheduler(shutdown.clone());
    info!(
        tick_secs = config.engine.scheduler_tick_secs,
        max_concurrent_syncs = config.engine.max_concurrent_syncs,
        "Scheduler started"
    );

    let app = create_app(AppState::new(service), &config.cors);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }

    info!("Server shut down gracefully");

    Ok(())
}

/// Build the integration service on the configured store
async fn build_service(config: &Config) -> Result<IntegrationService> {
    #[allow(unused_mut)]
    let mut builder = IntegrationService::builder(config.engine.clone());

    match &config.database {
        #[cfg(feature = "database")]
        Some(database) => {
            let store =
                tributary_engine::PgStore::connect(&database.url, database.max_connections).await?;
            store.migrate().await?;
            info!("Database connection pool established and migrations applied");
            builder = builder.store(std::sync::Arc::new(store));
        }
        #[cfg(not(feature = "database"))]
        Some(_) => {
            warn!("DATABASE_URL is set but the server was built without the `database` feature; using the in-memory store");
        }
        None => {
            info!("DATABASE_URL not set; using the in-memory store");
        }
    }

    Ok(builder.build())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
