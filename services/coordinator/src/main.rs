use anyhow::{Context, Result};
use coordinator_service::api::{start_api_server, AppState};
use coordinator_service::config::Config;
use coordinator_service::ingest::IngestCoordinator;
use coordinator_service::ledger::PostgresLedger;
use coordinator_service::metadata_store::PostgresMetadataStore;
use coordinator_service::queue::KafkaQueuePublisher;
use coordinator_service::reconciler::Reconciler;
use coordinator_service::s3_store::S3PhotoStore;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Snapmatch Ingestion Coordinator"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let metadata_store = Arc::new(
        PostgresMetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let ledger = Arc::new(PostgresLedger::new(
        metadata_store.pool().clone(),
        &config.ledger,
    ));

    let photo_store = Arc::new(
        S3PhotoStore::new(&config.s3)
            .await
            .context("Failed to initialize photo store")?,
    );

    let queue = Arc::new(
        KafkaQueuePublisher::new(&config.queue)
            .context("Failed to initialize queue producer")?,
    );

    let coordinator = Arc::new(IngestCoordinator::new(
        ledger.clone(),
        metadata_store.clone(),
        photo_store.clone(),
        queue.clone(),
        config.s3.content_type.clone(),
    ));

    // Spawn reconciliation sweep
    let shutdown = CancellationToken::new();
    let reconciler_handle = if config.reconciler.enabled {
        let reconciler = Reconciler::new(
            ledger.clone(),
            metadata_store.clone(),
            queue.clone(),
            config.reconciler.sweep_interval(),
            config.reconciler.pending_timeout(),
        );
        let token = shutdown.clone();
        Some(tokio::spawn(reconciler.run(token)))
    } else {
        info!("Reconciler disabled by configuration");
        None
    };

    // Create API state and spawn the server
    let api_state = AppState {
        coordinator,
        db_pool: metadata_store.pool().clone(),
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Ingestion coordinator started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down ingestion coordinator");

    shutdown.cancel();
    if let Some(handle) = reconciler_handle {
        let _ = handle.await;
    }
    api_handle.abort();

    info!("Ingestion coordinator stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
