use anyhow::{Context, Result};
use partybox_intake::webhook::start_api_server;
use partybox_intake::{
    AppState, ArchiveBuilder, BotApi, BrightnessFilter, Config, CounterStore, EventAdapter,
    IntakePipeline, StorageLayout, TelegramClient,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound for finishing in-flight updates on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        photo_limit = config.intake.photo_limit,
        storage_root = %config.intake.storage_root.display(),
        "Starting Partybox intake service"
    );

    if config.telegram.privileged_user_id.is_none() {
        warn!("No privileged user configured, /download_all is disabled");
    }

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let layout = StorageLayout::new(config.intake.storage_root.clone());
    layout
        .check_writable()
        .await
        .context("Storage root is not writable")?;

    let counters = Arc::new(CounterStore::new(layout.clone()));
    let intake = Arc::new(IntakePipeline::new(
        layout.clone(),
        counters.clone(),
        Arc::new(BrightnessFilter::from(&config.filter)),
        config.intake.photo_limit,
        config.transform_timeout(),
    ));

    let bot: Arc<dyn BotApi> = Arc::new(
        TelegramClient::new(&config.telegram, config.request_timeout())
            .context("Failed to initialize Telegram client")?,
    );

    let adapter = Arc::new(EventAdapter::new(
        bot.clone(),
        intake,
        counters.clone(),
        ArchiveBuilder::new(layout.clone()),
        config.privileged_user(),
    ));

    let tasks = TaskTracker::new();
    let api_state = AppState {
        adapter,
        bot,
        layout,
        counters,
        webhook_secret: config.telegram.webhook_secret.clone(),
        public_host: config.telegram.public_host.clone(),
        tasks: tasks.clone(),
    };

    // Spawn API server task
    let shutdown = CancellationToken::new();
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "Webhook server error");
        }
    });

    info!("Intake service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down intake service");
    shutdown.cancel();

    if let Err(e) = api_handle.await {
        error!(error = %e, "Webhook server task failed");
    }

    // Let updates already accepted finish and reply.
    tasks.close();
    info!(in_flight = tasks.len(), "Waiting for in-flight updates");
    if tokio::time::timeout(DRAIN_TIMEOUT, tasks.wait()).await.is_err() {
        warn!(
            in_flight = tasks.len(),
            "Shutdown drain timed out, abandoning remaining updates"
        );
    }

    info!("Intake service stopped");

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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
