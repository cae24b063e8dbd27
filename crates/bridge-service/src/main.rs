//! Meeting Bridge
//!
//! Entry point for the WeMeet to DingTalk meeting bridge.

use bridge_service::config::Config;
use bridge_service::observability::metrics::init_metrics_recorder;
use bridge_service::repositories::{PgSideEffectStore, PgUserIdentityStore};
use bridge_service::routes::{self, AppState, Collaborators};
use bridge_service::services::formatting::AppLinkBuilder;
use bridge_service::services::{DingtalkClient, DingtalkSettings, WemeetClient, WemeetCredentials};
use common::token_manager::{spawn_token_manager, TokenManagerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridge_service=debug,common=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Meeting Bridge");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        encrypted_payloads = config.payload_encrypted(),
        max_concurrent = config.webhook_max_concurrent,
        max_queue_length = config.webhook_max_queue_length,
        todo_enabled = config.todo_enabled,
        calendar_enabled = config.calendar_enabled,
        "Configuration loaded successfully"
    );

    // Metrics recorder must be installed before any metric is recorded
    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics recorder: {}", e);
        e
    })?;

    // Initialize database connection pool with query timeout
    info!("Connecting to database...");
    let db_url_with_timeout = add_query_timeout(&config.database_url, 5);
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_url_with_timeout)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;

    info!("Database connection established");

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            e
        })?;

    // DingTalk access token, refreshed in the background
    info!("Acquiring DingTalk access token...");
    let token_config = TokenManagerConfig::new(
        config.dingtalk_api_url.clone(),
        config.dingtalk_client_id.clone(),
        config.dingtalk_client_secret.clone(),
    );
    let (_token_task, token_receiver) = spawn_token_manager(token_config).await.map_err(|e| {
        error!("Failed to start token manager: {}", e);
        e
    })?;

    let dingtalk = DingtalkClient::new(
        DingtalkSettings {
            api_url: config.dingtalk_api_url.clone(),
            oapi_url: config.dingtalk_oapi_url.clone(),
            robot_code: config.dingtalk_robot_code.clone(),
            links: AppLinkBuilder::new(
                config.dingtalk_agent_id.clone(),
                config.dingtalk_corp_id.clone(),
            ),
        },
        token_receiver,
    )?;

    let wemeet = WemeetClient::new(
        config.wemeet_api_url.clone(),
        WemeetCredentials {
            app_id: config.wemeet_app_id.clone(),
            sdk_id: config.wemeet_sdk_id.clone(),
            secret_id: config.wemeet_secret_id.clone(),
            secret_key: config.wemeet_secret_key.clone(),
        },
    )?;

    let state = AppState::new(
        &config,
        Collaborators {
            directory: Arc::new(wemeet),
            notifier: Arc::new(dingtalk),
            side_effects: Arc::new(PgSideEffectStore::new(db_pool.clone())),
            identities: Arc::new(PgUserIdentityStore::new(db_pool)),
        },
    )?;
    let dispatcher = state.dispatcher.clone();
    let shutting_down = state.shutting_down.clone();

    // Build application routes
    let app = routes::build_routes(Arc::new(state), metrics_handle);

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    info!("Meeting Bridge listening on {}", addr);

    // Start server with graceful shutdown support
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutting_down, config.shutdown_drain_seconds))
    .await?;

    let pending = dispatcher.status();
    if pending.queue_length > 0 || pending.running_tasks > 0 {
        warn!(
            queue_length = pending.queue_length,
            running_tasks = pending.running_tasks,
            "Waiting for in-flight events"
        );
        if tokio::time::timeout(Duration::from_secs(30), dispatcher.wait_idle())
            .await
            .is_err()
        {
            warn!("In-flight events did not finish before shutdown");
        }
    }

    info!("Meeting Bridge shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
/// Marks the service not ready, then returns once the drain period is complete.
async fn shutdown_signal(shutting_down: Arc<AtomicBool>, drain_secs: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    shutting_down.store(true, Ordering::SeqCst);

    if drain_secs > 0 {
        warn!("Draining connections for {} seconds...", drain_secs);
        tokio::time::sleep(Duration::from_secs(drain_secs)).await;
        info!("Drain period complete");
    } else {
        info!("Skipping drain period (SHUTDOWN_DRAIN_SECONDS=0)");
    }
}

/// Adds statement_timeout to the database URL.
fn add_query_timeout(url: &str, timeout_secs: u32) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}options=-c%20statement_timeout%3D{}s",
        url, separator, timeout_secs
    )
}
