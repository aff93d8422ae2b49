//! NoETL Control Plane Server
//!
//! Serves the control API and runs the broker loop that advances every
//! live execution.

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_control_plane::{
    config::{AppConfig, DatabaseConfig},
    db::{create_pool, schema},
    engine::Broker,
    handlers,
    state::AppState,
};

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,noetl_control_plane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the application router with all routes.
fn build_router(state: AppState) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health))
        // Catalog
        .route("/api/catalog/register", post(handlers::catalog::register))
        .route("/api/catalog/list", get(handlers::catalog::list))
        .route("/api/catalog/resource", get(handlers::catalog::get_resource))
        // Executions
        .route("/api/executions", post(handlers::executions::start))
        .route("/api/executions", get(handlers::executions::list))
        .route(
            "/api/executions/{execution_id}/status",
            get(handlers::executions::get_status),
        )
        .route(
            "/api/executions/{execution_id}/cancel",
            post(handlers::executions::cancel),
        )
        .route(
            "/api/executions/{execution_id}/cancellation-check",
            get(handlers::executions::cancellation_check),
        )
        // Worker events
        .route("/api/events", post(handlers::events::publish))
        // Jobs
        .route("/api/jobs/lease", get(handlers::jobs::lease))
        .route("/api/jobs/{key}/ack", post(handlers::jobs::ack))
        .route("/api/jobs/{key}/nack", post(handlers::jobs::nack))
        .route("/api/jobs/{key}/extend", post(handlers::jobs::extend))
        // Workers
        .route("/api/workers/register", post(handlers::workers::register))
        .route(
            "/api/workers/{name}/heartbeat",
            post(handlers::workers::heartbeat),
        )
        .route("/api/workers/{name}", delete(handlers::workers::deregister))
        .route("/api/workers", get(handlers::workers::list))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Connect to NATS if configured.
async fn connect_nats(config: &AppConfig) -> Option<async_nats::Client> {
    if let Some(ref nats_url) = config.nats_url {
        match async_nats::connect(nats_url).await {
            Ok(client) => {
                tracing::info!(url = %nats_url, "Connected to NATS");
                Some(client)
            }
            Err(e) => {
                tracing::warn!(error = %e, url = %nats_url, "Failed to connect to NATS, continuing without it");
                None
            }
        }
    } else {
        tracing::info!("NATS not configured, wake-ups fall back to poll intervals");
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting NoETL Control Plane"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    schema::init_schema(&db_pool).await?;

    let nats_client = connect_nats(&app_config).await;

    let state = AppState::new(db_pool, app_config.clone(), nats_client);

    // The broker shares the server's services and wake channel.
    let broker = Broker::new(
        state.config.clone(),
        state.events.clone(),
        state.catalog.clone(),
        state.queue.clone(),
        state.registry.clone(),
        state.executions.clone(),
        state.notifier.clone(),
    );
    let broker_handle = tokio::spawn(broker.run());

    let app = build_router(state);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker_handle.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
