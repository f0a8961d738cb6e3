use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::signal;

use netmap_backend::{config, handlers, middleware, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first
    let config = config::Settings::new()?;

    // Initialize structured logging with configuration
    middleware::init_logging(&config.log_level, &config.log_format)?;

    tracing::info!("Starting NetMap Backend v{}", env!("CARGO_PKG_VERSION"));

    // Create application state with dependency injection
    let app_state = AppState::new(config.clone()).await?;

    // Create CORS layer with configuration
    let cors_layer = middleware::create_cors_layer(config.cors_allow_origins.clone());

    let app = Router::new()
        // Health check endpoints
        .route("/api/health", get(handlers::health_handlers::health_check))
        .route(
            "/api/health/simple",
            get(handlers::health_handlers::health_check_simple),
        )
        // Scan lifecycle endpoints
        .route("/api/scan", post(handlers::scan_handlers::trigger_scan))
        .route("/api/scan/:id", get(handlers::scan_handlers::get_scan))
        .route(
            "/api/scan/:id/status",
            get(handlers::scan_handlers::get_scan_status),
        )
        .route(
            "/api/scan/:id/cancel",
            post(handlers::scan_handlers::cancel_scan),
        )
        .route(
            "/api/scan/:id/insights",
            get(handlers::scan_handlers::list_insights),
        )
        .route(
            "/api/scan/:scan_id/insights/:insight_id/read",
            post(handlers::scan_handlers::mark_insight_read),
        )
        .route("/api/scans", get(handlers::scan_handlers::list_scans))
        .route(
            "/api/scans/active",
            get(handlers::scan_handlers::list_active_scans),
        )
        .route(
            "/api/scans/cancel-all",
            post(handlers::scan_handlers::cancel_all_scans),
        )
        .route(
            "/api/scans/upload",
            post(handlers::scan_handlers::upload_scan),
        )
        // Server-sent events
        .route("/api/events", get(handlers::event_handlers::scan_events))
        .with_state(app_state)
        // Apply middleware layers (global)
        .layer(axum::middleware::from_fn(
            middleware::request_logging_middleware,
        ))
        .layer(middleware::create_logging_layer())
        .layer(cors_layer);

    // Run the server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], 8000));
    tracing::info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signals
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
