use std::sync::Arc;

use crate::{
    config::Settings,
    database::DatabasePool,
    repositories::{scan_repo::SqlxScanRepository, ScanRepository},
    services::{notifications, EventBus, ScanService},
};

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;

/// Shared application state containing all dependencies
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub db_pool: DatabasePool,
    pub scan_repository: Arc<dyn ScanRepository>,
    pub scan_service: Arc<ScanService>,
    pub event_bus: EventBus,
}

impl AppState {
    /// Create new application state with dependency injection
    pub async fn new(config: Settings) -> Result<Self, crate::error::ApiError> {
        let db_pool = crate::database::create_connection_pool(&config.database_url).await?;
        Self::new_with_pool(config, db_pool).await
    }

    /// Create new application state with existing database pool
    pub async fn new_with_pool(
        config: Settings,
        db_pool: DatabasePool,
    ) -> Result<Self, crate::error::ApiError> {
        let config = Arc::new(config);

        let scan_repository: Arc<dyn ScanRepository> =
            Arc::new(SqlxScanRepository::new(db_pool.clone()));

        // Scans left in flight by a previous process run can never resume;
        // close them out before accepting new work.
        let reconciled = scan_repository
            .reconcile_interrupted("interrupted by backend restart")
            .await?;
        if reconciled > 0 {
            tracing::warn!(count = reconciled, "reconciled interrupted scans on startup");
        }

        tokio::fs::create_dir_all(&config.scan_output_dir).await?;

        let event_bus = EventBus::new(config.event_buffer_size);
        let notifier = notifications::notifier_from_settings(&config);

        let scan_service = Arc::new(ScanService::new(
            config.clone(),
            scan_repository.clone(),
            event_bus.clone(),
            notifier,
        ));

        Ok(Self {
            config,
            db_pool,
            scan_repository,
            scan_service,
            event_bus,
        })
    }
}
