use crate::{database, error::ApiError, AppState};
use axum::{extract::State, response::Json};
use serde_json::{json, Value};

/// Process-only liveness probe; no dependencies touched.
pub async fn health_check_simple() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Liveness/readiness probe: reports service and database health.
pub async fn health_check(State(app_state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let db_healthy = database::health_check(&app_state.db_pool).await.is_ok();

    Ok(Json(json!({
        "status": if db_healthy { "healthy" } else { "degraded" },
        "database": if db_healthy { "up" } else { "down" },
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
