use crate::{
    error::ApiError,
    models::{ScanRecord, ScanStatusResponse, TriggerScanRequest},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub async fn trigger_scan(
    State(app_state): State<AppState>,
    Json(payload): Json<TriggerScanRequest>,
) -> Result<(StatusCode, Json<ScanRecord>), ApiError> {
    let scan = app_state.scan_service.clone().trigger_scan(payload).await?;
    Ok((StatusCode::ACCEPTED, Json(scan)))
}

pub async fn cancel_scan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScanRecord>, ApiError> {
    let scan = app_state.scan_service.cancel_scan(&id).await?;
    Ok(Json(scan))
}

pub async fn cancel_all_scans(
    State(app_state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = app_state.scan_service.cancel_all_active().await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

pub async fn get_scan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScanRecord>, ApiError> {
    let scan = app_state.scan_service.get_scan(&id).await?;
    Ok(Json(scan))
}

pub async fn get_scan_status(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScanStatusResponse>, ApiError> {
    let status = app_state.scan_service.get_status(&id).await?;
    Ok(Json(status))
}

pub async fn list_active_scans(
    State(app_state): State<AppState>,
) -> Result<Json<Vec<ScanRecord>>, ApiError> {
    let scans = app_state.scan_service.list_active().await?;
    Ok(Json(scans))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_scans(
    State(app_state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ScanRecord>>, ApiError> {
    let scans = app_state
        .scan_service
        .list_history(query.limit, query.offset)
        .await?;
    Ok(Json(scans))
}

/// Accepts a raw nmap XML document as the request body and imports it as a
/// completed scan.
pub async fn upload_scan(
    State(app_state): State<AppState>,
    body: String,
) -> Result<Json<ScanRecord>, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::validation("Empty upload body"));
    }
    let scan = app_state.scan_service.import_uploaded_xml(&body).await?;
    Ok(Json(scan))
}

#[derive(Debug, Deserialize)]
pub struct InsightQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub min_priority: Option<i32>,
}

pub async fn list_insights(
    State(app_state): State<AppState>,
    Path(scan_id): Path<Uuid>,
    Query(query): Query<InsightQuery>,
) -> Result<Json<Vec<crate::models::Insight>>, ApiError> {
    let insights = app_state
        .scan_service
        .list_insights(&scan_id, query.unread_only, query.min_priority)
        .await?;
    Ok(Json(insights))
}

pub async fn mark_insight_read(
    State(app_state): State<AppState>,
    Path((scan_id, insight_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<crate::models::Insight>, ApiError> {
    let insight = app_state
        .scan_service
        .mark_insight_read(&scan_id, &insight_id)
        .await?;
    Ok(Json(insight))
}
