use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Scan limit reached: {current} of {limit} concurrent scans already active")]
    AdmissionRejected { current: u32, limit: u32 },

    #[error("Scanner process failure: {0}")]
    ProcessFailure(String),

    #[error("Result parse error: {0}")]
    ParseError(String),

    #[error("Insight engine error: {0}")]
    InsightEngine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Unknown error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl ApiError {
    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new process failure error
    pub fn process_failure<T: Into<String>>(msg: T) -> Self {
        Self::ProcessFailure(msg.into())
    }

    /// Create a new parse error
    pub fn parse_error<T: Into<String>>(msg: T) -> Self {
        Self::ParseError(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_id = Uuid::new_v4();

        let (status, error_message, error_code) = match self {
            ApiError::Database(ref err) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %err,
                    "database error occurred"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    "DATABASE_ERROR",
                )
            }
            ApiError::Validation(ref msg) => {
                tracing::warn!(
                    error_id = %error_id,
                    error = %msg,
                    "validation error occurred"
                );
                (StatusCode::BAD_REQUEST, msg.clone(), "VALIDATION_ERROR")
            }
            ApiError::NotFound(ref msg) => {
                tracing::info!(
                    error_id = %error_id,
                    error = %msg,
                    "resource not found"
                );
                (StatusCode::NOT_FOUND, msg.clone(), "NOT_FOUND")
            }
            ApiError::AdmissionRejected { current, limit } => {
                tracing::warn!(
                    error_id = %error_id,
                    current = current,
                    limit = limit,
                    "scan admission rejected"
                );
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    format!(
                        "Scan limit reached: {} of {} concurrent scans already active",
                        current, limit
                    ),
                    "ADMISSION_REJECTED",
                )
            }
            ApiError::ProcessFailure(ref msg) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %msg,
                    "scanner process failure"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    msg.clone(),
                    "PROCESS_FAILURE",
                )
            }
            ApiError::ParseError(ref msg) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %msg,
                    "scan result parse error"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    msg.clone(),
                    "PARSE_ERROR",
                )
            }
            ApiError::InsightEngine(ref msg) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %msg,
                    "insight engine error"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    msg.clone(),
                    "INSIGHT_ENGINE_ERROR",
                )
            }
            ApiError::Io(ref err) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %err,
                    "IO error occurred"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "IO error".to_string(),
                    "IO_ERROR",
                )
            }
            ApiError::Serialization(ref err) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %err,
                    "serialization error occurred"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Serialization error".to_string(),
                    "SERIALIZATION_ERROR",
                )
            }
            ApiError::HttpClient(ref err) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %err,
                    "HTTP client error occurred"
                );
                (
                    StatusCode::BAD_GATEWAY,
                    "External service unavailable".to_string(),
                    "HTTP_CLIENT_ERROR",
                )
            }
            ApiError::Migration(ref err) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %err,
                    "database migration error occurred"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database migration error".to_string(),
                    "MIGRATION_ERROR",
                )
            }
            ApiError::Internal(ref msg) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %msg,
                    "internal server error occurred"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    msg.clone(),
                    "INTERNAL_ERROR",
                )
            }
            ApiError::Anyhow(ref err) => {
                tracing::error!(
                    error_id = %error_id,
                    error = %err,
                    "unexpected error occurred"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "code": error_code,
                "error_id": error_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn test_validation_handler() -> Result<&'static str, ApiError> {
        Err(ApiError::validation("Test validation error"))
    }

    async fn test_admission_handler() -> Result<&'static str, ApiError> {
        Err(ApiError::AdmissionRejected {
            current: 1,
            limit: 1,
        })
    }

    async fn test_not_found_handler() -> Result<&'static str, ApiError> {
        Err(ApiError::not_found("Scan not found"))
    }

    #[tokio::test]
    async fn test_validation_error_response() {
        let app = Router::new().route("/test", get(test_validation_handler));

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admission_rejected_maps_to_429() {
        let app = Router::new().route("/test", get(test_admission_handler));

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_not_found_error_response() {
        let app = Router::new().route("/test", get(test_not_found_handler));

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_constructors() {
        let validation_err = ApiError::validation("test");
        assert!(matches!(validation_err, ApiError::Validation(_)));

        let not_found_err = ApiError::not_found("test");
        assert!(matches!(not_found_err, ApiError::NotFound(_)));

        let process_err = ApiError::process_failure("test");
        assert!(matches!(process_err, ApiError::ProcessFailure(_)));

        let parse_err = ApiError::parse_error("test");
        assert!(matches!(parse_err, ApiError::ParseError(_)));

        let insight_err = ApiError::InsightEngine("test".to_string());
        assert_eq!(insight_err.to_string(), "Insight engine error: test");
    }

    #[test]
    fn test_admission_rejected_message() {
        let err = ApiError::AdmissionRejected {
            current: 2,
            limit: 2,
        };
        assert!(err.to_string().contains("2 of 2"));
    }
}
