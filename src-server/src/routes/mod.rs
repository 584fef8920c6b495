//! HTTP routes.
//!
//! - `ocr`: page and batch OCR requests, task and batch status, results,
//!   cancellation, per-document history and statistics
//! - `/health`: pipeline liveness and queue depth

pub mod ocr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use ocrflow::runtime::HealthReport;

use crate::error::ApiError;
use crate::state::AppState;

/// Response wrapper for API calls.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/documents/{document_id}/pages/{page}/ocr",
            post(ocr::request_ocr),
        )
        .route(
            "/documents/{document_id}/pages/{page}/ocr/status",
            get(ocr::ocr_status),
        )
        .route(
            "/documents/{document_id}/pages/{page}/ocr/result",
            get(ocr::ocr_result),
        )
        .route("/documents/batch-ocr", post(ocr::request_batch))
        .route("/documents/{document_id}/ocr/histories", get(ocr::history))
        .route("/documents/{document_id}/ocr/stats", get(ocr::statistics))
        .route("/ocr/tasks/{task_id}/status", get(ocr::task_status))
        .route("/ocr/tasks/{task_id}/cancel", post(ocr::cancel_task))
        .route("/ocr/batches/{batch_id}/status", get(ocr::batch_status))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<HealthReport>>), ApiError> {
    let pipeline = state.pipeline.clone();
    let report = tokio::task::spawn_blocking(move || pipeline.health())
        .await
        .map_err(|e| ApiError::internal(format!("Health check failed: {}", e)))?
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let status = if report.running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(ApiResponse::ok(report))))
}
