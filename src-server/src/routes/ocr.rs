//! OCR endpoints: page and batch requests, task lookups, cancellation,
//! and per-document history and statistics.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use ocrflow::batch::{BatchReceipt, BatchRequest, BatchStatus};
use ocrflow::enqueue::{EnqueueReceipt, EnqueueService};
use ocrflow::error::EnqueueError;
use ocrflow::model::{DocumentOcrStats, OcrRequest, OcrResult, OcrTask};

use super::ApiResponse;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct PagePath {
    document_id: String,
    page: String,
}

impl PagePath {
    fn page_number(&self) -> Result<i64, ApiError> {
        parse_page(&self.page)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    page: Option<String>,
}

fn parse_page(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>().map_err(|_| {
        ApiError::bad_request(format!(
            "page number must be a positive integer, got '{}'",
            raw
        ))
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

/// Runs a blocking call against the enqueue service off the reactor.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&EnqueueService) -> Result<T, EnqueueError> + Send + 'static,
{
    let pipeline = state.pipeline.clone();
    tokio::task::spawn_blocking(move || f(pipeline.enqueue()))
        .await
        .map_err(|e| ApiError::internal(format!("Request handler failed: {}", e)))?
        .map_err(ApiError::from)
}

fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))
}

/// POST /documents/{document_id}/pages/{page}/ocr
pub async fn request_ocr(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(path): Path<PagePath>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<EnqueueReceipt>>), ApiError> {
    let page = path.page_number()?;
    let request: OcrRequest = parse_body(&body)?;

    let document_id = path.document_id.clone();
    let receipt = blocking(&state, move |service| {
        service.request_processing(&document_id, page, &request)
    })
    .await?;

    log::info!(
        "User {} requested OCR of {} page {} (task {})",
        user,
        path.document_id,
        page,
        receipt.task_id
    );
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::ok(receipt))))
}

/// GET /documents/{document_id}/pages/{page}/ocr/status
pub async fn ocr_status(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(path): Path<PagePath>,
) -> ApiResult<OcrTask> {
    let page = path.page_number()?;
    let task = blocking(&state, move |service| {
        service.task_status(&path.document_id, page)
    })
    .await?;
    Ok(Json(ApiResponse::ok(task)))
}

/// GET /documents/{document_id}/pages/{page}/ocr/result
pub async fn ocr_result(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(path): Path<PagePath>,
) -> ApiResult<OcrResult> {
    let page = path.page_number()?;
    let result = blocking(&state, move |service| service.result(&path.document_id, page)).await?;
    Ok(Json(ApiResponse::ok(result)))
}

/// POST /ocr/tasks/{task_id}/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(task_id): Path<String>,
    body: Bytes,
) -> ApiResult<OcrTask> {
    let request: CancelRequest = parse_body(&body)?;
    let reason = request
        .reason
        .unwrap_or_else(|| format!("cancelled by {}", user));

    let task = blocking(&state, move |service| service.cancel_task(&task_id, &reason)).await?;
    Ok(Json(ApiResponse::ok(task)))
}

/// POST /documents/batch-ocr
pub async fn request_batch(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<BatchReceipt>>), ApiError> {
    let request: BatchRequest = parse_body(&body)?;
    let receipt = blocking(&state, move |service| service.request_batch(&request)).await?;

    log::info!(
        "User {} requested batch {} ({} of {} pages queued)",
        user,
        receipt.batch_id,
        receipt.queued,
        receipt.total_pages
    );
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::ok(receipt))))
}

/// GET /ocr/batches/{batch_id}/status
pub async fn batch_status(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(batch_id): Path<String>,
) -> ApiResult<BatchStatus> {
    let status = blocking(&state, move |service| service.batch_status(&batch_id)).await?;
    Ok(Json(ApiResponse::ok(status)))
}

/// GET /ocr/tasks/{task_id}/status
pub async fn task_status(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(task_id): Path<String>,
) -> ApiResult<OcrTask> {
    let task = blocking(&state, move |service| service.task_by_id(&task_id)).await?;
    Ok(Json(ApiResponse::ok(task)))
}

/// GET /documents/{document_id}/ocr/histories
pub async fn history(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(document_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<OcrTask>> {
    let page = query.page.as_deref().map(parse_page).transpose()?;
    let tasks = blocking(&state, move |service| service.task_history(&document_id, page)).await?;
    Ok(Json(ApiResponse::ok(tasks)))
}

/// GET /documents/{document_id}/ocr/stats
pub async fn statistics(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(document_id): Path<String>,
) -> ApiResult<DocumentOcrStats> {
    let stats = blocking(&state, move |service| service.statistics(&document_id)).await?;
    Ok(Json(ApiResponse::ok(stats)))
}
