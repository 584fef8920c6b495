//! Domain records shared by the queue, the task store and the workers.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::config::OcrDefaults;
use crate::error::EnqueueError;

/// Longest accepted document identifier.
pub const MAX_DOCUMENT_ID_LEN: usize = 255;

/// Lifecycle state shared by queue entries and OCR tasks.
///
/// `pending -> processing -> completed | failed`. Terminal states are never
/// left again; a retry is a new record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Current time in the fixed-width RFC 3339 form stored in every table.
///
/// Fixed width keeps lexicographic order equal to chronological order.
pub fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp column.
pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// One unit of document-level work in the processing queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub queue_id: i64,
    pub document_id: String,
    pub status: Status,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Output shape requested for a recognition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Fully resolved OCR options, stored with the task as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcrOptions {
    pub language: String,
    /// Minimum confidence the caller expects. Recorded, not enforced.
    pub confidence: u8,
    pub preprocess: bool,
    pub format: OutputFormat,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self::from_defaults(&OcrDefaults::default())
    }
}

impl OcrOptions {
    pub fn from_defaults(defaults: &OcrDefaults) -> Self {
        Self {
            language: defaults.default_language.clone(),
            confidence: defaults.default_confidence,
            preprocess: defaults.default_preprocess,
            format: defaults.default_format,
        }
    }
}

/// Options as submitted by a caller; missing fields take configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrRequest {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub confidence: Option<i64>,
    #[serde(default)]
    pub preprocess: Option<bool>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
    /// Queue priority for a newly created entry (default 1).
    #[serde(default)]
    pub priority: Option<i32>,
}

impl OcrRequest {
    /// Merges the request over the defaults, rejecting out-of-range values.
    pub fn resolve(&self, defaults: &OcrDefaults) -> Result<OcrOptions, EnqueueError> {
        let mut options = OcrOptions::from_defaults(defaults);

        if let Some(ref language) = self.language {
            let language = language.trim();
            if language.is_empty() {
                return Err(EnqueueError::InvalidRequest(
                    "language must not be empty".to_string(),
                ));
            }
            options.language = language.to_string();
        }
        if let Some(confidence) = self.confidence {
            if !(0..=100).contains(&confidence) {
                return Err(EnqueueError::InvalidRequest(format!(
                    "confidence must be between 0 and 100, got {}",
                    confidence
                )));
            }
            options.confidence = confidence as u8;
        }
        if let Some(preprocess) = self.preprocess {
            options.preprocess = preprocess;
        }
        if let Some(format) = self.format {
            options.format = format;
        }

        Ok(options)
    }
}

/// Engine output for one page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recognition {
    pub text: String,
    pub confidence: f64,
    pub engine: String,
    pub language: String,
    pub processing_ms: u64,
}

/// Per-page OCR task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcrTask {
    pub task_id: String,
    pub document_id: String,
    pub page_number: u32,
    pub status: Status,
    pub progress: u8,
    pub options: OcrOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Recognition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub estimated_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted text of one successfully recognized page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    pub result_id: String,
    pub document_id: String,
    pub page_number: u32,
    pub text: String,
    pub confidence: f64,
    pub engine: String,
    pub language: String,
    pub processing_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Recognized pages of one day.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyOcrStat {
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub processed_pages: u64,
    pub average_confidence: f64,
}

/// OCR activity of one document.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentOcrStats {
    pub document_id: String,
    pub processed_pages: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_confidence: Option<f64>,
    pub total_processing_ms: u64,
    pub pending_tasks: u64,
    pub processing_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub languages: BTreeMap<String, u64>,
    pub engines: BTreeMap<String, u64>,
    pub daily: Vec<DailyOcrStat>,
}

/// A validated `(document, page)` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub document_id: String,
    pub page_number: u32,
}

impl PageRef {
    pub fn new(document_id: &str, page_number: i64) -> Result<Self, EnqueueError> {
        validate_document_id(document_id)?;
        if page_number < 1 || page_number > u32::MAX as i64 {
            return Err(EnqueueError::InvalidRequest(format!(
                "page number must be a positive integer, got {}",
                page_number
            )));
        }
        Ok(Self {
            document_id: document_id.to_string(),
            page_number: page_number as u32,
        })
    }
}

impl std::fmt::Display for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.document_id, self.page_number)
    }
}

pub fn validate_document_id(document_id: &str) -> Result<(), EnqueueError> {
    if document_id.trim().is_empty() {
        return Err(EnqueueError::InvalidRequest(
            "document id must not be empty".to_string(),
        ));
    }
    if document_id.len() > MAX_DOCUMENT_ID_LEN {
        return Err(EnqueueError::InvalidRequest(format!(
            "document id exceeds {} bytes",
            MAX_DOCUMENT_ID_LEN
        )));
    }
    if document_id.chars().any(char::is_control) {
        return Err(EnqueueError::InvalidRequest(
            "document id contains control characters".to_string(),
        ));
    }
    Ok(())
}
