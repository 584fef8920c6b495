//! Task repository: operations on the `ocr_tasks` table.
//!
//! Every status change is a guarded UPDATE that names its source state(s)
//! and reports whether a row changed.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;
use crate::model::{now_timestamp, parse_timestamp, OcrTask, Recognition, Status};

const COLUMNS: &str = "task_id, document_id, page_number, status, progress, options_json, \
     result_json, error_message, estimated_seconds, started_at, completed_at, created_at, updated_at";

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn optional_timestamp(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn task_from_row(row: &Row<'_>) -> Result<OcrTask, rusqlite::Error> {
    let options_json: String = row.get("options_json")?;
    let result_json: Option<String> = row.get("result_json")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(OcrTask {
        task_id: row.get("task_id")?,
        document_id: row.get("document_id")?,
        page_number: row.get("page_number")?,
        status: row.get("status")?,
        progress: row.get("progress")?,
        options: json_column(5, &options_json)?,
        result: result_json
            .map(|raw| json_column::<Recognition>(6, &raw))
            .transpose()?,
        error_message: row.get("error_message")?,
        estimated_seconds: row.get("estimated_seconds")?,
        started_at: optional_timestamp(9, row.get("started_at")?)?,
        completed_at: optional_timestamp(10, row.get("completed_at")?)?,
        created_at: parse_timestamp(11, &created_at)?,
        updated_at: parse_timestamp(12, &updated_at)?,
    })
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<OcrTask>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, task_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Inserts a new task row. Unique index violations surface unchanged so the
/// caller can classify them.
pub fn insert(conn: &Connection, task: &OcrTask) -> Result<(), DatabaseError> {
    let options_json = serde_json::to_string(&task.options)?;
    let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO ocr_tasks (task_id, document_id, page_number, status, progress,
         options_json, result_json, error_message, estimated_seconds, started_at,
         completed_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            task.task_id,
            task.document_id,
            task.page_number,
            task.status,
            task.progress,
            options_json,
            result_json,
            task.error_message,
            task.estimated_seconds,
            task.started_at.as_ref().map(crate::model::format_timestamp),
            task.completed_at.as_ref().map(crate::model::format_timestamp),
            crate::model::format_timestamp(&task.created_at),
            crate::model::format_timestamp(&task.updated_at),
        ],
    )?;
    Ok(())
}

/// Finds a task by its id.
pub fn find_by_id(conn: &Connection, task_id: &str) -> Result<Option<OcrTask>, DatabaseError> {
    let sql = format!("SELECT {} FROM ocr_tasks WHERE task_id = ?1", COLUMNS);
    Ok(conn
        .query_row(&sql, params![task_id], task_from_row)
        .optional()?)
}

/// Finds the most recently created task for a page.
pub fn find_latest_for_page(
    conn: &Connection,
    document_id: &str,
    page_number: u32,
) -> Result<Option<OcrTask>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM ocr_tasks WHERE document_id = ?1 AND page_number = ?2
         ORDER BY created_at DESC, rowid DESC LIMIT 1",
        COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![document_id, page_number], task_from_row)
        .optional()?)
}

/// Finds the task for a page in one of `statuses`, newest first.
pub fn find_for_page_in(
    conn: &Connection,
    document_id: &str,
    page_number: u32,
    statuses: &[Status],
) -> Result<Option<OcrTask>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM ocr_tasks WHERE document_id = ?1 AND page_number = ?2 AND status = ?3
         ORDER BY created_at DESC, rowid DESC LIMIT 1",
        COLUMNS
    );
    for status in statuses {
        if let Some(task) = conn
            .query_row(&sql, params![document_id, page_number, status], task_from_row)
            .optional()?
        {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

/// Lists a document's tasks in `status`, ordered by page.
pub fn list_for_document(
    conn: &Connection,
    document_id: &str,
    status: Status,
) -> Result<Vec<OcrTask>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM ocr_tasks WHERE document_id = ?1 AND status = ?2
         ORDER BY page_number ASC, created_at ASC",
        COLUMNS
    );
    query_tasks(conn, &sql, params![document_id, status])
}

/// Lists a document's tasks of every state, newest first, optionally for
/// one page.
pub fn list_history(
    conn: &Connection,
    document_id: &str,
    page_number: Option<u32>,
) -> Result<Vec<OcrTask>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM ocr_tasks WHERE document_id = ?1 AND (?2 IS NULL OR page_number = ?2)
         ORDER BY created_at DESC, rowid DESC",
        COLUMNS
    );
    query_tasks(conn, &sql, params![document_id, page_number])
}

/// Counts a document's tasks per status.
pub fn count_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Vec<(Status, u64)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM ocr_tasks WHERE document_id = ?1 GROUP BY status",
    )?;
    let rows = stmt.query_map(params![document_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Lists every task in `status`, oldest first.
pub fn list_by_status(conn: &Connection, status: Status) -> Result<Vec<OcrTask>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM ocr_tasks WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
        COLUMNS
    );
    query_tasks(conn, &sql, params![status])
}

/// Moves a pending task to processing and stamps `started_at`.
pub fn set_processing(conn: &Connection, task_id: &str) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE ocr_tasks SET status = 'processing', started_at = ?2, updated_at = ?2
         WHERE task_id = ?1 AND status = 'pending'",
        params![task_id, now],
    )?;
    Ok(changed == 1)
}

/// Raises progress of a processing task. Never lowers it.
pub fn set_progress(conn: &Connection, task_id: &str, progress: u8) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE ocr_tasks SET progress = MAX(progress, ?2), updated_at = ?3
         WHERE task_id = ?1 AND status = 'processing'",
        params![task_id, progress.min(100), now],
    )?;
    Ok(changed == 1)
}

/// Completes a processing task with its recognition payload.
pub fn set_completed(
    conn: &Connection,
    task_id: &str,
    result: &Recognition,
) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    let result_json = serde_json::to_string(result)?;
    let changed = conn.execute(
        "UPDATE ocr_tasks SET status = 'completed', progress = 100, result_json = ?2,
         completed_at = ?3, updated_at = ?3
         WHERE task_id = ?1 AND status = 'processing'",
        params![task_id, result_json, now],
    )?;
    Ok(changed == 1)
}

/// Fails a non-terminal task with `reason`.
pub fn set_failed(conn: &Connection, task_id: &str, reason: &str) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE ocr_tasks SET status = 'failed', error_message = ?2,
         completed_at = ?3, updated_at = ?3
         WHERE task_id = ?1 AND status IN ('pending', 'processing')",
        params![task_id, reason, now],
    )?;
    Ok(changed == 1)
}

/// Counts tasks in `status`.
pub fn count_by_status(conn: &Connection, status: Status) -> Result<u64, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM ocr_tasks WHERE status = ?1",
        params![status],
        |r| r.get(0),
    )?)
}
