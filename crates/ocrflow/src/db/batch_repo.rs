//! Batch repository: `ocr_batches` and its task links.

use rusqlite::{params, Connection, OptionalExtension};

use super::DatabaseError;
use crate::batch::BatchRecord;
use crate::model::{format_timestamp, parse_timestamp, Status};

pub fn insert(conn: &Connection, batch: &BatchRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO ocr_batches (batch_id, total_documents, total_pages, estimated_seconds,
         created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            batch.batch_id,
            batch.total_documents,
            batch.total_pages,
            batch.estimated_seconds,
            format_timestamp(&batch.created_at),
        ],
    )?;
    Ok(())
}

/// Records that `task_id` was created by the batch.
pub fn link_task(conn: &Connection, batch_id: &str, task_id: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO ocr_batch_tasks (batch_id, task_id) VALUES (?1, ?2)",
        params![batch_id, task_id],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, batch_id: &str) -> Result<Option<BatchRecord>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT batch_id, total_documents, total_pages, estimated_seconds, created_at
             FROM ocr_batches WHERE batch_id = ?1",
            params![batch_id],
            |row| {
                let created_at: String = row.get(4)?;
                Ok(BatchRecord {
                    batch_id: row.get(0)?,
                    total_documents: row.get(1)?,
                    total_pages: row.get(2)?,
                    estimated_seconds: row.get(3)?,
                    created_at: parse_timestamp(4, &created_at)?,
                })
            },
        )
        .optional()?)
}

/// Counts the batch's tasks per status.
pub fn count_tasks_by_status(
    conn: &Connection,
    batch_id: &str,
) -> Result<Vec<(Status, u64)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT t.status, COUNT(*) FROM ocr_batch_tasks b
         JOIN ocr_tasks t ON t.task_id = b.task_id
         WHERE b.batch_id = ?1 GROUP BY t.status",
    )?;
    let rows = stmt.query_map(params![batch_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Mean confidence over the batch's completed pages.
pub fn average_confidence(conn: &Connection, batch_id: &str) -> Result<Option<f64>, DatabaseError> {
    Ok(conn.query_row(
        "SELECT AVG(r.confidence) FROM ocr_batch_tasks b
         JOIN ocr_tasks t ON t.task_id = b.task_id
         JOIN ocr_results r ON r.document_id = t.document_id AND r.page_number = t.page_number
         WHERE b.batch_id = ?1 AND t.status = 'completed'",
        params![batch_id],
        |row| row.get(0),
    )?)
}
