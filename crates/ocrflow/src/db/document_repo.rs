//! Document repository: `documents` and `document_pages` tables.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;
use crate::model::now_timestamp;

/// A raw document row from the database.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub document_id: String,
    pub title: String,
    pub file_path: Option<String>,
    pub processing_status: String,
    pub processing_error: Option<String>,
    pub processing_progress: i64,
    pub is_processed: bool,
    pub page_count: u32,
    pub processing_completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            document_id: row.get("document_id")?,
            title: row.get("title")?,
            file_path: row.get("file_path")?,
            processing_status: row.get("processing_status")?,
            processing_error: row.get("processing_error")?,
            processing_progress: row.get("processing_progress")?,
            is_processed: row.get("is_processed")?,
            page_count: row.get("page_count")?,
            processing_completed_at: row.get("processing_completed_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A raw page row.
#[derive(Debug, Clone)]
pub struct PageRow {
    pub document_id: String,
    pub page_number: u32,
    pub content_type: Option<String>,
    pub source: Option<Vec<u8>>,
    pub text: Option<String>,
    pub word_count: i64,
    pub character_count: i64,
}

impl PageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            document_id: row.get("document_id")?,
            page_number: row.get("page_number")?,
            content_type: row.get("content_type")?,
            source: row.get("source")?,
            text: row.get("text")?,
            word_count: row.get("word_count")?,
            character_count: row.get("character_count")?,
        })
    }
}

/// Inserts a new document in the `pending` processing state.
pub fn insert(
    conn: &Connection,
    document_id: &str,
    title: &str,
    file_path: Option<&str>,
    page_count: u32,
) -> Result<(), DatabaseError> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO documents (document_id, title, file_path, page_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![document_id, title, file_path, page_count, now],
    )?;
    Ok(())
}

/// Finds a document by id.
pub fn find_by_id(conn: &Connection, document_id: &str) -> Result<Option<DocumentRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM documents WHERE document_id = ?1",
            params![document_id],
            DocumentRow::from_row,
        )
        .optional()?)
}

/// Whether a document row exists.
pub fn exists(conn: &Connection, document_id: &str) -> Result<bool, DatabaseError> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE document_id = ?1",
        params![document_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Stores (or replaces) the raw source of a page.
pub fn upsert_page_source(
    conn: &Connection,
    document_id: &str,
    page_number: u32,
    content_type: &str,
    source: &[u8],
) -> Result<(), DatabaseError> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO document_pages (document_id, page_number, content_type, source, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(document_id, page_number)
         DO UPDATE SET content_type = excluded.content_type, source = excluded.source,
                       updated_at = excluded.updated_at",
        params![document_id, page_number, content_type, source, now],
    )?;
    Ok(())
}

/// Finds a page row.
pub fn find_page(
    conn: &Connection,
    document_id: &str,
    page_number: u32,
) -> Result<Option<PageRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM document_pages WHERE document_id = ?1 AND page_number = ?2",
            params![document_id, page_number],
            PageRow::from_row,
        )
        .optional()?)
}

/// Stores recognized text for a page, creating the page row if needed.
pub fn save_page_text(
    conn: &Connection,
    document_id: &str,
    page_number: u32,
    text: &str,
) -> Result<(), DatabaseError> {
    let now = now_timestamp();
    let word_count = text.split_whitespace().count() as i64;
    let character_count = text.chars().count() as i64;
    conn.execute(
        "INSERT INTO document_pages (document_id, page_number, text, word_count,
         character_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(document_id, page_number)
         DO UPDATE SET text = excluded.text, word_count = excluded.word_count,
                       character_count = excluded.character_count,
                       updated_at = excluded.updated_at",
        params![document_id, page_number, text, word_count, character_count, now],
    )?;
    Ok(())
}

/// Flags a document as processed. Returns `false` if it does not exist.
pub fn mark_processed(conn: &Connection, document_id: &str) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE documents SET is_processed = 1, processing_status = 'completed',
         processing_progress = 100, processing_error = NULL,
         processing_completed_at = ?2, updated_at = ?2
         WHERE document_id = ?1",
        params![document_id, now],
    )?;
    Ok(changed == 1)
}

/// Flags a document as failed with `message`. Returns `false` if it does not exist.
pub fn mark_failed(conn: &Connection, document_id: &str, message: &str) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE documents SET processing_status = 'failed', processing_error = ?2,
         updated_at = ?3
         WHERE document_id = ?1",
        params![document_id, message, now],
    )?;
    Ok(changed == 1)
}
