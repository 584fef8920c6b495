//! Queue repository: operations on the `processing_queue` table.
//!
//! Functions take a `&Connection` so callers can compose them inside a
//! single [`Database::with_tx`](super::Database::with_tx) transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;
use crate::model::{now_timestamp, parse_timestamp, QueueEntry, Status};

fn entry_from_row(row: &Row<'_>) -> Result<QueueEntry, rusqlite::Error> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(QueueEntry {
        queue_id: row.get("queue_id")?,
        document_id: row.get("document_id")?,
        status: row.get("status")?,
        priority: row.get("priority")?,
        error_message: row.get("error_message")?,
        created_at: parse_timestamp(5, &created_at)?,
        updated_at: parse_timestamp(6, &updated_at)?,
    })
}

const COLUMNS: &str =
    "queue_id, document_id, status, priority, error_message, created_at, updated_at";

/// Inserts a pending entry and returns its queue id.
pub fn insert(conn: &Connection, document_id: &str, priority: i32) -> Result<i64, DatabaseError> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO processing_queue (document_id, status, priority, created_at, updated_at)
         VALUES (?1, 'pending', ?2, ?3, ?3)",
        params![document_id, priority, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Finds an entry by its queue id.
pub fn find_by_id(conn: &Connection, queue_id: i64) -> Result<Option<QueueEntry>, DatabaseError> {
    let sql = format!("SELECT {} FROM processing_queue WHERE queue_id = ?1", COLUMNS);
    Ok(conn
        .query_row(&sql, params![queue_id], entry_from_row)
        .optional()?)
}

/// Finds the pending or processing entry of a document, if any.
pub fn find_active_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Option<QueueEntry>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM processing_queue
         WHERE document_id = ?1 AND status IN ('pending', 'processing')",
        COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![document_id], entry_from_row)
        .optional()?)
}

/// Moves up to `limit` pending entries to processing and returns them.
///
/// Ordered by priority (highest first), then creation time, then queue id.
/// Must run inside a transaction for the claim to be atomic.
pub fn lease(conn: &Connection, limit: u32) -> Result<Vec<QueueEntry>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM processing_queue
         WHERE status = 'pending'
         ORDER BY priority DESC, created_at ASC, queue_id ASC
         LIMIT ?1",
        COLUMNS
    );
    let candidates = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], entry_from_row)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let now = now_timestamp();
    let mut leased = Vec::with_capacity(candidates.len());
    for mut entry in candidates {
        let changed = conn.execute(
            "UPDATE processing_queue SET status = 'processing', updated_at = ?2
             WHERE queue_id = ?1 AND status = 'pending'",
            params![entry.queue_id, now],
        )?;
        if changed == 1 {
            entry.status = Status::Processing;
            entry.updated_at = parse_timestamp(0, &now)?;
            leased.push(entry);
        }
    }
    Ok(leased)
}

/// Moves an entry from one of `from` to `to`, recording `error` when given.
///
/// Returns `false` if the entry was not in any of the source states.
pub fn transition(
    conn: &Connection,
    queue_id: i64,
    from: &[Status],
    to: Status,
    error: Option<&str>,
) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    let mut changed = 0;
    for source in from {
        changed += conn.execute(
            "UPDATE processing_queue
             SET status = ?3, error_message = COALESCE(?4, error_message), updated_at = ?5
             WHERE queue_id = ?1 AND status = ?2",
            params![queue_id, source, to, error, now],
        )?;
        if changed > 0 {
            break;
        }
    }
    Ok(changed > 0)
}

/// Lists every entry currently in `status`, oldest first.
pub fn list_by_status(conn: &Connection, status: Status) -> Result<Vec<QueueEntry>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM processing_queue WHERE status = ?1 ORDER BY queue_id ASC",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status], entry_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Counts entries in `status`.
pub fn count_by_status(conn: &Connection, status: Status) -> Result<u64, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM processing_queue WHERE status = ?1",
        params![status],
        |r| r.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let id = insert(conn, "doc-1", 3)?;
            let entry = find_by_id(conn, id)?.unwrap();
            assert_eq!(entry.document_id, "doc-1");
            assert_eq!(entry.status, Status::Pending);
            assert_eq!(entry.priority, 3);
            assert!(entry.error_message.is_none());
            assert!(find_by_id(conn, id + 100)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_lease_orders_by_priority_then_age() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let low = insert(conn, "low", 1)?;
            let high = insert(conn, "high", 5)?;
            let low2 = insert(conn, "low2", 1)?;

            let leased = lease(conn, 10)?;
            let ids: Vec<i64> = leased.iter().map(|e| e.queue_id).collect();
            assert_eq!(ids, vec![high, low, low2]);
            assert!(leased.iter().all(|e| e.status == Status::Processing));

            // Nothing left to lease.
            assert!(lease(conn, 10)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_transition_is_guarded() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let id = insert(conn, "doc", 1)?;
            // Not processing yet.
            assert!(!transition(conn, id, &[Status::Processing], Status::Completed, None)?);
            assert!(transition(conn, id, &[Status::Pending], Status::Processing, None)?);
            assert!(transition(
                conn,
                id,
                &[Status::Processing],
                Status::Failed,
                Some("boom")
            )?);
            // Terminal entries stay terminal.
            assert!(!transition(
                conn,
                id,
                &[Status::Pending, Status::Processing],
                Status::Completed,
                None
            )?);

            let entry = find_by_id(conn, id)?.unwrap();
            assert_eq!(entry.status, Status::Failed);
            assert_eq!(entry.error_message.as_deref(), Some("boom"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_active_lookup_and_counts() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let id = insert(conn, "doc", 1)?;
            assert_eq!(find_active_for_document(conn, "doc")?.unwrap().queue_id, id);
            transition(conn, id, &[Status::Pending], Status::Failed, Some("x"))?;
            assert!(find_active_for_document(conn, "doc")?.is_none());

            insert(conn, "doc", 1)?;
            assert_eq!(count_by_status(conn, Status::Pending)?, 1);
            assert_eq!(count_by_status(conn, Status::Failed)?, 1);
            assert_eq!(list_by_status(conn, Status::Failed)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }
}
