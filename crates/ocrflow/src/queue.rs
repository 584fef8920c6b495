//! Durable, priority-ordered work queue of documents awaiting OCR.

use crate::db::{queue_repo, Database, DatabaseError};
use crate::model::{QueueEntry, Status};

/// Handle to the `processing_queue` table.
///
/// Only the scheduler leases; only the worker that received an entry
/// resolves it.
#[derive(Clone)]
pub struct ProcessingQueue {
    db: Database,
}

impl ProcessingQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Adds a pending entry for `document_id`.
    ///
    /// Fails with a unique violation if the document already has a pending
    /// or processing entry.
    pub fn enqueue(&self, document_id: &str, priority: i32) -> Result<i64, DatabaseError> {
        self.db
            .with_conn(|conn| queue_repo::insert(conn, document_id, priority))
    }

    /// Atomically claims up to `limit` pending entries.
    ///
    /// Returned entries are already `processing`. Two concurrent calls never
    /// return the same entry.
    pub fn lease_batch(&self, limit: u32) -> Result<Vec<QueueEntry>, DatabaseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.db.with_tx(|conn| queue_repo::lease(conn, limit))
    }

    /// `pending -> processing` for a single entry.
    pub fn mark_processing(&self, queue_id: i64) -> Result<bool, DatabaseError> {
        self.db.with_conn(|conn| {
            queue_repo::transition(conn, queue_id, &[Status::Pending], Status::Processing, None)
        })
    }

    /// `processing -> completed`. Returns `false` if the entry was not processing.
    pub fn mark_completed(&self, queue_id: i64) -> Result<bool, DatabaseError> {
        self.db.with_conn(|conn| {
            queue_repo::transition(conn, queue_id, &[Status::Processing], Status::Completed, None)
        })
    }

    /// Fails a non-terminal entry with `reason`.
    pub fn mark_failed(&self, queue_id: i64, reason: &str) -> Result<bool, DatabaseError> {
        self.db.with_conn(|conn| {
            queue_repo::transition(
                conn,
                queue_id,
                &[Status::Processing, Status::Pending],
                Status::Failed,
                Some(reason),
            )
        })
    }

    pub fn get(&self, queue_id: i64) -> Result<Option<QueueEntry>, DatabaseError> {
        self.db.with_conn(|conn| queue_repo::find_by_id(conn, queue_id))
    }

    /// The pending or processing entry of a document, if any.
    pub fn active_for_document(&self, document_id: &str) -> Result<Option<QueueEntry>, DatabaseError> {
        self.db
            .with_conn(|conn| queue_repo::find_active_for_document(conn, document_id))
    }

    pub fn count_by_status(&self, status: Status) -> Result<u64, DatabaseError> {
        self.db.with_conn(|conn| queue_repo::count_by_status(conn, status))
    }

    /// Fails every entry left in `processing` by a previous run.
    ///
    /// Called once at startup, before the scheduler leases anything.
    pub fn fail_interrupted(&self, reason: &str) -> Result<Vec<QueueEntry>, DatabaseError> {
        self.db.with_tx(|conn| {
            let stuck = queue_repo::list_by_status(conn, Status::Processing)?;
            for entry in &stuck {
                queue_repo::transition(
                    conn,
                    entry.queue_id,
                    &[Status::Processing],
                    Status::Failed,
                    Some(reason),
                )?;
            }
            Ok(stuck)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> ProcessingQueue {
        ProcessingQueue::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_enqueue_rejects_second_active_entry() {
        let queue = queue();
        queue.enqueue("doc", 1).unwrap();
        let err = queue.enqueue("doc", 1).unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_lease_batch_caps_and_claims() {
        let queue = queue();
        for i in 0..15 {
            queue.enqueue(&format!("doc-{}", i), 1).unwrap();
        }

        let first = queue.lease_batch(10).unwrap();
        assert_eq!(first.len(), 10);
        let second = queue.lease_batch(10).unwrap();
        assert_eq!(second.len(), 5);
        assert!(queue.lease_batch(10).unwrap().is_empty());

        let mut ids: Vec<i64> = first.iter().chain(&second).map(|e| e.queue_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 15);
        assert_eq!(queue.count_by_status(Status::Processing).unwrap(), 15);
    }

    #[test]
    fn test_lease_zero_is_noop() {
        let queue = queue();
        queue.enqueue("doc", 1).unwrap();
        assert!(queue.lease_batch(0).unwrap().is_empty());
        assert_eq!(queue.count_by_status(Status::Pending).unwrap(), 1);
    }

    #[test]
    fn test_terminal_entries_are_never_leased() {
        let queue = queue();
        let failed = queue.enqueue("a", 9).unwrap();
        queue.mark_failed(failed, "bad").unwrap();
        let done = queue.enqueue("b", 9).unwrap();
        queue.mark_processing(done).unwrap();
        queue.mark_completed(done).unwrap();
        let live = queue.enqueue("c", 1).unwrap();

        let leased = queue.lease_batch(10).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].queue_id, live);
    }

    #[test]
    fn test_mark_completed_requires_processing() {
        let queue = queue();
        let id = queue.enqueue("doc", 1).unwrap();
        assert!(!queue.mark_completed(id).unwrap());
        assert!(queue.mark_processing(id).unwrap());
        assert!(queue.mark_completed(id).unwrap());
        assert!(!queue.mark_failed(id, "late").unwrap());
        assert_eq!(queue.get(id).unwrap().unwrap().status, Status::Completed);
    }

    #[test]
    fn test_fail_interrupted() {
        let queue = queue();
        queue.enqueue("a", 1).unwrap();
        queue.enqueue("b", 1).unwrap();
        queue.lease_batch(1).unwrap();

        let stuck = queue.fail_interrupted("interrupted by restart").unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(queue.count_by_status(Status::Failed).unwrap(), 1);
        assert_eq!(queue.count_by_status(Status::Pending).unwrap(), 1);
    }
}
