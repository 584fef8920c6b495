//! Result repository: the write-once `ocr_results` table.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;
use crate::model::{format_timestamp, parse_timestamp, DailyOcrStat, OcrResult};

/// Result column a document's pages can be grouped by.
#[derive(Debug, Clone, Copy)]
pub enum Breakdown {
    Engine,
    Language,
}

impl Breakdown {
    fn column(self) -> &'static str {
        match self {
            Breakdown::Engine => "engine",
            Breakdown::Language => "language",
        }
    }
}

/// Totals over a document's results.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSummary {
    pub pages: u64,
    pub average_confidence: Option<f64>,
    pub processing_ms: u64,
}

fn result_from_row(row: &Row<'_>) -> Result<OcrResult, rusqlite::Error> {
    let created_at: String = row.get("created_at")?;
    Ok(OcrResult {
        result_id: row.get("result_id")?,
        document_id: row.get("document_id")?,
        page_number: row.get("page_number")?,
        text: row.get("text")?,
        confidence: row.get("confidence")?,
        engine: row.get("engine")?,
        language: row.get("language")?,
        processing_ms: row.get::<_, i64>("processing_ms")?.max(0) as u64,
        created_at: parse_timestamp(8, &created_at)?,
    })
}

/// Inserts a result row. Fails with a unique violation if the page already
/// has one.
pub fn insert(conn: &Connection, result: &OcrResult) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO ocr_results (result_id, document_id, page_number, text, confidence,
         engine, language, processing_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            result.result_id,
            result.document_id,
            result.page_number,
            result.text,
            result.confidence,
            result.engine,
            result.language,
            result.processing_ms as i64,
            format_timestamp(&result.created_at),
        ],
    )?;
    Ok(())
}

/// Finds the result of a page.
pub fn find_for_page(
    conn: &Connection,
    document_id: &str,
    page_number: u32,
) -> Result<Option<OcrResult>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT result_id, document_id, page_number, text, confidence, engine, language,
             processing_ms, created_at
             FROM ocr_results WHERE document_id = ?1 AND page_number = ?2",
            params![document_id, page_number],
            result_from_row,
        )
        .optional()?)
}

pub fn summary_for_document(conn: &Connection, document_id: &str) -> Result<ResultSummary, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COUNT(*), AVG(confidence), COALESCE(SUM(processing_ms), 0)
         FROM ocr_results WHERE document_id = ?1",
        params![document_id],
        |row| {
            Ok(ResultSummary {
                pages: row.get(0)?,
                average_confidence: row.get(1)?,
                processing_ms: row.get::<_, i64>(2)?.max(0) as u64,
            })
        },
    )?)
}

/// Page counts of a document grouped by `by`.
pub fn distribution(
    conn: &Connection,
    document_id: &str,
    by: Breakdown,
) -> Result<BTreeMap<String, u64>, DatabaseError> {
    let sql = format!(
        "SELECT {0}, COUNT(*) FROM ocr_results WHERE document_id = ?1 GROUP BY {0}",
        by.column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![document_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
}

/// Recognized pages per UTC day, oldest first.
pub fn daily_for_document(conn: &Connection, document_id: &str) -> Result<Vec<DailyOcrStat>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT substr(created_at, 1, 10) AS day, COUNT(*), AVG(confidence)
         FROM ocr_results WHERE document_id = ?1 GROUP BY day ORDER BY day",
    )?;
    let rows = stmt.query_map(params![document_id], |row| {
        Ok(DailyOcrStat {
            date: row.get(0)?,
            processed_pages: row.get(1)?,
            average_confidence: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Utc;

    fn result(id: &str) -> OcrResult {
        OcrResult {
            result_id: id.to_string(),
            document_id: "doc".to_string(),
            page_number: 1,
            text: "recognized".to_string(),
            confidence: 95.2,
            engine: "markup".to_string(),
            language: "zh".to_string(),
            processing_ms: 12,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &result("r1"))?;
            let found = find_for_page(conn, "doc", 1)?.unwrap();
            assert_eq!(found.text, "recognized");
            assert_eq!(found.processing_ms, 12);
            assert!(find_for_page(conn, "doc", 2)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_document_aggregates() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let empty = summary_for_document(conn, "doc")?;
            assert_eq!(empty.pages, 0);
            assert_eq!(empty.average_confidence, None);
            assert!(daily_for_document(conn, "doc")?.is_empty());

            insert(conn, &result("r1"))?;
            let mut second = result("r2");
            second.page_number = 2;
            second.confidence = 85.2;
            second.engine = "tesseract".to_string();
            second.processing_ms = 30;
            insert(conn, &second)?;

            let summary = summary_for_document(conn, "doc")?;
            assert_eq!(summary.pages, 2);
            assert!((summary.average_confidence.unwrap() - 90.2).abs() < 1e-9);
            assert_eq!(summary.processing_ms, 42);

            let engines = distribution(conn, "doc", Breakdown::Engine)?;
            assert_eq!(engines.get("markup"), Some(&1));
            assert_eq!(engines.get("tesseract"), Some(&1));
            let languages = distribution(conn, "doc", Breakdown::Language)?;
            assert_eq!(languages.get("zh"), Some(&2));

            let daily = daily_for_document(conn, "doc")?;
            assert_eq!(daily.len(), 1);
            assert_eq!(daily[0].processed_pages, 2);
            assert_eq!(daily[0].date.len(), 10);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_results_are_written_once_per_page() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .with_conn(|conn| {
                insert(conn, &result("r1"))?;
                insert(conn, &result("r2"))
            })
            .unwrap_err();
        assert!(err.is_unique_violation());
    }
}
