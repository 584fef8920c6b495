//! Document store collaborator.
//!
//! The pipeline only needs to know whether a document exists, to fetch the
//! raw content of a page, and to report the outcome back.

use std::path::{Path, PathBuf};

use crate::db::{document_repo, Database};
use crate::error::DocumentError;

/// Broad content family of a page, decides which engine path runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Markup,
    PlainText,
    Image,
    Other,
}

/// Raw content of one page, ready for recognition.
#[derive(Debug, Clone)]
pub struct PageSource {
    pub document_id: String,
    pub page_number: u32,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// File the content was read from, when it came from disk.
    pub origin: Option<PathBuf>,
}

impl PageSource {
    pub fn kind(&self) -> PageKind {
        let essence = self
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/html" | "application/xhtml+xml" | "text/xml" | "application/xml" => {
                PageKind::Markup
            }
            "text/plain" | "text/markdown" => PageKind::PlainText,
            t if t.starts_with("image/") => PageKind::Image,
            _ => PageKind::Other,
        }
    }
}

/// Access to documents owned by the surrounding application.
pub trait DocumentStore: Send + Sync {
    fn exists(&self, document_id: &str) -> Result<bool, DocumentError>;

    /// Loads the raw content of a page.
    fn load_page(&self, document_id: &str, page_number: u32) -> Result<PageSource, DocumentError>;

    /// Stores the recognized text of a page and flags the document processed.
    fn mark_processed(&self, document_id: &str, page_number: u32, text: &str) -> Result<(), DocumentError>;

    /// Flags the document failed with `message`.
    fn mark_failed(&self, document_id: &str, message: &str) -> Result<(), DocumentError>;
}

/// [`DocumentStore`] backed by the `documents` and `document_pages` tables.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    db: Database,
}

impl SqliteDocumentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers a document.
    pub fn insert_document(
        &self,
        document_id: &str,
        title: &str,
        file_path: Option<&Path>,
        page_count: u32,
    ) -> Result<(), DocumentError> {
        let file_path = file_path.map(|p| p.to_string_lossy().into_owned());
        self.db.with_conn(|conn| {
            document_repo::insert(conn, document_id, title, file_path.as_deref(), page_count)
        })?;
        Ok(())
    }

    /// Stores the raw content of a page.
    pub fn insert_page_source(
        &self,
        document_id: &str,
        page_number: u32,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<(), DocumentError> {
        self.db.with_conn(|conn| {
            document_repo::upsert_page_source(conn, document_id, page_number, content_type, bytes)
        })?;
        Ok(())
    }

    pub fn document(&self, document_id: &str) -> Result<Option<document_repo::DocumentRow>, DocumentError> {
        Ok(self
            .db
            .with_conn(|conn| document_repo::find_by_id(conn, document_id))?)
    }

    pub fn page_text(&self, document_id: &str, page_number: u32) -> Result<Option<String>, DocumentError> {
        let page = self
            .db
            .with_conn(|conn| document_repo::find_page(conn, document_id, page_number))?;
        Ok(page.and_then(|p| p.text))
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn exists(&self, document_id: &str) -> Result<bool, DocumentError> {
        Ok(self.db.with_conn(|conn| document_repo::exists(conn, document_id))?)
    }

    fn load_page(&self, document_id: &str, page_number: u32) -> Result<PageSource, DocumentError> {
        let (document, page) = self.db.with_conn(|conn| {
            Ok((
                document_repo::find_by_id(conn, document_id)?,
                document_repo::find_page(conn, document_id, page_number)?,
            ))
        })?;
        let document = document.ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?;

        if let Some(page) = page {
            if let Some(bytes) = page.source {
                return Ok(PageSource {
                    document_id: document_id.to_string(),
                    page_number,
                    content_type: page
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    bytes,
                    origin: None,
                });
            }
        }

        // A single-file document without stored pages is its own first page.
        match document.file_path {
            Some(ref path) if page_number == 1 => {
                let path = PathBuf::from(path);
                let bytes = std::fs::read(&path).map_err(|e| DocumentError::ReadFile {
                    path: path.clone(),
                    source: e,
                })?;
                let content_type = mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string();
                Ok(PageSource {
                    document_id: document_id.to_string(),
                    page_number,
                    content_type,
                    bytes,
                    origin: Some(path),
                })
            }
            _ => Err(DocumentError::PageUnavailable {
                document_id: document_id.to_string(),
                page: page_number,
            }),
        }
    }

    fn mark_processed(&self, document_id: &str, page_number: u32, text: &str) -> Result<(), DocumentError> {
        let found = self.db.with_tx(|conn| {
            if !document_repo::exists(conn, document_id)? {
                return Ok::<_, crate::db::DatabaseError>(false);
            }
            document_repo::save_page_text(conn, document_id, page_number, text)?;
            document_repo::mark_processed(conn, document_id)
        })?;
        if !found {
            return Err(DocumentError::NotFound(document_id.to_string()));
        }
        Ok(())
    }

    fn mark_failed(&self, document_id: &str, message: &str) -> Result<(), DocumentError> {
        let found = self
            .db
            .with_conn(|conn| document_repo::mark_failed(conn, document_id, message))?;
        if !found {
            return Err(DocumentError::NotFound(document_id.to_string()));
        }
        Ok(())
    }
}
