use crate::backend::StorageType;
use crate::error::{Diagnostic, StoreError};
use crate::record::{LogRecord, NewRecord};
use async_trait::async_trait;
use serde::Serialize;

/// Uniform storage contract implemented by every backend.
///
/// Implementations own their physical representation exclusively. Callers
/// hold an `Arc<dyn LogStore>` chosen once at startup and never branch on
/// the concrete backend.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Durably persist one record.
    ///
    /// **Returns**
    /// - `Ok(Some(id))` when the backend assigns surrogate ids.
    /// - `Ok(None)` for order-addressed backends.
    /// - `Err(..)` if nothing was persisted. A failed insert never leaves a
    ///   partial record visible to readers.
    ///
    /// The record is visible to any `query` issued after this returns.
    async fn insert(&self, record: &NewRecord) -> Result<Option<i64>, StoreError>;

    /// Return one page of matching records, newest first, together with
    /// the total number of matches.
    ///
    /// A page past the end yields no records and the correct total; it is
    /// not an error.
    async fn query(&self, request: &PageRequest) -> Result<QueryResult, StoreError>;

    /// Remove every record. Either the store is empty afterwards or an
    /// error is returned and the prior contents are retained.
    async fn clear(&self) -> Result<(), StoreError>;

    fn kind(&self) -> StorageType;
}

/// A 1-indexed page of a substring search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
    page_size: u32,
    search: String,
}

impl PageRequest {
    /// `page` and `page_size` are clamped to at least 1. The search term is
    /// trimmed; an empty term matches every record.
    pub fn new(page: u32, page_size: u32, search: impl AsRef<str>) -> Self {
        PageRequest {
            page: page.max(1),
            page_size: page_size.max(1),
            search: search.as_ref().trim().to_string(),
        }
    }

    pub fn all(page: u32, page_size: u32) -> Self {
        PageRequest::new(page, page_size, "")
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn search(&self) -> Option<&str> {
        if self.search.is_empty() {
            None
        } else {
            Some(&self.search)
        }
    }

    /// Number of matching records that precede this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    /// ASCII case-insensitive substring test used by scanning backends.
    /// Mirrors SQLite's `LIKE` folding so both backends agree.
    pub fn matches(&self, message: &str, metadata_text: &str) -> bool {
        match self.search() {
            None => true,
            Some(term) => {
                let needle = term.to_ascii_lowercase();
                message.to_ascii_lowercase().contains(&needle)
                    || metadata_text.to_ascii_lowercase().contains(&needle)
            }
        }
    }
}

/// Uniform answer to a query: a page of records, the number of records
/// matching overall, and the failure reason when the query could not run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub records: Vec<LogRecord>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Diagnostic>,
}

impl QueryResult {
    pub fn new(records: Vec<LogRecord>, total: u64) -> Self {
        QueryResult { records, total, error: None }
    }

    pub fn failed(diagnostic: Diagnostic) -> Self {
        QueryResult {
            records: Vec::new(),
            total: 0,
            error: Some(diagnostic),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn total_pages(&self, page_size: u32) -> u64 {
        let size = u64::from(page_size.max(1));
        (self.total + size - 1) / size
    }
}
