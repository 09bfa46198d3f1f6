//! Document store abstraction with idempotent bulk insertion.
//!
//! Every document carries the record fingerprint as `contents_hash`, which the store
//! keeps unique. Inserting a document whose fingerprint is already present is not an
//! error; it is counted as a duplicate and the rest of the batch proceeds.

use crate::record::ParsedRecord;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Worth retrying: the store is busy, locked or briefly unreachable.
    #[error("store temporarily unavailable: {0}")]
    Transient(String),
    /// Retrying cannot help, e.g. the unique fingerprint index cannot be created.
    #[error("store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Shape of a record once it reaches the store.
///
/// The six date parts collapse into a single `datetime`; everything else from the
/// envelope is kept as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub contents_hash: String,
    pub datetime: NaiveDateTime,
    pub body: Map<String, Value>,
}

impl Document {
    pub fn from_record(record: &ParsedRecord) -> Option<Self> {
        let datetime = record.datetime()?;
        let mut body = Map::new();
        for (key, value) in &record.metadata {
            body.insert(key.clone(), Value::String(value.clone()));
        }
        body.insert("contents".to_string(), Value::String(record.contents.clone()));
        body.insert(
            "contents_hash".to_string(),
            Value::String(record.fingerprint.clone()),
        );
        body.insert(
            "keywords".to_string(),
            Value::Array(
                record
                    .keywords
                    .iter()
                    .map(|keyword| Value::String(keyword.clone()))
                    .collect(),
            ),
        );
        body.insert(
            "datetime".to_string(),
            Value::String(datetime.format(DATETIME_FORMAT).to_string()),
        );

        Some(Self {
            contents_hash: record.fingerprint.clone(),
            datetime,
            body,
        })
    }

    pub fn datetime_text(&self) -> String {
        self.datetime.format(DATETIME_FORMAT).to_string()
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the collection with its unique fingerprint index plus the supplementary
    /// `datetime` and `(field, datetime)` indexes.
    ///
    /// Failing to guarantee fingerprint uniqueness is fatal. Supplementary index
    /// failures are logged and skipped.
    async fn ensure_indexes(&self, collection: &str, fields: &[String]) -> Result<(), StoreError>;

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertReport, StoreError>;

    /// Delete documents dated outside `[oldest, newest]`, `block_size` rows at a time.
    async fn prune_outside(
        &self,
        collection: &str,
        oldest: NaiveDateTime,
        newest: NaiveDateTime,
        block_size: usize,
    ) -> Result<usize, StoreError>;

    async fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// Newest documents first.
    async fn recent(&self, collection: &str, limit: usize) -> Result<Vec<Map<String, Value>>, StoreError>;
}
