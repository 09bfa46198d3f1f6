use super::{Document, DocumentStore, InsertReport, StoreError};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Collection {
    hashes: HashSet<String>,
    documents: Vec<Document>,
}

/// In-process store with the same duplicate semantics as [`super::SqliteStore`].
///
/// `fail_next` makes the following calls return a transient error, which is how the
/// retry and re-queue paths are exercised.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    indexes: Mutex<HashMap<String, Vec<String>>>,
    failures_remaining: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: usize) {
        self.failures_remaining.store(calls, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn indexes(&self, collection: &str) -> Vec<String> {
        self.indexes
            .lock()
            .map(|indexes| indexes.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn take_failure(&self) -> Result<(), StoreError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Transient("simulated outage".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Collection>>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Fatal("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_indexes(&self, collection: &str, fields: &[String]) -> Result<(), StoreError> {
        let mut names = vec!["contents_hash".to_string(), "datetime".to_string()];
        names.extend(fields.iter().map(|field| format!("{field}_datetime")));
        self.indexes
            .lock()
            .map_err(|_| StoreError::Fatal("memory store lock poisoned".to_string()))?
            .insert(collection.to_string(), names);
        Ok(())
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertReport, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;

        let mut collections = self.lock()?;
        let target = collections.entry(collection.to_string()).or_default();
        let mut report = InsertReport::default();
        for document in documents {
            if target.hashes.insert(document.contents_hash.clone()) {
                target.documents.push(document);
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }
        Ok(report)
    }

    async fn prune_outside(
        &self,
        collection: &str,
        oldest: NaiveDateTime,
        newest: NaiveDateTime,
        _block_size: usize,
    ) -> Result<usize, StoreError> {
        let mut collections = self.lock()?;
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = target.documents.len();
        target
            .documents
            .retain(|doc| doc.datetime >= oldest && doc.datetime <= newest);
        let kept: HashSet<String> = target
            .documents
            .iter()
            .map(|doc| doc.contents_hash.clone())
            .collect();
        target.hashes = kept;
        Ok(before - target.documents.len())
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self
            .lock()?
            .get(collection)
            .map(|target| target.documents.len())
            .unwrap_or(0))
    }

    async fn recent(&self, collection: &str, limit: usize) -> Result<Vec<Map<String, Value>>, StoreError> {
        let collections = self.lock()?;
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut documents: Vec<&Document> = target.documents.iter().collect();
        documents.sort_by(|a, b| b.datetime.cmp(&a.datetime));
        Ok(documents
            .into_iter()
            .take(limit)
            .map(|doc| doc.body.clone())
            .collect())
    }
}
