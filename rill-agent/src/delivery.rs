//! Envelope intake, batching and idempotent insertion into the document store.

use crate::accumulator::{Accumulator, Admission, Batch};
use crate::envelope::Envelope;
use crate::metrics::{
    ACCUMULATOR_DEPTH, DUPLICATES_TOTAL, ENVELOPES_DROPPED_TOTAL, FLUSHES_TOTAL, FLUSH_DURATION,
    RECORDS_STORED_TOTAL,
};
use crate::parsers::{line_preview, LINE_PREVIEW_LIMIT};
use crate::record::ParsedRecord;
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::{Document, DocumentStore, InsertReport, StoreError};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct Delivery {
    accumulator: Accumulator,
    store: Arc<dyn DocumentStore>,
    collection: String,
    retry: RetryPolicy,
    cancel_token: CancellationToken,
}

impl Delivery {
    /// Prepare the collection and its indexes. A store that cannot enforce fingerprint
    /// uniqueness is a startup error.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        collection: String,
        indexed_fields: &[String],
        accumulator: Accumulator,
        retry: RetryPolicy,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        store
            .ensure_indexes(&collection, indexed_fields)
            .await
            .with_context(|| format!("failed to prepare collection {collection}"))?;

        debug!(collection = %collection, fields = ?indexed_fields, "collection ready");

        Ok(Self {
            accumulator,
            store,
            collection,
            retry,
            cancel_token,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn pending(&self) -> usize {
        self.accumulator.len()
    }

    /// Decode and validate one envelope; `true` when it was queued.
    /// Malformed envelopes are logged and dropped.
    pub fn ingest_payload(&mut self, payload: &str, now: Instant) -> bool {
        match Envelope::decode(payload).and_then(Envelope::into_record) {
            Ok(record) => self.ingest_record(record, now) == Admission::Queued,
            Err(err) => {
                ENVELOPES_DROPPED_TOTAL.with_label_values(&["invalid"]).inc();
                debug!(
                    error = %err,
                    payload = %line_preview(payload, LINE_PREVIEW_LIMIT),
                    "dropping invalid envelope"
                );
                false
            }
        }
    }

    pub fn ingest_record(&mut self, record: ParsedRecord, now: Instant) -> Admission {
        let fingerprint = record.fingerprint.clone();
        let admission = self
            .accumulator
            .ingest(record, now, Utc::now().naive_utc());
        if admission == Admission::Queued {
            ACCUMULATOR_DEPTH.set(self.accumulator.len() as i64);
        } else {
            ENVELOPES_DROPPED_TOTAL
                .with_label_values(&[admission.as_str()])
                .inc();
            debug!(
                contents_hash = %fingerprint,
                reason = admission.as_str(),
                "dropping record that was not admitted"
            );
        }
        admission
    }

    /// Flush every batch that is due. A batch the store refuses is kept for later.
    pub async fn flush_due(&mut self, now: Instant) -> usize {
        let mut flushed = 0;
        while let Some(batch) = self.accumulator.take_due(now) {
            match self.insert(&batch).await {
                Ok(report) => {
                    flushed += batch.len();
                    FLUSHES_TOTAL
                        .with_label_values(&[batch.trigger.as_str(), "ok"])
                        .inc();
                    RECORDS_STORED_TOTAL.inc_by(report.inserted as u64);
                    DUPLICATES_TOTAL.inc_by(report.duplicates as u64);
                    debug!(
                        collection = %self.collection,
                        trigger = batch.trigger.as_str(),
                        inserted = report.inserted,
                        duplicates = report.duplicates,
                        remaining = self.accumulator.len(),
                        "flushed batch"
                    );
                    drop(batch);
                    self.accumulator.release_memory();
                }
                Err(err) => {
                    FLUSHES_TOTAL
                        .with_label_values(&[batch.trigger.as_str(), "error"])
                        .inc();
                    error!(
                        collection = %self.collection,
                        batch_len = batch.len(),
                        error = %err,
                        "store rejected batch after retries; keeping it for a later attempt"
                    );
                    self.accumulator.requeue(batch, now);
                    break;
                }
            }
        }
        ACCUMULATOR_DEPTH.set(self.accumulator.len() as i64);
        flushed
    }

    async fn insert(&self, batch: &Batch) -> Result<InsertReport, StoreError> {
        let documents: Vec<Document> = batch
            .records()
            .filter_map(|record| {
                let document = Document::from_record(record);
                if document.is_none() {
                    warn!(contents_hash = %record.fingerprint, "record has no valid datetime; skipping");
                }
                document
            })
            .collect();
        if documents.is_empty() {
            return Ok(InsertReport::default());
        }

        let _timer = FLUSH_DURATION.start_timer();
        retry_transient(self.retry, "insert_many", &self.cancel_token, || {
            self.store.insert_many(&self.collection, documents.clone())
        })
        .await
    }

    /// Drop whatever is still queued on shutdown.
    pub fn abandon(&mut self) {
        let lost = self.accumulator.abandon();
        ACCUMULATOR_DEPTH.set(0);
        if lost > 0 {
            warn!(collection = %self.collection, lost, "discarding unflushed records on shutdown");
        }
    }

    /// Delete stored documents that fell out of the acceptance window.
    pub async fn prune(&self, block_size: usize) -> Result<usize> {
        let (oldest, newest) = self.accumulator.window().bounds(Utc::now().naive_utc());
        let removed = self
            .store
            .prune_outside(&self.collection, oldest, newest, block_size)
            .await
            .with_context(|| format!("failed to prune collection {}", self.collection))?;
        Ok(removed)
    }
}
