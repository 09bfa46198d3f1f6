use super::{Document, DocumentStore, InsertReport, StoreError, DATETIME_FORMAT};
use crate::config::sanitize_component;
use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, ErrorCode};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite backed document store. One table per collection, documents stored as JSON.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: Arc<PathBuf>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        open_connection(&path)
            .with_context(|| format!("failed to open document store {}", path.display()))?;

        Ok(Self {
            path: Arc::new(path),
        })
    }

    async fn with_connection<T, F>(&self, collection: &str, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.path.clone();
        let table = sanitize_component(collection);
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            ensure_table(&conn, &table)?;
            work(&mut conn, &table)
        })
        .await
        .map_err(|err| StoreError::Transient(format!("store task join error: {err}")))?
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ensure_indexes(&self, collection: &str, fields: &[String]) -> Result<(), StoreError> {
        let fields: Vec<String> = fields.iter().map(|f| sanitize_component(f)).collect();
        self.with_connection(collection, move |conn, table| {
            let mut statements = vec![(
                format!("{table}_datetime"),
                format!("CREATE INDEX IF NOT EXISTS \"{table}_datetime\" ON \"{table}\" (datetime DESC)"),
            )];
            for field in &fields {
                statements.push((
                    format!("{table}_{field}_datetime"),
                    format!(
                        "CREATE INDEX IF NOT EXISTS \"{table}_{field}_datetime\" ON \"{table}\" (json_extract(document, '$.{field}'), datetime)"
                    ),
                ));
            }

            for (name, sql) in statements {
                match conn.execute_batch(&sql) {
                    Ok(()) => debug!(index = %name, "ensured index"),
                    Err(err) => warn!(index = %name, error = %err, "failed to create supplementary index; skipping"),
                }
            }
            Ok(())
        })
        .await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<InsertReport, StoreError> {
        self.with_connection(collection, move |conn, table| {
            let tx = conn.transaction()?;
            let mut report = InsertReport::default();
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO \"{table}\" (contents_hash, datetime, document) VALUES (?1, ?2, ?3)"
                ))?;
                for document in &documents {
                    let body = serde_json::to_string(&document.body)
                        .map_err(|err| StoreError::Fatal(format!("unencodable document: {err}")))?;
                    match stmt.execute(params![document.contents_hash, document.datetime_text(), body]) {
                        Ok(_) => report.inserted += 1,
                        Err(err) if is_unique_violation(&err) => report.duplicates += 1,
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            tx.commit()?;
            Ok(report)
        })
        .await
    }

    async fn prune_outside(
        &self,
        collection: &str,
        oldest: NaiveDateTime,
        newest: NaiveDateTime,
        block_size: usize,
    ) -> Result<usize, StoreError> {
        let oldest = oldest.format(DATETIME_FORMAT).to_string();
        let newest = newest.format(DATETIME_FORMAT).to_string();
        let block_size = block_size.max(1) as i64;
        self.with_connection(collection, move |conn, table| {
            let sql = format!(
                "DELETE FROM \"{table}\" WHERE id IN (SELECT id FROM \"{table}\" WHERE datetime < ?1 OR datetime > ?2 LIMIT ?3)"
            );
            let mut total = 0usize;
            loop {
                let deleted = conn.execute(&sql, params![oldest, newest, block_size])?;
                if deleted == 0 {
                    break;
                }
                total += deleted;
                debug!(table = %table, deleted, total, "pruned block of expired documents");
            }
            Ok(total)
        })
        .await
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.with_connection(collection, |conn, table| {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn recent(&self, collection: &str, limit: usize) -> Result<Vec<Map<String, Value>>, StoreError> {
        let limit = limit as i64;
        self.with_connection(collection, move |conn, table| {
            let mut stmt = conn.prepare(&format!(
                "SELECT document FROM \"{table}\" ORDER BY datetime DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
            let mut documents = Vec::new();
            for row in rows {
                let raw = row?;
                match serde_json::from_str::<Map<String, Value>>(&raw) {
                    Ok(document) => documents.push(document),
                    Err(err) => warn!(table = %table, error = %err, "skipping undecodable stored document"),
                }
            }
            Ok(documents)
        })
        .await
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Transient(err.to_string())
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == ErrorCode::ConstraintViolation
                && (failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn ensure_table(conn: &Connection, table: &str) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS \"{table}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contents_hash TEXT NOT NULL,
            datetime TEXT NOT NULL,
            document TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS \"{table}_contents_hash\" ON \"{table}\" (contents_hash);
        "
    ))
    .map_err(|err| StoreError::Fatal(format!("failed to create collection {table}: {err}")))
}
