//! `SQLite` backend for the VM state store.
//!
//! Each record set lives in its own table keyed by VM name; the record is
//! stored as a JSON document next to its `updated_at` timestamp.
//!
//! # Example
//!
//! ```rust,ignore
//! use hyperlane_control::store::{SqliteStateStore, StateStore};
//!
//! let store = SqliteStateStore::open("./hyperlane.db", Duration::from_secs(1)).await?;
//! store.put(RecordSet::Desired, record).await?;
//! let desired = store.list(RecordSet::Desired, &cancel).await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::task;
use tokio_util::sync::CancellationToken;

use super::{cancellable, StateStore};
use crate::error::{StoreError, StoreResult};
use crate::vm::{RecordSet, VmRecord};

/// SQLite-backed state store.
///
/// A single connection is shared behind a mutex and every statement runs on
/// the blocking thread pool. Writers are serialized by `SQLite` itself, so a
/// write to one name never interleaves with another write to the same name.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open (or create) the store file and make sure both tables exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the file cannot be opened, is not a
    /// database, or the schema cannot be created.
    pub async fn open<P: Into<PathBuf>>(path: P, busy_timeout: Duration) -> StoreResult<Self> {
        let db_path = path.into();
        let open_path = db_path.clone();

        let conn = task::spawn_blocking(move || -> StoreResult<Connection> {
            let conn = Connection::open(&open_path)?;
            conn.busy_timeout(busy_timeout)?;

            // Enable WAL mode; reading the pragma back also fails fast on a corrupt file
            let _mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

            for set in [RecordSet::Desired, RecordSet::Observed] {
                conn.execute_batch(&format!(
                    r"
                    CREATE TABLE IF NOT EXISTS {table} (
                        name TEXT PRIMARY KEY,
                        document TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    )
                    ",
                    table = set.as_str()
                ))?;
            }
            Ok(conn)
        })
        .await??;

        tracing::debug!(path = %db_path.display(), "state store opened");

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` against the shared connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

fn upsert_sql(set: RecordSet) -> String {
    format!(
        r"
        INSERT INTO {table} (name, document, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(name) DO UPDATE SET
            document = excluded.document,
            updated_at = excluded.updated_at
        ",
        table = set.as_str()
    )
}

fn decode(document: &str) -> StoreResult<VmRecord> {
    Ok(serde_json::from_str(document)?)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn put(&self, set: RecordSet, mut record: VmRecord) -> StoreResult<VmRecord> {
        record.validate()?;
        record.updated_at = Utc::now();
        let document = serde_json::to_string(&record)?;
        let name = record.name.clone();
        let updated_at = record.updated_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(&upsert_sql(set), params![name, document, updated_at])?;
            Ok(())
        })
        .await?;

        Ok(record)
    }

    async fn put_if_newer(&self, set: RecordSet, record: VmRecord) -> StoreResult<bool> {
        record.validate()?;
        let document = serde_json::to_string(&record)?;

        self.with_conn(move |conn| {
            // Read and write under one write lock so two reporters cannot both win
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<String> = tx
                .query_row(
                    &format!("SELECT document FROM {} WHERE name = ?1", set.as_str()),
                    params![record.name],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(current) = current {
                if decode(&current)?.updated_at >= record.updated_at {
                    return Ok(false);
                }
            }

            tx.execute(
                &upsert_sql(set),
                params![record.name, document, record.updated_at.to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn get(
        &self,
        set: RecordSet,
        name: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<VmRecord> {
        let name = name.to_string();
        cancellable(
            cancel,
            self.with_conn(move |conn| {
                let document: Option<String> = conn
                    .query_row(
                        &format!("SELECT document FROM {} WHERE name = ?1", set.as_str()),
                        params![name],
                        |row| row.get(0),
                    )
                    .optional()?;
                match document {
                    Some(document) => decode(&document),
                    None => Err(StoreError::not_found(set, name)),
                }
            }),
        )
        .await
    }

    async fn list(
        &self,
        set: RecordSet,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<VmRecord>> {
        cancellable(
            cancel,
            self.with_conn(move |conn| {
                // One statement, one snapshot
                let mut stmt = conn.prepare(&format!("SELECT document FROM {}", set.as_str()))?;
                let documents = stmt.query_map([], |row| row.get::<_, String>(0))?;

                let mut records = Vec::new();
                for document in documents {
                    records.push(decode(&document?)?);
                }
                Ok(records)
            }),
        )
        .await
    }

    async fn delete(&self, set: RecordSet, name: &str) -> StoreResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute(
                &format!("DELETE FROM {} WHERE name = ?1", set.as_str()),
                params![name],
            )?;
            Ok(count > 0)
        })
        .await
    }
}
