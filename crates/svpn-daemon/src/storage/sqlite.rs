//! `SQLite`-backed [`DocumentStore`].
//!
//! Documents live in a single `documents` table. Every write bumps a
//! per-row version; transactions read `(body, version)`, run the caller's
//! body and commit with `UPDATE ... WHERE version = ?`, retrying on a lost
//! race. Timestamps come from `SQLite` itself so every client sharing the
//! database agrees on "now".

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use svpn_core::document::{DocPath, Document, DocumentStore, StoreError, TxWrite, apply_patch};
use svpn_core::time::Timestamp;

use super::db::{Database, DatabaseError};

/// Current time in milliseconds, evaluated by `SQLite`.
const SERVER_NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)";

pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A stored row: decoded document plus its version.
#[derive(Debug, Clone)]
pub struct VersionedDocument {
    pub body: Document,
    pub version: i64,
}

/// Document store over a `SQLite` database.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
    writer: String,
    op_timeout: Duration,
    max_attempts: u32,
}

impl SqliteStore {
    /// Wrap an opened database. `writer` is the identity recorded on writes.
    pub fn new(db: Database, writer: impl Into<String>) -> Self {
        Self {
            db,
            writer: writer.into(),
            op_timeout: DEFAULT_OP_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the per-call timeout and transaction attempt limit.
    #[must_use]
    pub fn with_limits(mut self, op_timeout: Duration, max_attempts: u32) -> Self {
        self.op_timeout = op_timeout;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Open (or create) a store at `path`.
    pub async fn open(path: &Path, writer: impl Into<String>) -> Result<Self, DatabaseError> {
        Ok(Self::new(Database::open(path).await?, writer))
    }

    /// Open an in-memory store (for testing).
    pub async fn open_in_memory(writer: impl Into<String>) -> Result<Self, DatabaseError> {
        Ok(Self::new(Database::open_in_memory().await?, writer))
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    async fn timed<T, F>(&self, op: &str, path: &DocPath, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Transport(format!("{op} {path}: {e}"))),
            Err(_) => Err(StoreError::Timeout(format!(
                "{op} {path} exceeded {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }

    /// Read a document together with its version.
    pub async fn get_versioned(
        &self,
        path: &DocPath,
    ) -> Result<Option<VersionedDocument>, StoreError> {
        let key = path.to_string();
        let row: Option<(String, i64)> = self
            .timed(
                "get",
                path,
                sqlx::query_as("SELECT body, version FROM documents WHERE path = ?")
                    .bind(&key)
                    .fetch_optional(self.db.pool()),
            )
            .await?;

        row.map(|(body, version)| {
            decode(path, &body).map(|body| VersionedDocument { body, version })
        })
        .transpose()
    }

    /// Write `body` only if the stored version still equals `expected`.
    ///
    /// `expected = None` means the document must not exist yet. Returns
    /// `false` when another writer got there first.
    pub async fn compare_and_swap(
        &self,
        path: &DocPath,
        body: &Document,
        expected: Option<i64>,
    ) -> Result<bool, StoreError> {
        let key = path.to_string();
        let encoded = serde_json::to_string(body).map_err(|e| StoreError::Decode {
            path: key.clone(),
            reason: e.to_string(),
        })?;

        let result = match expected {
            Some(version) => {
                let sql = format!(
                    "UPDATE documents SET body = ?, version = version + 1, \
                     updated_at = {SERVER_NOW_MS}, updated_by = ? \
                     WHERE path = ? AND version = ?"
                );
                self.timed(
                    "update",
                    path,
                    sqlx::query(&sql)
                        .bind(&encoded)
                        .bind(&self.writer)
                        .bind(&key)
                        .bind(version)
                        .execute(self.db.pool()),
                )
                .await?
            }
            None => {
                let sql = format!(
                    "INSERT INTO documents (path, body, version, updated_at, updated_by) \
                     VALUES (?, ?, 1, {SERVER_NOW_MS}, ?) \
                     ON CONFLICT(path) DO NOTHING"
                );
                self.timed(
                    "insert",
                    path,
                    sqlx::query(&sql)
                        .bind(&key)
                        .bind(&encoded)
                        .bind(&self.writer)
                        .execute(self.db.pool()),
                )
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    /// Identity recorded as the last writer of a document.
    pub async fn last_writer(&self, path: &DocPath) -> Result<Option<String>, StoreError> {
        let key = path.to_string();
        self.timed(
            "last_writer",
            path,
            sqlx::query_scalar("SELECT updated_by FROM documents WHERE path = ?")
                .bind(&key)
                .fetch_optional(self.db.pool()),
        )
        .await
    }
}

fn decode(path: &DocPath, body: &str) -> Result<Document, StoreError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(doc)) => Ok(doc),
        Ok(other) => Err(StoreError::Decode {
            path: path.to_string(),
            reason: format!("expected a JSON object, found {other}"),
        }),
        Err(e) => Err(StoreError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        Ok(self.get_versioned(path).await?.map(|d| d.body))
    }

    async fn patch(
        &self,
        path: &DocPath,
        fields: Document,
        mask: Option<&[&str]>,
    ) -> Result<(), StoreError> {
        self.transact(path, |current| {
            let mut doc = current.cloned().unwrap_or_default();
            apply_patch(&mut doc, &fields, mask);
            TxWrite::Commit(doc, ())
        })
        .await
    }

    async fn transact<F, R>(&self, path: &DocPath, mut f: F) -> Result<R, StoreError>
    where
        F: FnMut(Option<&Document>) -> TxWrite<R> + Send,
        R: Send,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.get_versioned(path).await?;
            let expected = current.as_ref().map(|d| d.version);

            match f(current.as_ref().map(|d| &d.body)) {
                TxWrite::Abort(result) => return Ok(result),
                TxWrite::Commit(doc, result) => {
                    if self.compare_and_swap(path, &doc, expected).await? {
                        return Ok(result);
                    }
                    debug!(path = %path, attempt, "Concurrent write detected, retrying transaction");
                }
            }
        }

        warn!(path = %path, attempts = self.max_attempts, "Transaction gave up after repeated conflicts");
        Err(StoreError::Conflict {
            path: path.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn server_time(&self) -> Result<Timestamp, StoreError> {
        let sql = format!("SELECT {SERVER_NOW_MS}");
        let millis: i64 = match tokio::time::timeout(
            self.op_timeout,
            sqlx::query_scalar(&sql).fetch_one(self.db.pool()),
        )
        .await
        {
            Ok(Ok(millis)) => millis,
            Ok(Err(e)) => return Err(StoreError::Transport(format!("server_time: {e}"))),
            Err(_) => return Err(StoreError::Timeout("server_time".into())),
        };
        Ok(Timestamp::from_millis(millis))
    }
}
