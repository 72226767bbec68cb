use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;

use super::{Record, Store};
use crate::errors::StoreError;

/// SQLite-backed store.
///
/// Wraps the connection behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )
        .context("Failed to create records table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure with the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.into())
}

fn encode(key: &str, value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })
}

fn decode(key: &str, version: i64, raw: &str) -> Result<Record, StoreError> {
    let value = serde_json::from_str(raw).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })?;
    Ok(Record {
        version: version as u64,
        value,
    })
}

fn current_version(conn: &Connection, key: &str) -> Result<Option<u64>, StoreError> {
    conn.query_row(
        "SELECT version FROM records WHERE key = ?1",
        params![key],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|v| v as u64))
    .map_err(backend)
}

fn upsert(conn: &Connection, key: &str, version: u64, raw: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO records (key, version, value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            version = excluded.version,
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, version as i64, raw],
    )
    .map_err(backend)?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let key = key.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT version, value FROM records WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .map_err(backend)?;
            row.map(|(version, raw)| decode(&key, version, &raw))
                .transpose()
        })
        .await
    }

    async fn put(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        let key = key.to_string();
        let raw = encode(&key, &value)?;
        self.call(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(backend)?;
            let version = current_version(&tx, &key)?.map(|v| v + 1).unwrap_or(1);
            upsert(&tx, &key, version, &raw)?;
            tx.commit().map_err(backend)?;
            Ok(version)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<u64, StoreError> {
        let key = key.to_string();
        let raw = encode(&key, &value)?;
        self.call(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(backend)?;
            let actual = current_version(&tx, &key)?;
            if actual != expected {
                return Err(StoreError::VersionConflict {
                    key,
                    expected,
                    actual,
                });
            }
            let version = actual.map(|v| v + 1).unwrap_or(1);
            upsert(&tx, &key, version, &raw)?;
            tx.commit().map_err(backend)?;
            Ok(version)
        })
        .await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Record)>, StoreError> {
        let prefix = prefix.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, version, value FROM records
                     WHERE substr(key, 1, length(?1)) = ?1
                     ORDER BY key",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![prefix], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(backend)?;

            let mut out = Vec::new();
            for row in rows {
                let (key, version, raw) = row.map_err(backend)?;
                let record = decode(&key, version, &raw)?;
                out.push((key, record));
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get("missing").await.unwrap().is_none());

        assert_eq!(store.put("a", json!({"x": 1})).await.unwrap(), 1);
        assert_eq!(store.put("a", json!({"x": 2})).await.unwrap(), 2);
        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.value, json!({"x": 2}));
    }

    #[tokio::test]
    async fn test_compare_and_swap_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.compare_and_swap("k", None, json!(1)).await.unwrap();

        let err = store.compare_and_swap("k", None, json!(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { actual: Some(1), .. }));

        assert_eq!(store.compare_and_swap("k", Some(1), json!(2)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("checkpoint/s1/000002", json!(2)).await.unwrap();
        store.put("checkpoint/s1/000001", json!(1)).await.unwrap();
        store.put("checkpoint/s10/000001", json!(9)).await.unwrap();

        let listed = store.list_prefix("checkpoint/s1/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "checkpoint/s1/000001");
        assert_eq!(listed[1].1.value, json!(2));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dossier.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("session/abc", json!({"status": "RUNNING"})).await.unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        let record = reopened.get("session/abc").await.unwrap().unwrap();
        assert_eq!(record.value["status"], "RUNNING");
    }
}
