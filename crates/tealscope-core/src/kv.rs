//! Flat string-keyed JSON store.
//!
//! Mirrors the browser extension storage area: whole values are read and
//! written per key, and usage is accounted as key bytes plus serialized
//! value bytes. Two backends:
//!
//! - [`MemoryKvStore`]: in-process map with an optional hard quota
//! - [`SqliteKvStore`]: one `kv(key, value)` table, one connection per call
//!   on the blocking pool (WAL, 5s busy timeout)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::error::{Error, Result, StoreError};

/// Persisted key layout
pub mod keys {
    pub const ENABLED: &str = "enabled";
    pub const SESSION_ID: &str = "session_id";
    pub const SESSION_NAME: &str = "session_name";
    pub const LOG_COUNT: &str = "log_count";
    pub const LAST_SESSION_ID: &str = "last_session_id";

    pub const SESSION_LOG_PREFIX: &str = "sessionLog:";
    pub const SESSION_META_PREFIX: &str = "session:";
    pub const SNAPSHOT_PREFIX: &str = "tabSnapshot:";

    /// Bucket id used when logs arrive with no active session
    pub const NO_SESSION: &str = "no-session";

    #[must_use]
    pub fn session_log(session_id: &str) -> String {
        format!("{SESSION_LOG_PREFIX}{session_id}")
    }

    #[must_use]
    pub fn session_meta(session_id: &str) -> String {
        format!("{SESSION_META_PREFIX}{session_id}")
    }

    #[must_use]
    pub fn snapshot(kind: &str, tab_key: &str) -> String {
        format!("{SNAPSHOT_PREFIX}{kind}:{tab_key}")
    }

    /// Session id of a `sessionLog:<id>` key
    #[must_use]
    pub fn session_id_of_log_key(key: &str) -> Option<&str> {
        key.strip_prefix(SESSION_LOG_PREFIX)
    }
}

/// Async whole-value key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write several keys atomically.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()>;

    async fn remove(&self, keys: &[String]) -> Result<()>;

    /// All keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Total bytes used: key bytes plus serialized value bytes.
    async fn bytes_in_use(&self) -> Result<u64>;

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_many(vec![(key.to_string(), value)]).await
    }
}

fn entry_bytes(key: &str, serialized: &str) -> u64 {
    (key.len() + serialized.len()) as u64
}

fn serialize_all(entries: Vec<(String, Value)>) -> Result<Vec<(String, String)>> {
    entries
        .into_iter()
        .map(|(k, v)| Ok((k, serde_json::to_string(&v)?)))
        .collect()
}

fn parse_stored(key: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| {
        Error::Store(StoreError::Corrupt {
            key: key.to_string(),
            details: e.to_string(),
        })
    })
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory store with optional hard quota
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: Mutex<BTreeMap<String, String>>,
    hard_quota: Option<u64>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes that would push usage past `bytes` fail with `QuotaExceeded`.
    #[must_use]
    pub fn with_hard_quota(bytes: u64) -> Self {
        Self {
            data: Mutex::default(),
            hard_quota: Some(bytes),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.data
            .lock()
            .map_err(|_| Error::Runtime("memory store lock poisoned".into()))
    }
}

fn usage_of(map: &BTreeMap<String, String>) -> u64 {
    map.iter().map(|(k, v)| entry_bytes(k, v)).sum()
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let data = self.lock()?;
        data.get(key).map(|raw| parse_stored(key, raw)).transpose()
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let serialized = serialize_all(entries)?;
        let mut data = self.lock()?;
        if let Some(quota) = self.hard_quota {
            let mut projected = data.clone();
            for (k, v) in &serialized {
                projected.insert(k.clone(), v.clone());
            }
            let needed = usage_of(&projected);
            if needed > quota {
                return Err(StoreError::QuotaExceeded {
                    needed,
                    available: quota,
                }
                .into());
            }
        }
        data.extend(serialized);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let mut data = self.lock()?;
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.lock()?;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn bytes_in_use(&self) -> Result<u64> {
        Ok(usage_of(&*self.lock()?))
    }
}

// =============================================================================
// SQLite backend
// =============================================================================

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);";

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    db_path: Arc<PathBuf>,
}

fn open_conn(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Store(StoreError::Database(e.to_string()))
}

impl SqliteKvStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_conn(&path).map_err(db_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        Ok(Self {
            db_path: Arc::new(path),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let mut conn = open_conn(&db_path).map_err(db_err)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Runtime(format!("task join: {e}")))?
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)?;
            raw.map(|raw| parse_stored(&key, &raw)).transpose()
        })
        .await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let serialized = serialize_all(entries)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    )
                    .map_err(db_err)?;
                for (k, v) in &serialized {
                    stmt.execute(params![k, v]).map_err(db_err)?;
                }
            }
            tx.commit().map_err(db_err)
        })
        .await
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for key in &keys {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
                    .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            // substr comparison avoids LIKE wildcard escaping
            let mut stmt = conn
                .prepare(
                    "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
        .await
    }

    async fn bytes_in_use(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let total: i64 = conn
                .query_row(
                    "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0) FROM kv",
                    [],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(total.max(0) as u64)
        })
        .await
    }
}
