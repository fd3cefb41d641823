//! Durable cache backed by libSQL (Turso).
//!
//! Uses the `libsql` crate (async client) because it supports both:
//! - Remote Turso/libSQL databases via `TURSO_DATABASE_URL` / `LIBSQL_DATABASE_URL` (+ token).
//! - Local file fallback in the data directory (`cache.db`).

use std::future::Future;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libsql::{Builder, Database, params};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::DurableCache;
use crate::plugins::history::StoreError;

const CACHE_DB_BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_POOLED_CONNECTIONS: usize = 8;
const MAX_REMOTE_CONNECTIONS: usize = 8;
const MAX_LOCAL_CONNECTIONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbMode {
    Remote,
    Local,
}

#[derive(Clone)]
pub struct SqliteCache {
    inner: Arc<SqliteCacheInner>,
}

struct SqliteCacheInner {
    db: Database,
    db_mode: DbMode,
    /// Serialize *writes* for local file databases to reduce SQLITE_BUSY contention.
    /// For remote Turso/libSQL, this is disabled to avoid serializing network latency.
    write_gate: Option<Arc<Semaphore>>,
    /// Bound the number of concurrent connections (important for remote and local).
    conn_gate: Arc<Semaphore>,
    conn_pool: Mutex<Vec<libsql::Connection>>,
}

/// A pooled libSQL connection (returned to the pool on drop).
struct PooledConnection {
    conn: Option<libsql::Connection>,
    cache: SqliteCache,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("PooledConnection must hold a connection")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let Ok(mut pool) = self.cache.inner.conn_pool.lock() else {
            return;
        };
        if pool.len() >= MAX_POOLED_CONNECTIONS {
            return;
        }
        pool.push(conn);
    }
}

async fn retry_db_locked<T, Fut, F>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = Duration::from_millis(25);
    for attempt in 0..5 {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if attempt >= 4 || !matches!(err, StoreError::Locked { .. }) {
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(400));
            }
        }
    }
    Err(StoreError::locked("Cache DB retry exhausted"))
}

impl SqliteCache {
    /// Open under the application data directory, honoring the remote env
    /// overrides.
    pub async fn open_default() -> Result<Self, StoreError> {
        let dir = crate::services::paths::data_dir().map_err(StoreError::internal)?;
        Self::from_env(&dir.join("cache.db")).await
    }

    /// Open against the configured remote Turso/libSQL database when the env
    /// credentials are present, otherwise fall back to a local file.
    pub async fn from_env(local_path: &Path) -> Result<Self, StoreError> {
        let url = std::env::var("TURSO_DATABASE_URL")
            .or_else(|_| std::env::var("LIBSQL_DATABASE_URL"))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let token = std::env::var("TURSO_AUTH_TOKEN")
            .or_else(|_| std::env::var("LIBSQL_AUTH_TOKEN"))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        if let (Some(url), Some(token)) = (url, token) {
            log::info!("Cache DB: using remote Turso/libSQL");
            let db = Builder::new_remote(url, token).build().await?;
            return Self::init(db, DbMode::Remote).await;
        }

        let path_str = local_path.to_string_lossy().to_string();
        log::warn!("Cache DB: TURSO env missing, falling back to local file {path_str}");
        Self::open_local(&path_str).await
    }

    pub async fn open_local(path: &str) -> Result<Self, StoreError> {
        let db = Builder::new_local(path).build().await?;
        Self::init(db, DbMode::Local).await
    }

    async fn init(db: Database, db_mode: DbMode) -> Result<Self, StoreError> {
        let (conn_limit, write_gate) = match db_mode {
            DbMode::Remote => (MAX_REMOTE_CONNECTIONS, None),
            DbMode::Local => (MAX_LOCAL_CONNECTIONS, Some(Arc::new(Semaphore::new(1)))),
        };
        let cache = Self {
            inner: Arc::new(SqliteCacheInner {
                db,
                db_mode,
                write_gate,
                conn_gate: Arc::new(Semaphore::new(conn_limit)),
                conn_pool: Mutex::new(Vec::new()),
            }),
        };
        cache.migrate().await?;
        Ok(cache)
    }

    async fn connect(&self) -> Result<PooledConnection, StoreError> {
        let permit = self
            .inner
            .conn_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::internal("Cache DB connection gate closed"))?;

        if let Ok(mut pool) = self.inner.conn_pool.lock() {
            if let Some(conn) = pool.pop() {
                return Ok(PooledConnection {
                    conn: Some(conn),
                    cache: self.clone(),
                    _permit: permit,
                });
            }
        }

        let conn = self.inner.db.connect()?;

        // Best-effort per-connection pragmas. Local mode reduces SQLITE_BUSY;
        // remote mode may ignore pragmas, which is fine.
        if self.inner.db_mode == DbMode::Local {
            let _ = conn.busy_timeout(CACHE_DB_BUSY_TIMEOUT);
            let _ = conn.query("PRAGMA journal_mode = WAL;", ()).await;
            let _ = conn.query("PRAGMA synchronous = NORMAL;", ()).await;
        }

        Ok(PooledConnection {
            conn: Some(conn),
            cache: self.clone(),
            _permit: permit,
        })
    }

    async fn write_permit(&self) -> Result<Option<OwnedSemaphorePermit>, StoreError> {
        let Some(gate) = self.inner.write_gate.as_ref() else {
            return Ok(None);
        };
        gate.clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| StoreError::internal("Cache DB write gate closed"))
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.connect().await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (\n  key TEXT PRIMARY KEY NOT NULL,\n  value TEXT NOT NULL\n);",
            (),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DurableCache for SqliteCache {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("SELECT value FROM kv WHERE key = ?1 LIMIT 1;", params![key])
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let value: String = row.get(0)?;
        Ok(Some(value))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        retry_db_locked(|| async {
            let _write = self.write_permit().await?;
            let conn = self.connect().await?;
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)\nON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                params![key, value],
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        retry_db_locked(|| async {
            let _write = self.write_permit().await?;
            let conn = self.connect().await?;
            conn.execute("DELETE FROM kv WHERE key = ?1;", params![key])
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.connect().await?;
        // ESCAPE so user/conversation ids containing LIKE wildcards stay literal.
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let pattern = format!("{escaped}%");
        let mut rows = conn
            .query(
                "SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\';",
                params![pattern],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let key: String = row.get(0)?;
            out.push(key);
        }
        Ok(out)
    }
}
