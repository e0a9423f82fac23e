//! SQLite backend: single-writer embedded engine.
//!
//! Work runs on the blocking pool against an r2d2 pool of rusqlite
//! connections. Writes go through [`SqliteStore::write`], which retries
//! busy/locked errors with the configured [`RetryPolicy`]; multi-statement
//! writes open `BEGIN IMMEDIATE` transactions so the write lock is taken up
//! front instead of on upgrade.

pub mod schema;

mod entities;
mod jobs;
mod objects;
mod repos;
mod symbols;
mod xref;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config::BackendKind;
use crate::error::{StoreError, StoreResult};
use crate::retry::{self, RetryPolicy};
use crate::store::Store;

use schema::init_schema;

/// Type alias for connection pool
pub type ConnectionPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Clone, Copy)]
pub struct SqliteOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct ConnectionCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(())
    }
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
    db_path: PathBuf,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Create or open a database and bring its schema up to date.
    pub fn open(db_path: impl AsRef<Path>, options: SqliteOptions) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        info!("Opening SQLite store at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(options.max_connections)
            .connection_timeout(Duration::from_secs(30))
            .connection_customizer(Box::new(ConnectionCustomizer {
                busy_timeout: options.busy_timeout,
            }))
            .build(manager)?;

        let store = Self {
            pool,
            db_path,
            retry: options.retry,
        };
        {
            let conn = store.get_conn()?;
            init_schema(&conn)?;
        }
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run a read on the blocking pool.
    async fn read<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run a write on the blocking pool, retrying busy/locked errors.
    async fn write<T, F>(&self, label: &'static str, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        self.write_with(label, retry::busy, op).await
    }

    async fn write_with<T, F>(
        &self,
        label: &'static str,
        retryable: fn(&StoreError) -> bool,
        op: F,
    ) -> StoreResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let policy = self.retry;
        tokio::task::spawn_blocking(move || {
            policy.run_blocking(label, retryable, || {
                let mut conn = pool.get()?;
                op(&mut *conn)
            })
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn migrate(&self) -> StoreResult<()> {
        self.write("migrate", |conn| Ok(init_schema(conn)?)).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.read(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

/// Timestamps are stored as Unix milliseconds so they sort numerically.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Wrap a domain decode failure so it can leave a row-mapping closure.
pub(crate) fn decode_failure(column: usize, err: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(err),
    )
}
