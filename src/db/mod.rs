//! Database module for the offline queue
//!
//! Provides the pooled SQLite substrate that queue storage, the dead-letter
//! store and persisted settings live on.

use rusqlite::{params, Connection, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

const POOL_MAX_SIZE: u32 = 8;
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a file-backed database pool
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::Io(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(&format!(
                "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
                BUSY_TIMEOUT_MS
            ))
        });

        let pool = Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .min_idle(Some(2))
            .connection_timeout(Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        Self::initialize_schema(&conn)?;
        drop(conn);

        log::info!("Opened queue database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for tests and ephemeral hosts)
    ///
    /// Every pooled SQLite `:memory:` connection is its own database, so the
    /// pool is capped at a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA temp_store = MEMORY;")?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Platform data directory location for the queue database
    pub fn default_path() -> DbResult<PathBuf> {
        let dirs = directories::ProjectDirs::from("com", "commlog", "commlog-sync")
            .ok_or_else(|| DbError::Io("Failed to resolve app data directory".to_string()))?;
        Ok(dirs.data_dir().join("offline_queue.db"))
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Self::run_migrations(conn)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for databases created by older builds
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: queues written before at-rest encoding lacked the flags column
        let has_encoding: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('offline_queue') WHERE name = 'encoding'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_encoding {
            log::info!("Running migration: Adding encoding column to offline_queue");
            conn.execute(
                "ALTER TABLE offline_queue ADD COLUMN encoding INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }

        // Migration 2: claim timestamps for stale-claim recovery
        let has_processing_started: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('offline_queue') WHERE name = 'processing_started_at'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_processing_started {
            log::info!("Running migration: Adding processing_started_at column to offline_queue");
            conn.execute(
                "ALTER TABLE offline_queue ADD COLUMN processing_started_at TEXT",
                [],
            )?;
        }

        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // HELPER METHODS (for queue storage)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        Ok(conn.execute(sql, params)?)
    }

    /// Execute several statements separated by semicolons
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Run `f` inside a transaction, committing only if it returns `Ok`
    pub fn with_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> DbResult<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
