//! libSQL database shared by the durable queue and the task record store.
//!
//! A single connection is opened and handed to both backends. For in-memory
//! databases every `connect()` would produce an isolated database, so the
//! connection itself is what gets shared.

use std::path::Path;
use std::sync::Arc;

use libsql::Connection;
use tracing::info;

use crate::error::StoreError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL,
            document TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

        CREATE TABLE IF NOT EXISTS work_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            list TEXT NOT NULL,
            position INTEGER NOT NULL,
            task_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            claimed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_work_queue_list ON work_queue(list, id);
        CREATE INDEX IF NOT EXISTS idx_work_queue_task ON work_queue(list, task_id);
    "#,
}];

/// Handle to an open database and its shared connection.
#[derive(Clone)]
pub struct Db {
    #[allow(dead_code)]
    db: Arc<libsql::Database>,
    conn: Connection,
}

impl Db {
    /// Open (or create) a local database file and run migrations.
    pub async fn open_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to open libSQL database: {e}")))?;
        let handle = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(handle)
    }

    /// In-memory database, used by tests and throwaway runs.
    pub async fn open_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Backend(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: libsql::Database) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;
        run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }
}

async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Backend(format!("Failed to create _migrations table: {e}")))?;

    let current_version = current_version(conn).await?;
    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        conn.execute_batch(migration.sql).await.map_err(|e| {
            StoreError::Backend(format!(
                "Migration V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| StoreError::Backend(format!("Failed to record migration: {e}")))?;
    }
    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Backend(format!("Failed to query migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Backend(format!("Failed to parse migration version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(StoreError::Backend(format!(
            "Failed to read migration version: {e}"
        ))),
    }
}
