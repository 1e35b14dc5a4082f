// Metadata database for connections, tabs and settings
// Handles app data directory resolution and schema setup

use rusqlite::{Connection, Result as SqliteResult};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Failed to get app data directory")]
    AppDataDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Database manager for the local metadata store
pub struct DatabaseManager {
    connection: Mutex<Connection>,
    db_path: PathBuf,
}

impl DatabaseManager {
    /// Open (or create) the metadata database at `db_path`
    pub fn new(db_path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let connection = Connection::open(&db_path)?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;

        let manager = Self {
            connection: Mutex::new(connection),
            db_path,
        };

        manager.init_schema()?;

        Ok(manager)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    fn init_schema(&self) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                r#"
                -- Saved server connections
                CREATE TABLE IF NOT EXISTS connections (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL DEFAULT 5432,
                    username TEXT NOT NULL,
                    password TEXT NOT NULL DEFAULT '',
                    database TEXT NOT NULL DEFAULT 'postgres',
                    env TEXT,
                    colour TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                -- Editor and table tabs, with the pool they are bound to
                CREATE TABLE IF NOT EXISTS tabs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    editor TEXT NOT NULL DEFAULT '',
                    output TEXT NOT NULL DEFAULT '',
                    is_active INTEGER NOT NULL DEFAULT 0,
                    active_pool_id TEXT,
                    active_db TEXT,
                    active_db_colour TEXT,
                    tab_type TEXT NOT NULL DEFAULT 'editor',
                    connection_id INTEGER,
                    db_name TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                -- App state table: key/value settings
                CREATE TABLE IF NOT EXISTS app_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_tabs_active_pool_id ON tabs(active_pool_id);
                CREATE INDEX IF NOT EXISTS idx_tabs_connection ON tabs(connection_id, db_name);
                "#,
            )?;

            // Migration: connection name is denormalized onto table tabs
            let has_connection_name: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('tabs') WHERE name = 'connection_name'",
                [],
                |row| row.get(0),
            )?;

            if !has_connection_name {
                conn.execute("ALTER TABLE tabs ADD COLUMN connection_name TEXT", [])?;
            }

            Ok(())
        })
    }

    /// Execute a function with database connection access
    pub fn with_connection<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T>,
    {
        let conn = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn).map_err(StorageError::from)
    }

    /// Execute a function with mutable database connection access
    pub fn with_connection_mut<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> SqliteResult<T>,
    {
        let mut conn = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut conn).map_err(StorageError::from)
    }
}

/// Get the default database path in the app data directory
pub fn get_default_db_path() -> StorageResult<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "poolside", "poolside-sql")
        .ok_or(StorageError::AppDataDir)?;

    Ok(proj_dirs.data_dir().join("poolside.db"))
}
