// App state and settings management
// Handles persistent key-value storage in the app_state table

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::database::{DatabaseManager, StorageError, StorageResult};

const KEY_MAX_CONNECTIONS: &str = "pool_max_connections";
const KEY_CONNECT_TIMEOUT: &str = "pool_connect_timeout_secs";
const KEY_SSLMODE: &str = "postgres_sslmode";
const KEY_FALLBACK_DATABASE: &str = "fallback_database";

/// sslmode values the Postgres connector accepts
pub const SSL_MODES: [&str; 3] = ["disable", "prefer", "require"];

/// Settings that shape how pools are opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub sslmode: String,
    pub fallback_database: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_secs: 30,
            sslmode: "prefer".to_string(),
            fallback_database: "postgres".to_string(),
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_connections < 1 {
            return Err(StorageError::Validation(
                "max connections must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_secs < 1 {
            return Err(StorageError::Validation(
                "connect timeout must be at least 1 second".to_string(),
            ));
        }
        if !SSL_MODES.contains(&self.sslmode.as_str()) {
            return Err(StorageError::Validation(format!(
                "unsupported sslmode '{}'",
                self.sslmode
            )));
        }
        if self.fallback_database.trim().is_empty() {
            return Err(StorageError::Validation(
                "fallback database cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl DatabaseManager {
    /// Get a setting value by key
    pub fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        self.with_connection(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM app_state WHERE key = ?",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    /// Set a setting value by key
    pub fn set_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO app_state (key, value, updated_at)
                 VALUES (?, ?, datetime('now'))",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Read pool settings, falling back to defaults for missing or unparsable keys
    pub fn get_pool_settings(&self) -> StorageResult<PoolSettings> {
        let defaults = PoolSettings::default();

        Ok(PoolSettings {
            max_connections: self
                .get_setting(KEY_MAX_CONNECTIONS)?
                .and_then(|v| v.parse().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.max_connections),
            connect_timeout_secs: self
                .get_setting(KEY_CONNECT_TIMEOUT)?
                .and_then(|v| v.parse().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.connect_timeout_secs),
            sslmode: self
                .get_setting(KEY_SSLMODE)?
                .filter(|v| SSL_MODES.contains(&v.as_str()))
                .unwrap_or(defaults.sslmode),
            fallback_database: self
                .get_setting(KEY_FALLBACK_DATABASE)?
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.fallback_database),
        })
    }

    /// Validate and store pool settings
    pub fn update_pool_settings(&self, settings: &PoolSettings) -> StorageResult<()> {
        settings.validate()?;
        self.set_setting(KEY_MAX_CONNECTIONS, &settings.max_connections.to_string())?;
        self.set_setting(KEY_CONNECT_TIMEOUT, &settings.connect_timeout_secs.to_string())?;
        self.set_setting(KEY_SSLMODE, &settings.sslmode)?;
        self.set_setting(KEY_FALLBACK_DATABASE, settings.fallback_database.trim())?;
        Ok(())
    }

    /// Initialize default settings if they don't exist
    pub fn init_default_settings(&self) -> StorageResult<()> {
        let defaults = PoolSettings::default();
        if self.get_setting(KEY_MAX_CONNECTIONS)?.is_none() {
            self.set_setting(KEY_MAX_CONNECTIONS, &defaults.max_connections.to_string())?;
        }
        if self.get_setting(KEY_CONNECT_TIMEOUT)?.is_none() {
            self.set_setting(KEY_CONNECT_TIMEOUT, &defaults.connect_timeout_secs.to_string())?;
        }
        if self.get_setting(KEY_SSLMODE)?.is_none() {
            self.set_setting(KEY_SSLMODE, &defaults.sslmode)?;
        }
        if self.get_setting(KEY_FALLBACK_DATABASE)?.is_none() {
            self.set_setting(KEY_FALLBACK_DATABASE, &defaults.fallback_database)?;
        }
        Ok(())
    }
}
