// Saved server connections
// The connection registry the pool flows resolve descriptors from

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::database::{DatabaseManager, StorageError, StorageResult};
use crate::db::connection::ConnectionDescriptor;

pub const CONNECTION_NAME_CONFLICT: &str =
    "Connection name already exists. Please choose a different name";

/// Input for saving a new connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConnection {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub database: String,
    pub env: Option<String>,
    pub colour: Option<String>,
}

impl NewConnection {
    /// Descriptor for a connection that has not been saved yet
    pub fn to_descriptor(&self, id: i64) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id,
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            env: self.env.clone(),
            colour: self.colour.clone(),
        }
    }
}

/// Read side used by the connect flows, plus registration of new connections
pub trait ConnectionRegistry: Send + Sync {
    fn lookup_connection(&self, id: i64) -> StorageResult<Option<ConnectionDescriptor>>;

    fn list_connections(&self) -> StorageResult<Vec<ConnectionDescriptor>>;

    /// Empty `database` is stored as `fallback_database`
    fn insert_connection(
        &self,
        input: NewConnection,
        fallback_database: &str,
    ) -> StorageResult<ConnectionDescriptor>;
}

const SELECT_CONNECTION: &str =
    "SELECT id, name, host, port, username, password, database, env, colour FROM connections";

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<ConnectionDescriptor> {
    Ok(ConnectionDescriptor {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        password: row.get(5)?,
        database: row.get(6)?,
        env: row.get(7)?,
        colour: row.get(8)?,
    })
}

impl ConnectionRegistry for DatabaseManager {
    fn lookup_connection(&self, id: i64) -> StorageResult<Option<ConnectionDescriptor>> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("{} WHERE id = ?1", SELECT_CONNECTION),
                params![id],
                connection_from_row,
            )
            .optional()
        })
    }

    fn list_connections(&self) -> StorageResult<Vec<ConnectionDescriptor>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_CONNECTION))?;
            let connections = stmt
                .query_map([], connection_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(connections)
        })
    }

    fn insert_connection(
        &self,
        input: NewConnection,
        fallback_database: &str,
    ) -> StorageResult<ConnectionDescriptor> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(StorageError::Validation("Connection name is required".to_string()));
        }
        if input.host.trim().is_empty() {
            return Err(StorageError::Validation("Host is required".to_string()));
        }

        let exists: bool = self.with_connection(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM connections WHERE name = ?1)",
                params![name],
                |row| row.get(0),
            )
        })?;
        if exists {
            return Err(StorageError::Conflict(CONNECTION_NAME_CONFLICT.to_string()));
        }

        let database = match input.database.trim() {
            "" => fallback_database.to_string(),
            db => db.to_string(),
        };

        let id = self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO connections (name, host, port, username, password, database, env, colour)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    name,
                    input.host.trim(),
                    input.port,
                    input.username,
                    input.password,
                    database,
                    input.env,
                    input.colour
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        self.lookup_connection(id)?
            .ok_or_else(|| StorageError::NotFound(format!("connection {}", id)))
    }
}
