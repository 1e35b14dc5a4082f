// Connection Service
// Entry points the UI layer calls: connect, terminate, execute, and table browsing.
// Ties the registry, pool manager, executor and reconciler together.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::cell::{render_value, QueryResult};
use crate::db::connection::{build_endpoint, ConnectionDescriptor};
use crate::db::pool_manager::PoolManager;
use crate::db::query::{QueryExecutor, TableQuery};
use crate::db::reconciler::{ActiveContext, SessionReconciler};
use crate::db::traits::{DatabaseError, DriverValue, PoolConnector, PoolHandle, SqlParam, SqlPool};
use crate::storage::{ConnectionRegistry, DatabaseManager, NewConnection, StorageError};

const TEST_CONNECTION_SQL: &str = "SELECT 'Connection Successful!' AS success";
const DATABASES_SQL: &str = "SELECT datname FROM pg_database";
const TABLES_SQL: &str = "SELECT tablename FROM pg_tables WHERE schemaname = 'public'";
const COLUMNS_SQL: &str = "SELECT DISTINCT column_name FROM information_schema.columns WHERE table_schema NOT IN ('information_schema', 'pg_catalog')";

/// One database of a server as shown in the sidebar. Only the database a pool
/// was opened for carries the handle and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub id: String,
    pub name: String,
    pub connection_id: i64,
    pub connection_name: String,
    pub colour: Option<String>,
    pub pool_id: Option<PoolHandle>,
    pub is_active: bool,
    pub tables: Vec<String>,
    pub columns: Vec<String>,
}

impl DatabaseEntry {
    fn inactive(name: String, descriptor: &ConnectionDescriptor) -> Self {
        Self {
            id: format!("db_{}", uuid::Uuid::new_v4()),
            name,
            connection_id: descriptor.id,
            connection_name: descriptor.name.clone(),
            colour: descriptor.colour.clone(),
            pool_id: None,
            is_active: false,
            tables: Vec::new(),
            columns: Vec::new(),
        }
    }

    fn activate(&mut self, handle: PoolHandle, tables: Vec<String>, columns: Vec<String>) {
        self.pool_id = Some(handle);
        self.is_active = true;
        self.tables = tables;
        self.columns = columns;
    }
}

pub struct ConnectionService {
    store: Arc<DatabaseManager>,
    connector: Arc<dyn PoolConnector>,
    pools: Arc<PoolManager>,
    executor: QueryExecutor,
    reconciler: Arc<SessionReconciler>,
}

impl ConnectionService {
    /// Must be called inside a tokio runtime
    pub fn new(store: Arc<DatabaseManager>, connector: Arc<dyn PoolConnector>) -> Self {
        let pools = Arc::new(PoolManager::new(Arc::clone(&connector)));
        let reconciler = Arc::new(SessionReconciler::new(store.clone()));
        Self {
            store,
            connector,
            executor: QueryExecutor::new(Arc::clone(&pools)),
            pools,
            reconciler,
        }
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn reconciler(&self) -> &Arc<SessionReconciler> {
        &self.reconciler
    }

    // ========================================================================
    // Connection registry
    // ========================================================================

    pub fn list_connections(&self) -> Result<Vec<ConnectionDescriptor>, DatabaseError> {
        Ok(self.store.list_connections()?)
    }

    pub fn add_connection(&self, input: NewConnection) -> Result<ConnectionDescriptor, DatabaseError> {
        let settings = self.store.get_pool_settings()?;
        let saved = self.store.insert_connection(input, &settings.fallback_database)?;
        tracing::info!(connection_id = saved.id, name = %saved.name, "connection saved");
        Ok(saved)
    }

    /// Open a throwaway pool, run a trivial query, close it again
    pub async fn test_connection(&self, input: &NewConnection) -> Result<String, DatabaseError> {
        let settings = self.store.get_pool_settings()?;
        let descriptor = input.to_descriptor(0);
        let endpoint = build_endpoint(
            &descriptor,
            descriptor.database_or(&settings.fallback_database),
            &settings.sslmode,
        )?;

        let pool = self.connector.connect(&endpoint).await?;
        let outcome = first_column(pool.as_ref(), TEST_CONNECTION_SQL).await;
        pool.close();

        let greeting = outcome?.into_iter().next().unwrap_or_default();
        tracing::info!(host = %descriptor.host, "test connection succeeded");
        Ok(greeting)
    }

    // ========================================================================
    // Pool lifecycle
    // ========================================================================

    /// Connect to a server on its configured database and list every database on it
    pub async fn connect_server(&self, connection_id: i64) -> Result<Vec<DatabaseEntry>, DatabaseError> {
        let descriptor = self.descriptor(connection_id)?;
        let settings = self.store.get_pool_settings()?;
        let database = descriptor.database_or(&settings.fallback_database).to_string();

        let (handle, pool) = self.open_pool(&descriptor, &database, &settings.sslmode).await?;

        let metadata = futures::try_join!(
            first_column(pool.as_ref(), TABLES_SQL),
            first_column(pool.as_ref(), COLUMNS_SQL),
            first_column(pool.as_ref(), DATABASES_SQL),
        );
        let (tables, columns, databases) = self.or_rollback(handle, metadata).await?;

        self.bind_tabs(handle, &descriptor, &database).await?;

        let entries = databases
            .into_iter()
            .map(|name| {
                let is_active = name == database;
                let mut entry = DatabaseEntry::inactive(name, &descriptor);
                if is_active {
                    entry.activate(handle, tables.clone(), columns.clone());
                }
                entry
            })
            .collect();

        Ok(entries)
    }

    /// Connect to one named database of a saved server
    pub async fn connect_database(
        &self,
        connection_id: i64,
        db_name: &str,
    ) -> Result<DatabaseEntry, DatabaseError> {
        let descriptor = self.descriptor(connection_id)?;
        let settings = self.store.get_pool_settings()?;
        let database = db_name.trim();
        if database.is_empty() {
            return Err(DatabaseError::InvalidConfig("database name is required".to_string()));
        }

        let (handle, pool) = self.open_pool(&descriptor, database, &settings.sslmode).await?;

        let metadata = futures::try_join!(
            first_column(pool.as_ref(), TABLES_SQL),
            first_column(pool.as_ref(), COLUMNS_SQL),
        );
        let (tables, columns) = self.or_rollback(handle, metadata).await?;

        self.bind_tabs(handle, &descriptor, database).await?;

        let mut entry = DatabaseEntry::inactive(database.to_string(), &descriptor);
        entry.activate(handle, tables, columns);
        Ok(entry)
    }

    /// Reload the table list of an already connected database
    pub async fn refresh_database(
        &self,
        connection_id: i64,
        entry_id: &str,
        db_name: &str,
        handle: PoolHandle,
    ) -> Result<DatabaseEntry, DatabaseError> {
        let descriptor = self.descriptor(connection_id)?;
        let pool = self.pools.get(handle).await?;
        let tables = first_column(pool.as_ref(), TABLES_SQL).await?;

        let mut entry = DatabaseEntry::inactive(db_name.to_string(), &descriptor);
        entry.id = entry_id.to_string();
        entry.activate(handle, tables, Vec::new());
        Ok(entry)
    }

    /// Unbind tabs from the pool, then close it
    pub async fn terminate(&self, handle: PoolHandle) -> Result<(), DatabaseError> {
        self.reconciler.on_terminated(handle)?;
        self.pools.delete(handle).await?;
        Ok(())
    }

    /// Close every pool, then unbind every tab that referenced one
    pub async fn terminate_all(&self) -> Result<usize, DatabaseError> {
        let handles = self.pools.delete_all().await;
        self.reconciler.on_terminated_all(&handles)?;
        Ok(handles.len())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Run SQL for a tab; the tab's stored output is updated in the background
    pub async fn execute(
        &self,
        tab_id: i64,
        handle: PoolHandle,
        sql: &str,
        params: &[SqlParam],
    ) -> QueryResult {
        let result = self.executor.execute(handle, sql, params).await;
        self.reconciler.record_output(tab_id, &result);
        result
    }

    pub async fn query_table(&self, tab_id: i64, handle: PoolHandle, query: &TableQuery) -> QueryResult {
        let result = self.executor.query_table(handle, query).await;
        self.reconciler.record_output(tab_id, &result);
        result
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn descriptor(&self, connection_id: i64) -> Result<ConnectionDescriptor, DatabaseError> {
        self.store.lookup_connection(connection_id)?.ok_or_else(|| {
            DatabaseError::Storage(StorageError::NotFound(format!(
                "connection {}",
                connection_id
            )))
        })
    }

    async fn open_pool(
        &self,
        descriptor: &ConnectionDescriptor,
        database: &str,
        sslmode: &str,
    ) -> Result<(PoolHandle, Arc<dyn SqlPool>), DatabaseError> {
        let endpoint = build_endpoint(descriptor, database, sslmode)?;
        let handle = PoolHandle::new();
        let pool = self.pools.create(handle, &endpoint).await?;
        tracing::info!(%handle, connection_id = descriptor.id, database, "pool opened");
        Ok((handle, pool))
    }

    async fn bind_tabs(
        &self,
        handle: PoolHandle,
        descriptor: &ConnectionDescriptor,
        database: &str,
    ) -> Result<(), DatabaseError> {
        let context = ActiveContext {
            handle,
            label: descriptor.active_label(database),
            colour: descriptor.colour.clone(),
        };
        let bound = self.reconciler.on_activated(&context, descriptor.id, database);
        self.or_rollback(handle, bound.map_err(DatabaseError::from)).await?;
        Ok(())
    }

    /// Remove a freshly created pool when the rest of the connect flow fails.
    /// Tabs bound before the failure are unbound first so none keep the handle.
    async fn or_rollback<T>(
        &self,
        handle: PoolHandle,
        outcome: Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        if let Err(e) = &outcome {
            tracing::warn!(%handle, error = %e, "connect flow failed; closing pool");
            if let Err(clear_err) = self.reconciler.on_terminated(handle) {
                tracing::warn!(%handle, error = %clear_err, "could not unbind tabs during rollback");
            }
            let _ = self.pools.delete(handle).await;
        }
        outcome
    }
}

/// First column of every row, as text
async fn first_column(pool: &dyn SqlPool, sql: &str) -> Result<Vec<String>, DatabaseError> {
    let rows = pool.query(sql, &[]).await?;
    Ok(rows
        .rows
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .map(|value| match value {
            DriverValue::Text(text) => text,
            other => render_value(other),
        })
        .collect())
}
