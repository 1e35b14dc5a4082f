// Module declarations
pub mod commands;
pub mod db;
pub mod storage;

use commands::ConnectionService;
use db::{DatabaseError, PoolConnector, PostgresConnector};
use std::path::PathBuf;
use std::sync::Arc;
use storage::{get_default_db_path, DatabaseManager};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
/// Safe to call more than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Everything a frontend needs, wired together
pub struct AppState {
    pub db: Arc<DatabaseManager>,
    pub service: ConnectionService,
}

/// Open the metadata database (default location unless `db_path` is given),
/// seed settings and build the Postgres-backed service.
pub async fn bootstrap(db_path: Option<PathBuf>) -> Result<AppState, DatabaseError> {
    let db_path = match db_path {
        Some(path) => path,
        None => get_default_db_path()?,
    };
    tracing::info!(path = %db_path.display(), "opening metadata database");

    let db = Arc::new(DatabaseManager::new(db_path)?);
    db.init_default_settings()?;

    let settings = db.get_pool_settings()?;
    tracing::info!(
        max_connections = settings.max_connections,
        connect_timeout_secs = settings.connect_timeout_secs,
        sslmode = %settings.sslmode,
        "pool settings loaded"
    );

    let connector: Arc<dyn PoolConnector> = Arc::new(PostgresConnector::new(&settings));
    Ok(AppState::with_connector(db, connector))
}

impl AppState {
    /// Must be called inside a tokio runtime
    pub fn with_connector(db: Arc<DatabaseManager>, connector: Arc<dyn PoolConnector>) -> Self {
        let service = ConnectionService::new(Arc::clone(&db), connector);
        Self { db, service }
    }

    /// Close every pool and wait for pending output writes
    pub async fn shutdown(&self) -> Result<usize, DatabaseError> {
        let closed = self.service.terminate_all().await?;
        self.service.reconciler().flush().await;
        tracing::info!(pools = closed, "shutdown complete");
        Ok(closed)
    }
}
