// Test doubles for the pool boundary

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::traits::{DatabaseError, DriverValue, PoolConnector, RowSet, SqlParam, SqlPool};
use crate::storage::DatabaseManager;

pub fn text(value: &str) -> DriverValue {
    DriverValue::Text(value.to_string())
}

pub fn row_set(columns: &[&str], rows: Vec<Vec<DriverValue>>) -> RowSet {
    RowSet {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows,
    }
}

/// Metadata database in a temp directory that lives as long as the guard
pub fn temp_store() -> (Arc<DatabaseManager>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = DatabaseManager::new(dir.path().join("poolside.db")).unwrap();
    (Arc::new(db), dir)
}

/// In-memory pool. Responses are chosen by the first registered fragment the
/// statement contains.
#[derive(Default)]
pub struct MockPool {
    closed: AtomicBool,
    pub statements: Mutex<Vec<String>>,
    responses: Vec<(String, RowSet)>,
    failures: Vec<(String, String)>,
    affected: u64,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, fragment: &str, rows: RowSet) -> Self {
        self.responses.push((fragment.to_string(), rows));
        self
    }

    pub fn failing_on(mut self, fragment: &str, message: &str) -> Self {
        self.failures.push((fragment.to_string(), message.to_string()));
        self
    }

    pub fn with_affected(mut self, affected: u64) -> Self {
        self.affected = affected;
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    fn run(&self, sql: &str) -> Result<(), DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::PoolClosed);
        }
        self.statements.lock().unwrap().push(sql.to_string());
        match self.failures.iter().find(|(fragment, _)| sql.contains(fragment.as_str())) {
            Some((_, message)) => Err(DatabaseError::Statement(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl SqlPool for MockPool {
    async fn execute(&self, sql: &str, _params: &[SqlParam]) -> Result<u64, DatabaseError> {
        self.run(sql)?;
        Ok(self.affected)
    }

    async fn query(&self, sql: &str, _params: &[SqlParam]) -> Result<RowSet, DatabaseError> {
        self.run(sql)?;
        Ok(self
            .responses
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type PoolFactory = Box<dyn Fn() -> MockPool + Send + Sync>;

/// Connector handing out fresh `MockPool`s; every pool it made stays inspectable
pub struct MockConnector {
    factory: PoolFactory,
    fail: AtomicBool,
    delay: Option<Duration>,
    connects: AtomicUsize,
    pub endpoints: Mutex<Vec<String>>,
    pub pools: Mutex<Vec<Arc<MockPool>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_factory(MockPool::new)
    }

    pub fn with_factory(factory: impl Fn() -> MockPool + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            fail: AtomicBool::new(false),
            delay: None,
            connects: AtomicUsize::new(0),
            endpoints: Mutex::new(Vec::new()),
            pools: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make later connects fail as an unreachable server would
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_pool(&self) -> Arc<MockPool> {
        self.pools.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait::async_trait]
impl PoolConnector for MockConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn SqlPool>, DatabaseError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DatabaseError::ConnectionFailed(
                "password authentication failed".to_string(),
            ));
        }
        let pool = Arc::new((self.factory)());
        self.pools.lock().unwrap().push(Arc::clone(&pool));
        Ok(pool)
    }
}
