// Pool Manager
// Owns every live pool, keyed by a unique handle. The registry map never leaves
// this module; callers only get shared pool references.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::traits::{DatabaseError, PoolConnector, PoolHandle, SqlPool};

/// Lifecycle of one handle. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Absent,
    Connecting,
    Active,
    Terminated,
}

#[derive(Default)]
struct PoolRegistry {
    active: HashMap<PoolHandle, Arc<dyn SqlPool>>,
    connecting: HashSet<PoolHandle>,
    /// Tombstones of closed pools, one per handle for the life of the process.
    /// They let `state` report `Terminated` and make `create` refuse a reused
    /// handle even from a caller that does not mint fresh v4 ids.
    retired: HashSet<PoolHandle>,
}

impl PoolRegistry {
    fn state(&self, handle: &PoolHandle) -> PoolState {
        if self.active.contains_key(handle) {
            PoolState::Active
        } else if self.connecting.contains(handle) {
            PoolState::Connecting
        } else if self.retired.contains(handle) {
            PoolState::Terminated
        } else {
            PoolState::Absent
        }
    }
}

pub struct PoolManager {
    connector: Arc<dyn PoolConnector>,
    registry: RwLock<PoolRegistry>,
}

impl PoolManager {
    pub fn new(connector: Arc<dyn PoolConnector>) -> Self {
        Self {
            connector,
            registry: RwLock::new(PoolRegistry::default()),
        }
    }

    /// Open a pool for `endpoint` and register it under `handle`.
    ///
    /// The handle is reserved first, so two concurrent creates for the same handle
    /// cannot both connect. The connect itself runs without holding the lock.
    pub async fn create(
        &self,
        handle: PoolHandle,
        endpoint: &str,
    ) -> Result<Arc<dyn SqlPool>, DatabaseError> {
        {
            let mut registry = self.registry.write().await;
            if registry.state(&handle) != PoolState::Absent {
                return Err(DatabaseError::HandleInUse(handle));
            }
            registry.connecting.insert(handle);
        }

        tracing::debug!(%handle, "connecting pool");

        let pool = match self.connector.connect(endpoint).await {
            Ok(pool) => pool,
            Err(e) => {
                self.registry.write().await.connecting.remove(&handle);
                tracing::warn!(%handle, error = %e, "pool connect failed");
                return Err(e);
            }
        };

        let mut registry = self.registry.write().await;
        registry.connecting.remove(&handle);
        registry.active.insert(handle, Arc::clone(&pool));
        tracing::info!(%handle, active = registry.active.len(), "pool registered");

        Ok(pool)
    }

    pub async fn get(&self, handle: PoolHandle) -> Result<Arc<dyn SqlPool>, DatabaseError> {
        let registry = self.registry.read().await;
        registry
            .active
            .get(&handle)
            .cloned()
            .ok_or(DatabaseError::PoolNotFound(handle))
    }

    /// Close and forget one pool. The handle can never be registered again.
    pub async fn delete(&self, handle: PoolHandle) -> Result<(), DatabaseError> {
        let mut registry = self.registry.write().await;
        let pool = registry
            .active
            .remove(&handle)
            .ok_or(DatabaseError::PoolNotFound(handle))?;
        pool.close();
        registry.retired.insert(handle);
        tracing::info!(%handle, "pool closed");
        Ok(())
    }

    /// Close every pool in one critical section and return the handles removed
    pub async fn delete_all(&self) -> Vec<PoolHandle> {
        let mut registry = self.registry.write().await;
        let drained: Vec<(PoolHandle, Arc<dyn SqlPool>)> = registry.active.drain().collect();

        let mut handles = Vec::with_capacity(drained.len());
        for (handle, pool) in drained {
            pool.close();
            registry.retired.insert(handle);
            handles.push(handle);
        }

        tracing::info!(count = handles.len(), "all pools closed");
        handles
    }

    pub async fn state(&self, handle: PoolHandle) -> PoolState {
        self.registry.read().await.state(&handle)
    }

    pub async fn active_handles(&self) -> Vec<PoolHandle> {
        self.registry.read().await.active.keys().copied().collect()
    }
}
