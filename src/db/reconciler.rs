// Session/Tab Reconciler
// Keeps tab records consistent with the pool lifecycle: binds idle tabs to a pool
// when it comes up, unbinds them when it goes away, and records query output.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::cell::{QueryResult, TabOutput};
use crate::db::output_writer::OutputWriter;
use crate::db::traits::PoolHandle;
use crate::storage::StorageResult;

/// Which tabs an activation may bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationScope {
    /// Editor tabs not bound to any pool
    Editors,
    /// Unbound table tabs opened for this connection and database
    Tables { connection_id: i64, database: String },
}

/// What a tab shows about the pool it is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveContext {
    pub handle: PoolHandle,
    pub label: String,
    pub colour: Option<String>,
}

/// Tab persistence as seen by the reconciler
pub trait SessionStore: Send + Sync {
    /// Bind unbound tabs in `scope`; returns how many were updated
    fn apply_active_context(
        &self,
        scope: &ActivationScope,
        context: &ActiveContext,
    ) -> StorageResult<usize>;

    /// Unbind every tab referencing one of `handles`
    fn clear_active_context(&self, handles: &[PoolHandle]) -> StorageResult<usize>;

    fn persist_output(&self, tab_id: i64, output: &TabOutput) -> StorageResult<()>;
}

pub struct SessionReconciler {
    store: Arc<dyn SessionStore>,
    writer: OutputWriter,
}

impl SessionReconciler {
    /// Must be called inside a tokio runtime; spawns the output writer
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let writer = OutputWriter::spawn(Arc::clone(&store));
        Self { store, writer }
    }

    /// A pool for `connection_id`/`database` just became active
    pub fn on_activated(
        &self,
        context: &ActiveContext,
        connection_id: i64,
        database: &str,
    ) -> StorageResult<usize> {
        let editors = self
            .store
            .apply_active_context(&ActivationScope::Editors, context)?;
        let tables = self.store.apply_active_context(
            &ActivationScope::Tables {
                connection_id,
                database: database.to_string(),
            },
            context,
        )?;

        tracing::info!(
            handle = %context.handle,
            editors,
            tables,
            "bound idle tabs to pool"
        );
        Ok(editors + tables)
    }

    pub fn on_terminated(&self, handle: PoolHandle) -> StorageResult<usize> {
        self.on_terminated_all(&[handle])
    }

    pub fn on_terminated_all(&self, handles: &[PoolHandle]) -> StorageResult<usize> {
        if handles.is_empty() {
            return Ok(0);
        }
        let cleared = self.store.clear_active_context(handles)?;
        tracing::info!(pools = handles.len(), tabs = cleared, "unbound tabs from terminated pools");
        Ok(cleared)
    }

    /// Hand a result to the background writer. Only results that reached the
    /// database (including error rows) replace the tab's stored output.
    pub fn record_output(&self, tab_id: i64, result: &QueryResult) {
        if !result.ok {
            tracing::debug!(tab_id, message = %result.message, "rejected request; output not stored");
            return;
        }
        self.writer.submit(tab_id, result.to_output());
    }

    /// Wait for queued output writes
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}
