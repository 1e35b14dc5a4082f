// Background Output Writer
// Persists the last output of each tab off the request path. Best-effort:
// failures are logged and dropped, never retried or reported to the caller.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::db::cell::TabOutput;
use crate::db::reconciler::SessionStore;

enum Job {
    Persist { tab_id: i64, output: TabOutput },
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer task. Jobs are processed in submission order.
pub struct OutputWriter {
    tx: mpsc::UnboundedSender<Job>,
}

impl OutputWriter {
    /// Start the worker on the current tokio runtime
    pub fn spawn(store: Arc<dyn SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Persist { tab_id, output } => {
                        match store.persist_output(tab_id, &output) {
                            Ok(()) => tracing::debug!(tab_id, rows = output.rows.len(), "tab output saved"),
                            Err(e) => tracing::warn!(tab_id, error = %e, "failed to save tab output"),
                        }
                    }
                    Job::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            tracing::debug!("output writer stopped");
        });

        Self { tx }
    }

    /// Queue an output for persistence and return immediately
    pub fn submit(&self, tab_id: i64, output: TabOutput) {
        if self.tx.send(Job::Persist { tab_id, output }).is_err() {
            tracing::warn!(tab_id, "output writer is not running; output dropped");
        }
    }

    /// Wait until every job submitted before this call has been handled
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Job::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cell::Cell;
    use crate::db::reconciler::{ActivationScope, ActiveContext};
    use crate::db::traits::PoolHandle;
    use crate::storage::{StorageError, StorageResult};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<(i64, TabOutput)>>,
    }

    impl SessionStore for RecordingStore {
        fn apply_active_context(&self, _: &ActivationScope, _: &ActiveContext) -> StorageResult<usize> {
            Ok(0)
        }

        fn clear_active_context(&self, _: &[PoolHandle]) -> StorageResult<usize> {
            Ok(0)
        }

        fn persist_output(&self, tab_id: i64, output: &TabOutput) -> StorageResult<()> {
            if tab_id < 0 {
                return Err(StorageError::NotFound(format!("tab {}", tab_id)));
            }
            self.saved.lock().unwrap().push((tab_id, output.clone()));
            Ok(())
        }
    }

    fn output(value: &str) -> TabOutput {
        TabOutput {
            columns: vec!["v".to_string()],
            rows: vec![vec![Cell::new("v", value)]],
        }
    }

    #[tokio::test]
    async fn test_jobs_persist_in_order() {
        let store = Arc::new(RecordingStore::default());
        let writer = OutputWriter::spawn(store.clone());

        writer.submit(1, output("a"));
        writer.submit(2, output("b"));
        writer.submit(1, output("c"));
        writer.flush().await;

        let saved = store.saved.lock().unwrap();
        let ids: Vec<i64> = saved.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 1]);
        assert_eq!(saved[2].1, output("c"));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_worker() {
        let store = Arc::new(RecordingStore::default());
        let writer = OutputWriter::spawn(store.clone());

        writer.submit(-1, output("lost"));
        writer.submit(7, output("kept"));
        writer.flush().await;

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, 7);
    }
}
