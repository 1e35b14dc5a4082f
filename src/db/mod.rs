// Database Module
// Pool lifecycle, statement execution and result normalization

pub mod cell;
pub mod connection;
pub mod drivers;
pub mod output_writer;
pub mod pool_manager;
pub mod query;
pub mod reconciler;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use cell::{Cell, QueryResult, TabOutput};
pub use connection::{build_endpoint, ConnectionDescriptor};
pub use drivers::PostgresConnector;
pub use pool_manager::{PoolManager, PoolState};
pub use query::{classify, QueryExecutor, StatementKind, TableQuery};
pub use reconciler::{ActivationScope, ActiveContext, SessionReconciler, SessionStore};
pub use traits::{DatabaseError, DriverValue, PoolConnector, PoolHandle, RowSet, SqlParam, SqlPool};
