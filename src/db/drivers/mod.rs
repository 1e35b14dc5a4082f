// Database Drivers
// Concrete pool backends behind the SqlPool/PoolConnector traits

pub mod postgres;

pub use postgres::{PgPool, PostgresConnector};
