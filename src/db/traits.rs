// Database Driver Traits
// Defines the pool capability the manager and executor work against, and the
// closed set of values a driver is allowed to hand back

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use uuid::Uuid;

use crate::storage::StorageError;

/// Common database error type
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("pool doesn't exist")]
    PoolNotFound(PoolHandle),

    #[error("Pool handle already in use: {0}")]
    HandleInUse(PoolHandle),

    #[error("pool is closed")]
    PoolClosed,

    #[error("{0}")]
    Statement(String),

    #[error("Failed to decode row value: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        // Server-side errors read like the server reports them
        if let Some(db_err) = err.as_db_error() {
            return DatabaseError::Statement(format!(
                "{}: {} (SQLSTATE {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            ));
        }
        DatabaseError::Statement(err.to_string())
    }
}

impl<E: StdError + 'static> From<bb8::RunError<E>> for DatabaseError {
    fn from(err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::User(e) => DatabaseError::Statement(e.to_string()),
            bb8::RunError::TimedOut => {
                DatabaseError::Statement("timed out waiting for a pooled connection".to_string())
            }
        }
    }
}

/// Opaque identifier of one live pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolHandle(Uuid);

impl PoolHandle {
    /// Generate a fresh random handle
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PoolHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PoolHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A scalar as it comes off the wire, reduced to the shapes the cell model knows
#[derive(Debug, Clone, PartialEq)]
pub enum DriverValue {
    Null,
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    FixedId16([u8; 16]),
    Text(String),
    /// Any other scalar, already in its default textual form
    Other(String),
}

/// Column names plus decoded rows of one read statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<DriverValue>>,
}

/// Statement parameter bound through the extended query protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Bool(v) => {
                if !<bool as ToSql>::accepts(ty) {
                    return Err(mismatch("boolean", ty));
                }
                v.to_sql(ty, out)
            }
            SqlParam::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::INT8 => v.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                _ => Err(mismatch("integer", ty)),
            },
            SqlParam::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => v.to_sql(ty, out),
                _ => Err(mismatch("float", ty)),
            },
            SqlParam::Text(v) => {
                if !<String as ToSql>::accepts(ty) {
                    return Err(mismatch("text", ty));
                }
                v.to_sql(ty, out)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn mismatch(kind: &str, ty: &Type) -> Box<dyn StdError + Sync + Send> {
    format!("cannot bind {} parameter to a value of type {}", kind, ty.name()).into()
}

/// A bounded set of live connections to one endpoint.
/// Checkout/return happens inside the implementation; callers only run statements.
#[async_trait::async_trait]
pub trait SqlPool: Send + Sync {
    /// Run a statement that does not produce rows and return the affected count
    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, DatabaseError>;

    /// Run a statement and return its column names and decoded rows
    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<RowSet, DatabaseError>;

    /// Stop handing out connections. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens pools for endpoint strings
#[async_trait::async_trait]
pub trait PoolConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn SqlPool>, DatabaseError>;
}
