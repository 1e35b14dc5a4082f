// Query Executor
// Runs SQL against a managed pool and normalizes every outcome into a QueryResult

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::cell::QueryResult;
use crate::db::pool_manager::PoolManager;
use crate::db::traits::{DatabaseError, PoolHandle, SqlParam, SqlPool};

/// Statements starting with one of these run on the write path
const WRITE_KEYWORDS: [&str; 7] = [
    "insert", "update", "delete", "alter", "create", "drop", "truncate",
];

pub const DEFAULT_TABLE_LIMIT: i64 = 100;
pub const MAX_TABLE_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

/// Prefix match on the trimmed, lowercased text. There is no parsing, so a
/// leading comment (`-- note\nDELETE ...`) classifies as Read.
pub fn classify(sql: &str) -> StatementKind {
    let normalized = sql.trim().to_lowercase();
    if WRITE_KEYWORDS.iter().any(|kw| normalized.starts_with(kw)) {
        StatementKind::Write
    } else {
        StatementKind::Read
    }
}

/// Run one statement on an already resolved pool
pub async fn run_statement(pool: &dyn SqlPool, sql: &str, params: &[SqlParam]) -> QueryResult {
    match classify(sql) {
        StatementKind::Write => match pool.execute(sql, params).await {
            Ok(count) => QueryResult::affected(count),
            Err(e) => QueryResult::statement_error(e.to_string()),
        },
        StatementKind::Read => run_read(pool, sql, params).await,
    }
}

async fn run_read(pool: &dyn SqlPool, sql: &str, params: &[SqlParam]) -> QueryResult {
    match pool.query(sql, params).await {
        Ok(rows) => QueryResult::from_row_set(rows),
        // Rows arrived but could not be turned into cells
        Err(DatabaseError::Decode(message)) => QueryResult::failure(message),
        Err(e) => QueryResult::statement_error(e.to_string()),
    }
}

/// Parameters of a table browse. Every fragment is pasted into the SQL text
/// verbatim, so only trusted input may be passed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableQuery {
    pub table: String,
    #[serde(default)]
    pub select: String,
    #[serde(default)]
    pub where_clause: String,
    #[serde(default)]
    pub group_by: String,
    #[serde(default)]
    pub order_by: String,
    #[serde(default)]
    pub limit: String,
    #[serde(default)]
    pub offset: String,
}

impl TableQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Validated row limit
    pub fn limit(&self) -> Result<i64, String> {
        let raw = self.limit.trim();
        if raw.is_empty() {
            return Ok(DEFAULT_TABLE_LIMIT);
        }
        let limit: i64 = raw.parse().map_err(|_| "limit is not a number".to_string())?;
        if limit > MAX_TABLE_LIMIT {
            return Err(format!("limit cannot be greater than {}", MAX_TABLE_LIMIT));
        }
        Ok(limit)
    }

    pub fn to_sql(&self) -> Result<String, String> {
        let limit = self.limit()?;

        let select = match self.select.trim() {
            "" => "*",
            s => s,
        };
        let mut sql = format!("SELECT {} FROM {}", select, self.table.trim());

        let clauses = [
            ("WHERE", &self.where_clause),
            ("GROUP BY", &self.group_by),
            ("ORDER BY", &self.order_by),
        ];
        for (keyword, fragment) in clauses {
            let fragment = fragment.trim();
            if !fragment.is_empty() {
                sql.push_str(&format!(" {} {}", keyword, fragment));
            }
        }

        sql.push_str(&format!(" LIMIT {}", limit));

        let offset = self.offset.trim();
        if !offset.is_empty() {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        Ok(sql)
    }
}

pub struct QueryExecutor {
    pools: Arc<PoolManager>,
}

impl QueryExecutor {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    pub async fn execute(&self, handle: PoolHandle, sql: &str, params: &[SqlParam]) -> QueryResult {
        let pool = match self.pools.get(handle).await {
            Ok(pool) => pool,
            Err(e) => return QueryResult::failure(e.to_string()),
        };

        tracing::debug!(%handle, kind = ?classify(sql), "executing statement");
        run_statement(pool.as_ref(), sql, params).await
    }

    /// Browse a table; limit errors are reported before any SQL is sent
    pub async fn query_table(&self, handle: PoolHandle, query: &TableQuery) -> QueryResult {
        let pool = match self.pools.get(handle).await {
            Ok(pool) => pool,
            Err(e) => return QueryResult::failure(e.to_string()),
        };

        let sql = match query.to_sql() {
            Ok(sql) => sql,
            Err(message) => return QueryResult::failure(message),
        };

        tracing::debug!(%handle, table = %query.table, "browsing table");
        run_read(pool.as_ref(), &sql, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{row_set, text, MockConnector, MockPool};
    use crate::db::traits::DriverValue;

    async fn executor_with(pool: fn() -> MockPool) -> (QueryExecutor, Arc<MockConnector>, PoolHandle) {
        let connector = Arc::new(MockConnector::with_factory(pool));
        let manager = Arc::new(PoolManager::new(connector.clone()));
        let handle = PoolHandle::new();
        manager.create(handle, "postgres://test").await.unwrap();
        (QueryExecutor::new(manager), connector, handle)
    }

    #[test]
    fn test_classify_write_keywords() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "  update t set a = 1",
            "\n\tDELETE FROM t",
            "Alter table t add column b int",
            "create table t (id int)",
            "DROP TABLE t",
            "truncate t",
        ] {
            assert_eq!(classify(sql), StatementKind::Write, "{}", sql);
        }
    }

    #[test]
    fn test_classify_reads() {
        for sql in ["SELECT 1", "with x as (select 1) select * from x", "SHOW search_path", "explain select 1", ""] {
            assert_eq!(classify(sql), StatementKind::Read, "{}", sql);
        }
        // Known limitation of prefix matching
        assert_eq!(classify("-- cleanup\nDELETE FROM t"), StatementKind::Read);
    }

    #[tokio::test]
    async fn test_write_path_reports_rows_affected() {
        let (executor, connector, handle) = executor_with(|| MockPool::new().with_affected(3)).await;

        let result = executor.execute(handle, "UPDATE t SET a = 1", &[]).await;

        assert!(result.ok);
        assert_eq!(result.rows_affected, 3);
        assert_eq!(result.columns, vec!["Rows Affected".to_string()]);
        assert_eq!(result.rows[0][0].value, "3");
        assert_eq!(connector.last_pool().executed(), vec!["UPDATE t SET a = 1".to_string()]);
    }

    #[tokio::test]
    async fn test_read_path_normalizes_cells() {
        let (executor, _, handle) = executor_with(|| {
            MockPool::new().with_rows(
                "FROM users",
                row_set(
                    &["id", "name", "nickname"],
                    vec![vec![DriverValue::Other("1".to_string()), text("ada"), text("")]],
                ),
            )
        })
        .await;

        let result = executor.execute(handle, "select id, name, nickname FROM users", &[]).await;

        assert!(result.ok);
        assert_eq!(result.rows_affected, 0);
        assert_eq!(result.columns.len(), 3);
        assert_eq!(result.rows[0][1].value, "ada");
        assert_eq!(result.rows[0][2].value, "EMPTY");
    }

    #[tokio::test]
    async fn test_statement_error_is_data() {
        let message = "ERROR: syntax error at or near \"SELEC\" (SQLSTATE 42601)";
        let (executor, _, handle) =
            executor_with(|| MockPool::new().failing_on("SELEC ", "ERROR: syntax error at or near \"SELEC\" (SQLSTATE 42601)")).await;

        let result = executor.execute(handle, "SELEC 1", &[]).await;

        assert!(result.ok);
        assert!(result.is_error_row());
        assert_eq!(result.message, message);
        assert_eq!(result.rows[0][0].column, "Error");
        assert_eq!(result.rows[0][0].value, message);
    }

    #[tokio::test]
    async fn test_unknown_handle_fails_request() {
        let (executor, _, _) = executor_with(MockPool::new).await;

        let result = executor.execute(PoolHandle::new(), "SELECT 1", &[]).await;

        assert!(!result.ok);
        assert_eq!(result.message, "pool doesn't exist");
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_closed_pool_reports_statement_error() {
        let (executor, connector, handle) = executor_with(MockPool::new).await;
        connector.last_pool().close();

        let result = executor.execute(handle, "SELECT 1", &[]).await;
        assert!(result.ok);
        assert_eq!(result.message, "pool is closed");
    }

    #[test]
    fn test_table_query_defaults() {
        let sql = TableQuery::new("users").to_sql().unwrap();
        assert_eq!(sql, "SELECT * FROM users LIMIT 100");
    }

    #[test]
    fn test_table_query_all_clauses() {
        let query = TableQuery {
            table: "orders".to_string(),
            select: "customer_id, count(*)".to_string(),
            where_clause: " total > 10 ".to_string(),
            group_by: "customer_id".to_string(),
            order_by: "2 DESC".to_string(),
            limit: "25".to_string(),
            offset: "50".to_string(),
        };
        assert_eq!(
            query.to_sql().unwrap(),
            "SELECT customer_id, count(*) FROM orders WHERE total > 10 GROUP BY customer_id ORDER BY 2 DESC LIMIT 25 OFFSET 50"
        );
    }

    #[test]
    fn test_table_query_limit_validation() {
        let mut query = TableQuery::new("users");
        query.limit = "100".to_string();
        assert!(query.to_sql().is_ok());

        query.limit = "101".to_string();
        assert_eq!(query.to_sql().unwrap_err(), "limit cannot be greater than 100");

        query.limit = "ten".to_string();
        assert_eq!(query.to_sql().unwrap_err(), "limit is not a number");
    }

    #[tokio::test]
    async fn test_row_cap_rejected_before_any_sql() {
        let (executor, connector, handle) = executor_with(MockPool::new).await;

        let mut query = TableQuery::new("users");
        query.limit = "500".to_string();
        let result = executor.query_table(handle, &query).await;

        assert!(!result.ok);
        assert_eq!(result.message, "limit cannot be greater than 100");
        assert!(connector.last_pool().executed().is_empty());
    }

    #[tokio::test]
    async fn test_query_table_runs_read() {
        let (executor, connector, handle) = executor_with(|| {
            MockPool::new().with_rows("FROM users", row_set(&["id"], vec![vec![DriverValue::Null]]))
        })
        .await;

        let result = executor.query_table(handle, &TableQuery::new("users")).await;

        assert!(result.ok);
        assert_eq!(result.rows[0][0].value, "NULL");
        assert_eq!(
            connector.last_pool().executed(),
            vec!["SELECT * FROM users LIMIT 100".to_string()]
        );
    }
}
