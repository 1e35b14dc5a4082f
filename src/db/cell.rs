// Cell/Result model
// The normalized, wire-safe shape every query result is reduced to before it leaves
// the executor or gets persisted against a tab

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::traits::{DriverValue, RowSet};

/// Rendered in place of SQL NULL.
///
/// A real text value equal to `"NULL"` renders identically; consumers cannot tell
/// the two apart. Kept as-is so persisted outputs stay readable.
pub const NULL_MARKER: &str = "NULL";

/// Rendered in place of an empty string. Same collision caveat as [`NULL_MARKER`].
pub const EMPTY_MARKER: &str = "EMPTY";

pub const ERROR_COLUMN: &str = "Error";
pub const ROWS_AFFECTED_COLUMN: &str = "Rows Affected";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub column: String,
    pub value: String,
}

impl Cell {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Normalize one driver value into a cell
    pub fn from_value(column: &str, value: DriverValue) -> Self {
        Self::new(column, render_value(value))
    }
}

/// Text form of a driver value. Timestamps are RFC 3339 in UTC, with the
/// fraction only when it is non-zero (milli, micro or nano digits).
pub fn render_value(value: DriverValue) -> String {
    match value {
        DriverValue::Null => NULL_MARKER.to_string(),
        DriverValue::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        DriverValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        DriverValue::FixedId16(bytes) => Uuid::from_bytes(bytes).hyphenated().to_string(),
        DriverValue::Text(text) if text.is_empty() => EMPTY_MARKER.to_string(),
        DriverValue::Text(text) => text,
        DriverValue::Other(text) => text,
    }
}

/// Outcome of one statement, in the shape the UI renders and the tab store keeps.
///
/// `ok == false` only when the request itself was invalid (unknown pool, bad limit).
/// Errors raised by the database are still `ok == true`, reported as a one-row
/// result under the `"Error"` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub ok: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub rows_affected: i64,
    pub message: String,
}

impl QueryResult {
    /// The request was rejected before or instead of reaching the database
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: 0,
            message: message.into(),
        }
    }

    /// The database rejected the statement; report it as data
    pub fn statement_error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            ok: true,
            columns: vec![ERROR_COLUMN.to_string()],
            rows: vec![vec![Cell::new(ERROR_COLUMN, message.clone())]],
            rows_affected: 0,
            message,
        }
    }

    pub fn affected(count: u64) -> Self {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        Self {
            ok: true,
            columns: vec![ROWS_AFFECTED_COLUMN.to_string()],
            rows: vec![vec![Cell::new(ROWS_AFFECTED_COLUMN, count.to_string())]],
            rows_affected: count,
            message: String::new(),
        }
    }

    /// Normalize a decoded row set
    pub fn from_row_set(row_set: RowSet) -> Self {
        let RowSet { columns, rows } = row_set;
        let rows = rows
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| Cell::from_value(column, value))
                    .collect()
            })
            .collect();

        Self {
            ok: true,
            columns,
            rows,
            rows_affected: 0,
            message: String::new(),
        }
    }

    pub fn is_error_row(&self) -> bool {
        self.ok && self.columns.len() == 1 && self.columns[0] == ERROR_COLUMN
    }

    /// The part of the result that is persisted per tab
    pub fn to_output(&self) -> TabOutput {
        TabOutput {
            columns: self.columns.clone(),
            rows: self.rows.clone(),
        }
    }
}

/// Last output of a tab as stored in the session store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}
