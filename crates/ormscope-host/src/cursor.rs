use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value as JsonValue};

use crate::error::CursorError;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Integer(value) => json!(value),
            Self::Real(value) => json!(value),
            Self::Text(value) => json!(value),
        }
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            Self::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(value) => SqlValue::Integer(value),
        ValueRef::Real(value) => SqlValue::Real(value),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Text(
            bytes
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect::<String>(),
        ),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub rows_affected: usize,
    pub last_insert_rowid: i64,
}

/// The data-access entry point of an interpreter instance.
///
/// Every statement issued by script code, model managers, or introspection
/// goes through exactly one of these two methods.
pub trait Cursor: Send {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, CursorError>;

    #[allow(clippy::missing_errors_doc)]
    fn execute_many(
        &mut self,
        sql: &str,
        param_sets: &[Vec<SqlValue>],
    ) -> Result<QueryResult, CursorError>;

    /// True for cursors that already record their calls.
    fn is_intercepted(&self) -> bool {
        false
    }
}

/// Cursor over a private in-memory SQLite database.
pub struct SqliteCursor {
    conn: Connection,
}

impl std::fmt::Debug for SqliteCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCursor").finish_non_exhaustive()
    }
}

impl SqliteCursor {
    /// Open a fresh in-memory database.
    ///
    /// # Errors
    /// Returns an error when SQLite cannot allocate the connection.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }
}

impl Cursor for SqliteCursor {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, CursorError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(ToString::to_string)
            .collect();

        if columns.is_empty() {
            let rows_affected = stmt.execute(params_from_iter(params.iter()))?;
            return Ok(QueryResult {
                columns,
                rows: Vec::new(),
                rows_affected,
                last_insert_rowid: self.conn.last_insert_rowid(),
            });
        }

        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(from_value_ref(row.get_ref(index)?));
            }
            rows.push(values);
        }

        Ok(QueryResult {
            columns,
            rows,
            rows_affected: 0,
            last_insert_rowid: self.conn.last_insert_rowid(),
        })
    }

    fn execute_many(
        &mut self,
        sql: &str,
        param_sets: &[Vec<SqlValue>],
    ) -> Result<QueryResult, CursorError> {
        let tx = self.conn.transaction()?;
        let mut rows_affected = 0usize;
        {
            let mut stmt = tx.prepare(sql)?;
            for params in param_sets {
                rows_affected += stmt.execute(params_from_iter(params.iter()))?;
            }
        }
        let last_insert_rowid = tx.last_insert_rowid();
        tx.commit()?;
        Ok(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
            last_insert_rowid,
        })
    }
}

/// Placeholder held while a cursor is being swapped out.
pub(crate) struct DetachedCursor;

impl Cursor for DetachedCursor {
    fn execute(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<QueryResult, CursorError> {
        Err(CursorError::Detached)
    }

    fn execute_many(
        &mut self,
        _sql: &str,
        _param_sets: &[Vec<SqlValue>],
    ) -> Result<QueryResult, CursorError> {
        Err(CursorError::Detached)
    }
}

#[cfg(test)]
mod tests {
    use super::{Cursor, SqlValue, SqliteCursor};

    fn open() -> SqliteCursor {
        let cursor = SqliteCursor::open_in_memory();
        assert!(cursor.is_ok());
        cursor.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn execute_returns_rows_for_queries_and_counts_for_writes() {
        let mut cursor = open();
        assert!(cursor
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .is_ok());
        let inserted = cursor.execute(
            "INSERT INTO t (name) VALUES (?)",
            &[SqlValue::Text("ada".to_string())],
        );
        assert!(inserted.is_ok());
        let inserted = inserted.unwrap_or_else(|_| unreachable!());
        assert_eq!(inserted.rows_affected, 1);
        assert_eq!(inserted.last_insert_rowid, 1);

        let selected = cursor.execute("SELECT id, name FROM t", &[]);
        assert!(selected.is_ok());
        let selected = selected.unwrap_or_else(|_| unreachable!());
        assert_eq!(selected.columns, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(
            selected.rows,
            vec![vec![SqlValue::Integer(1), SqlValue::Text("ada".to_string())]]
        );
    }

    #[test]
    fn execute_many_applies_every_parameter_set() {
        let mut cursor = open();
        assert!(cursor.execute("CREATE TABLE t (v INTEGER)", &[]).is_ok());
        let result = cursor.execute_many(
            "INSERT INTO t (v) VALUES (?)",
            &[vec![SqlValue::Integer(1)], vec![SqlValue::Integer(2)]],
        );
        assert!(result.is_ok());
        assert_eq!(result.unwrap_or_else(|_| unreachable!()).rows_affected, 2);
    }

    #[test]
    fn malformed_statements_fail() {
        let mut cursor = open();
        assert!(cursor.execute("SELEC nonsense", &[]).is_err());
        assert!(!cursor.is_intercepted());
    }
}
