//! Database browsing through an instance's intercepted cursor.

use ormscope_domain::CallTag;
use ormscope_host::{quote_ident, CursorError, QueryResult, SqlValue};
use ormscope_runtime::RuntimeInstance;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::interception::InterceptorRegistry;

const LIST_TABLES_SQL: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryOutcome {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: usize,
    pub error: Option<String>,
}

pub struct Introspector<'a> {
    registry: &'a InterceptorRegistry,
}

impl<'a> Introspector<'a> {
    #[must_use]
    pub fn new(registry: &'a InterceptorRegistry) -> Self {
        Self { registry }
    }

    fn execute(
        &self,
        instance: &RuntimeInstance,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult, CursorError> {
        let mut interpreter = instance.lock();
        let context = self.registry.install(instance.id(), &mut interpreter);
        let _phase = context.enter(None, CallTag::Introspection);
        interpreter.cursor_mut().execute(sql, params)
    }

    /// User tables, sorted by name.
    ///
    /// # Errors
    /// Returns the storage error when the catalog cannot be read.
    pub fn list_tables(&self, instance: &RuntimeInstance) -> Result<Vec<String>, CursorError> {
        let result = self.execute(instance, LIST_TABLES_SQL, &[])?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(SqlValue::Text(name)) => Some(name),
                _ => None,
            })
            .collect())
    }

    /// # Errors
    /// Returns the storage error, or [`CursorError::Database`] when the
    /// table does not exist.
    pub fn table_schema(
        &self,
        instance: &RuntimeInstance,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, CursorError> {
        let result = self.execute(
            instance,
            &format!("PRAGMA table_info({})", quote_ident(table)),
            &[],
        )?;
        if result.rows.is_empty() {
            return Err(CursorError::Database(format!("no such table: {table}")));
        }
        let column = |name: &str| result.columns.iter().position(|column| column == name);
        let (Some(name), Some(data_type), Some(notnull), Some(default), Some(pk)) = (
            column("name"),
            column("type"),
            column("notnull"),
            column("dflt_value"),
            column("pk"),
        ) else {
            return Err(CursorError::Database(
                "unexpected table_info layout".to_string(),
            ));
        };

        Ok(result
            .rows
            .iter()
            .map(|row| ColumnInfo {
                name: text(&row[name]),
                data_type: text(&row[data_type]),
                nullable: !matches!(row[notnull], SqlValue::Integer(1)),
                primary_key: matches!(row[pk], SqlValue::Integer(value) if value > 0),
                default: match &row[default] {
                    SqlValue::Null => None,
                    other => Some(text(other)),
                },
            })
            .collect())
    }

    /// First `limit` rows of `table`, each as an ordered column -> value map.
    ///
    /// # Errors
    /// Returns the storage error for unknown tables.
    pub fn table_rows(
        &self,
        instance: &RuntimeInstance,
        table: &str,
        limit: usize,
    ) -> Result<Vec<Map<String, Value>>, CursorError> {
        let result = self.execute(
            instance,
            &format!("SELECT * FROM {} LIMIT {limit}", quote_ident(table)),
            &[],
        )?;
        Ok(result
            .rows
            .iter()
            .map(|row| {
                result
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(SqlValue::to_json))
                    .collect()
            })
            .collect())
    }

    /// # Errors
    /// Returns the storage error for unknown tables.
    pub fn table_count(&self, instance: &RuntimeInstance, table: &str) -> Result<u64, CursorError> {
        let result = self.execute(
            instance,
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            &[],
        )?;
        match result.rows.first().and_then(|row| row.first()) {
            Some(SqlValue::Integer(count)) => Ok(u64::try_from(*count).unwrap_or_default()),
            _ => Ok(0),
        }
    }

    /// Run arbitrary SQL. Failures are reported in the outcome.
    pub fn execute_query(&self, instance: &RuntimeInstance, sql: &str) -> QueryOutcome {
        match self.execute(instance, sql, &[]) {
            Ok(result) => QueryOutcome {
                success: true,
                rows: result
                    .rows
                    .iter()
                    .map(|row| row.iter().map(SqlValue::to_json).collect())
                    .collect(),
                columns: result.columns,
                rows_affected: result.rows_affected,
                error: None,
            },
            Err(err) => QueryOutcome {
                success: false,
                columns: Vec::new(),
                rows: Vec::new(),
                rows_affected: 0,
                error: Some(err.to_string()),
            },
        }
    }

    /// Drop every user table. Returns the dropped names.
    ///
    /// # Errors
    /// Returns the first storage error; tables dropped before it stay dropped.
    pub fn reset_database(&self, instance: &RuntimeInstance) -> Result<Vec<String>, CursorError> {
        let tables = self.list_tables(instance)?;
        for table in &tables {
            self.execute(
                instance,
                &format!("DROP TABLE IF EXISTS {}", quote_ident(table)),
                &[],
            )?;
        }
        tracing::info!(instance_id = %instance.id(), dropped = tables.len(), "database reset");
        Ok(tables)
    }
}

fn text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(raw) => raw.to_string(),
        SqlValue::Real(raw) => raw.to_string(),
        SqlValue::Text(raw) => raw.clone(),
    }
}
