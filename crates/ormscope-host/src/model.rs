//! Model definitions and the SQL their managers issue.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::cursor::SqlValue;
use crate::error::ScriptError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Text,
    Int,
    Real,
    Bool,
}

impl FieldType {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "text" => Some(Self::Text),
            "int" => Some(Self::Int),
            "real" => Some(Self::Real),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }

    #[must_use]
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Int | Self::Bool => "INTEGER",
            Self::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub nullable: bool,
    pub default: Option<Value>,
}

/// Anything that can describe the table backing it.
///
/// The orchestrator discovers models by asking each namespace binding for
/// this view and provisions one table per hit.
pub trait SchemaDescribable {
    fn model_name(&self) -> &str;

    /// Explicit group label, if one was declared or assigned.
    fn group(&self) -> Option<String>;

    /// Set the group unless one is already present.
    fn assign_group(&self, group: &str);

    fn fields(&self) -> &[FieldDef];

    fn table_name(&self, default_group: &str) -> String {
        let group = self.group().unwrap_or_else(|| default_group.to_string());
        format!("{group}_{}", self.model_name().to_lowercase())
    }

    fn create_table_sql(&self, default_group: &str) -> String {
        let mut columns = vec![format!(
            "{} INTEGER PRIMARY KEY AUTOINCREMENT",
            quote_ident("id")
        )];
        for field in self.fields() {
            let null = if field.nullable { "NULL" } else { "NOT NULL" };
            columns.push(format!(
                "{} {} {null}",
                quote_ident(&field.name),
                field.ty.sql_type()
            ));
        }
        format!(
            "CREATE TABLE {} ({})",
            quote_ident(&self.table_name(default_group)),
            columns.join(", ")
        )
    }
}

/// View a namespace binding as a model, if it is one.
#[must_use]
pub fn as_schema_describable(value: &Value) -> Option<&dyn SchemaDescribable> {
    match value {
        Value::Model(model) => Some(model.as_ref()),
        _ => None,
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug)]
pub struct ModelDef {
    name: String,
    group: RwLock<Option<String>>,
    fields: Vec<FieldDef>,
    /// Group used when none was declared; fixed when the model is evaluated.
    fallback_group: String,
}

impl ModelDef {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        group: Option<String>,
        fields: Vec<FieldDef>,
        fallback_group: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            group: RwLock::new(group),
            fields,
            fallback_group: fallback_group.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn table(&self) -> String {
        self.table_name(&self.fallback_group)
    }

    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    fn column_list(&self) -> String {
        std::iter::once("id")
            .chain(self.fields.iter().map(|field| field.name.as_str()))
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Resolve `field=value` filter arguments into a WHERE clause.
    fn where_clause(
        &self,
        filters: &[(String, Value)],
        negate: bool,
    ) -> Result<(String, Vec<SqlValue>), ScriptError> {
        if filters.is_empty() {
            return Ok((String::new(), Vec::new()));
        }
        let mut terms = Vec::with_capacity(filters.len());
        let mut params = Vec::new();
        for (name, value) in filters {
            if name != "id" && self.field_index(name).is_none() {
                return Err(ScriptError::new(format!(
                    "{} has no field '{name}'",
                    self.name
                )));
            }
            let sql = value.to_sql()?;
            if sql == SqlValue::Null {
                terms.push(format!("{} IS NULL", quote_ident(name)));
            } else {
                terms.push(format!("{} = ?", quote_ident(name)));
                params.push(sql);
            }
        }
        let joined = terms.join(" AND ");
        let clause = if negate {
            format!(" WHERE NOT ({joined})")
        } else {
            format!(" WHERE {joined}")
        };
        Ok((clause, params))
    }

    pub(crate) fn select_sql(
        &self,
        filters: &[(String, Value)],
        negate: bool,
        limit: Option<usize>,
    ) -> Result<(String, Vec<SqlValue>), ScriptError> {
        let (clause, params) = self.where_clause(filters, negate)?;
        let mut sql = format!(
            "SELECT {} FROM {}{clause} ORDER BY {}",
            self.column_list(),
            quote_ident(&self.table()),
            quote_ident("id")
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        Ok((sql, params))
    }

    pub(crate) fn count_sql(
        &self,
        filters: &[(String, Value)],
    ) -> Result<(String, Vec<SqlValue>), ScriptError> {
        let (clause, params) = self.where_clause(filters, false)?;
        Ok((
            format!("SELECT COUNT(*) FROM {}{clause}", quote_ident(&self.table())),
            params,
        ))
    }

    pub(crate) fn delete_where_sql(
        &self,
        filters: &[(String, Value)],
    ) -> Result<(String, Vec<SqlValue>), ScriptError> {
        let (clause, params) = self.where_clause(filters, false)?;
        Ok((
            format!("DELETE FROM {}{clause}", quote_ident(&self.table())),
            params,
        ))
    }

    pub(crate) fn insert_sql(&self) -> String {
        if self.fields.is_empty() {
            return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&self.table()));
        }
        let names = self
            .fields
            .iter()
            .map(|field| quote_ident(&field.name))
            .collect::<Vec<_>>()
            .join(", ");
        let holes = vec!["?"; self.fields.len()].join(", ");
        format!(
            "INSERT INTO {} ({names}) VALUES ({holes})",
            quote_ident(&self.table())
        )
    }

    pub(crate) fn update_sql(&self) -> String {
        let assignments = self
            .fields
            .iter()
            .map(|field| format!("{} = ?", quote_ident(&field.name)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {} SET {assignments} WHERE {} = ?",
            quote_ident(&self.table()),
            quote_ident("id")
        )
    }

    pub(crate) fn delete_by_id_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(&self.table()),
            quote_ident("id")
        )
    }

    /// Build an unsaved record from keyword arguments, applying defaults.
    pub(crate) fn instantiate(
        self: &Arc<Self>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Record, ScriptError> {
        let mut values: Vec<Option<Value>> = vec![None; self.fields.len()];
        let mut id = None;
        for (name, value) in kwargs {
            if name == "id" {
                id = match value {
                    Value::Int(raw) => Some(raw),
                    Value::None => None,
                    other => {
                        return Err(ScriptError::new(format!(
                            "id must be an int, not {}",
                            other.type_name()
                        )))
                    }
                };
                continue;
            }
            let index = self.field_index(&name).ok_or_else(|| {
                ScriptError::new(format!("{} has no field '{name}'", self.name))
            })?;
            values[index] = Some(value);
        }
        let values = values
            .into_iter()
            .zip(&self.fields)
            .map(|(value, field)| {
                value
                    .or_else(|| field.default.clone())
                    .unwrap_or(Value::None)
            })
            .collect();
        Ok(Record {
            model: Arc::clone(self),
            id,
            values,
        })
    }

    /// Rebuild a record from a row selected with [`ModelDef::select_sql`].
    pub(crate) fn from_row(self: &Arc<Self>, row: &[SqlValue]) -> Record {
        let id = match row.first() {
            Some(SqlValue::Integer(id)) => Some(*id),
            _ => None,
        };
        let values = self
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| {
                row.get(index + 1)
                    .map_or(Value::None, |raw| Value::from_sql(raw, Some(field.ty)))
            })
            .collect();
        Record {
            model: Arc::clone(self),
            id,
            values,
        }
    }
}

impl SchemaDescribable for ModelDef {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> Option<String> {
        self.group.read().clone()
    }

    fn assign_group(&self, group: &str) {
        let mut current = self.group.write();
        if current.is_none() {
            *current = Some(group.to_string());
        }
    }

    fn fields(&self) -> &[FieldDef] {
        &self.fields
    }
}

/// One row of a model, saved or not.
#[derive(Debug)]
pub struct Record {
    pub model: Arc<ModelDef>,
    pub id: Option<i64>,
    /// Field values in declaration order.
    pub values: Vec<Value>,
}

impl Record {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        if name == "id" || name == "pk" {
            return Some(self.id.map_or(Value::None, Value::Int));
        }
        self.model
            .field_index(name)
            .map(|index| self.values[index].clone())
    }

    /// Assign a field value.
    ///
    /// # Errors
    /// Returns an error when the model has no such field.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), ScriptError> {
        if name == "id" || name == "pk" {
            self.id = match value {
                Value::Int(raw) => Some(raw),
                _ => None,
            };
            return Ok(());
        }
        let index = self.model.field_index(name).ok_or_else(|| {
            ScriptError::new(format!("{} has no field '{name}'", self.model.name()))
        })?;
        self.values[index] = value;
        Ok(())
    }

    pub(crate) fn params(&self) -> Result<Vec<SqlValue>, ScriptError> {
        self.values.iter().map(Value::to_sql).collect()
    }

    #[must_use]
    pub fn repr(&self) -> String {
        match self.id {
            Some(id) => format!("<{}: {id}>", self.model.name()),
            None => format!("<{}: unsaved>", self.model.name()),
        }
    }
}
