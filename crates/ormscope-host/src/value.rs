use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cursor::SqlValue;
use crate::error::ScriptError;
use crate::model::{FieldType, ModelDef, Record};
use crate::stack::{UnitId, UnitKind};
use crate::syntax::FunctionDecl;

pub type RecordRef = Arc<Mutex<Record>>;

/// Signature of functions provided by the interpreter or installed packages.
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

/// A user function together with the unit it was defined in.
#[derive(Debug)]
pub struct Function {
    pub(crate) decl: Arc<FunctionDecl>,
    pub unit: UnitId,
    pub kind: UnitKind,
}

impl Function {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.decl.params.len()
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Function(Arc<Function>),
    Native(NativeFunction),
    Model(Arc<ModelDef>),
    Manager(Arc<ModelDef>),
    Record(RecordRef),
    /// The `db` handle: the interpreter's data-access entry point.
    Cursor,
    Method(Box<Value>, String),
}

impl Value {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Function(_) => "function",
            Self::Native(_) => "builtin_function",
            Self::Model(_) => "model",
            Self::Manager(_) => "manager",
            Self::Record(_) => "record",
            Self::Cursor => "cursor",
            Self::Method(_, _) => "method",
        }
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(value) => *value,
            Self::Int(value) => *value != 0,
            Self::Float(value) => *value != 0.0,
            Self::Str(value) => !value.is_empty(),
            Self::List(items) => !items.is_empty(),
            _ => true,
        }
    }

    #[must_use]
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Self::Function(_) | Self::Native(_) | Self::Model(_) | Self::Method(_, _)
        )
    }

    /// Text produced by `print` and `str()`.
    #[must_use]
    pub fn display(&self) -> String {
        match self {
            Self::Str(value) => value.clone(),
            other => other.repr(),
        }
    }

    /// Text produced by `repr()` and by the interactive session.
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Self::None => "None".to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => format_float(*value),
            Self::Str(value) => format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'")),
            Self::List(items) => format!(
                "[{}]",
                items.iter().map(Self::repr).collect::<Vec<_>>().join(", ")
            ),
            Self::Function(function) => format!("<function {}>", function.name()),
            Self::Native(native) => format!("<builtin {}>", native.name),
            Self::Model(model) => format!("<model {}>", model.name()),
            Self::Manager(model) => format!("<manager {}.objects>", model.name()),
            Self::Record(record) => record.lock().repr(),
            Self::Cursor => "<cursor db>".to_string(),
            Self::Method(receiver, name) => format!("<method {name} of {}>", receiver.type_name()),
        }
    }

    /// Convert to a bound SQL parameter.
    ///
    /// # Errors
    /// Returns an error for values that have no SQL representation.
    pub fn to_sql(&self) -> Result<SqlValue, ScriptError> {
        match self {
            Self::None => Ok(SqlValue::Null),
            Self::Bool(value) => Ok(SqlValue::Integer(i64::from(*value))),
            Self::Int(value) => Ok(SqlValue::Integer(*value)),
            Self::Float(value) => Ok(SqlValue::Real(*value)),
            Self::Str(value) => Ok(SqlValue::Text(value.clone())),
            Self::Record(record) => record
                .lock()
                .id
                .map(SqlValue::Integer)
                .ok_or_else(|| ScriptError::new("unsaved record cannot be used as a parameter")),
            other => Err(ScriptError::new(format!(
                "{} cannot be used as a SQL parameter",
                other.type_name()
            ))),
        }
    }

    /// Convert a column value, using the declared field type when known.
    #[must_use]
    pub fn from_sql(value: &SqlValue, ty: Option<FieldType>) -> Self {
        match (value, ty) {
            (SqlValue::Null, _) => Self::None,
            (SqlValue::Integer(raw), Some(FieldType::Bool)) => Self::Bool(*raw != 0),
            (SqlValue::Integer(raw), Some(FieldType::Real)) => {
                #[allow(clippy::cast_precision_loss)]
                let value = *raw as f64;
                Self::Float(value)
            }
            (SqlValue::Integer(raw), _) => Self::Int(*raw),
            (SqlValue::Real(raw), _) => Self::Float(*raw),
            (SqlValue::Text(raw), _) => Self::Str(raw.clone()),
        }
    }
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Structural equality as used by `==` in scripts.
#[must_use]
pub fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        #[allow(clippy::cast_precision_loss)]
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Model(a), Value::Model(b)) | (Value::Manager(a), Value::Manager(b)) => {
            Arc::ptr_eq(a, b)
        }
        (Value::Record(a), Value::Record(b)) => {
            if Arc::ptr_eq(a, b) {
                return true;
            }
            let (a, b) = (a.lock(), b.lock());
            a.id.is_some() && a.id == b.id && a.model.name() == b.model.name()
        }
        (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
        (Value::Cursor, Value::Cursor) => true,
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

/// Mutable name -> value bindings of one scope.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    bindings: BTreeMap<String, Value>,
}

impl Namespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.bindings.remove(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.bindings.iter()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}
