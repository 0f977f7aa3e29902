//! Tree-walking evaluator for modelscript.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cursor::{Cursor, DetachedCursor, QueryResult, SqlValue};
use crate::error::ScriptError;
use crate::model::{FieldDef, ModelDef, SchemaDescribable};
use crate::output::OutputCapture;
use crate::stack::{CallFrame, CallStack, UnitId, UnitKind};
use crate::syntax::{parse_program, BinOp, Expr, ModelDecl, Statement, StmtKind, Target};
use crate::value::{values_equal, Function, Namespace, NativeFunction, RecordRef, Value};

const MAX_CALL_DEPTH: usize = 64;
const MAX_RANGE_LEN: i64 = 1_000_000;
const MAX_STR_LEN: usize = 16 * 1024 * 1024;
pub const MODULE_FUNCTION: &str = "<module>";
pub const FALLBACK_GROUP: &str = "sandbox";

const MANAGER_METHODS: &[&str] = &[
    "create",
    "all",
    "filter",
    "exclude",
    "get",
    "count",
    "first",
    "delete",
    "bulk_create",
];
const RECORD_METHODS: &[&str] = &["save", "delete"];
const CURSOR_METHODS: &[&str] = &["execute", "executemany"];
const STR_METHODS: &[&str] = &["upper", "lower", "strip", "startswith", "endswith"];

enum Flow {
    Normal,
    Return(Value),
}

struct Scope<'a> {
    globals: &'a mut Namespace,
    locals: Option<Namespace>,
    unit: UnitId,
    kind: UnitKind,
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.locals
            .as_ref()
            .and_then(|locals| locals.get(name))
            .or_else(|| self.globals.get(name))
            .cloned()
    }

    fn store(&mut self, name: &str, value: Value) {
        match self.locals.as_mut() {
            Some(locals) => locals.set(name, value),
            None => self.globals.set(name, value),
        }
    }
}

/// One isolated modelscript interpreter.
///
/// Owns its data-access cursor, the persistent global namespace, the live
/// call stack and the output capture state.
pub struct Interpreter {
    cursor: Box<dyn Cursor>,
    globals: Namespace,
    natives: BTreeMap<String, NativeFunction>,
    stack: CallStack,
    output: OutputCapture,
    next_unit: u64,
    default_group: String,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("globals", &self.globals.names())
            .field("natives", &self.natives.keys().collect::<Vec<_>>())
            .field("default_group", &self.default_group)
            .finish_non_exhaustive()
    }
}

impl Interpreter {
    #[must_use]
    pub fn new(cursor: Box<dyn Cursor>) -> Self {
        let mut interpreter = Self {
            cursor,
            globals: Namespace::new(),
            natives: BTreeMap::new(),
            stack: CallStack::new(),
            output: OutputCapture::default(),
            next_unit: 0,
            default_group: FALLBACK_GROUP.to_string(),
        };
        for native in BUILTINS {
            interpreter.register_native(*native);
        }
        interpreter
    }

    pub fn register_native(&mut self, native: NativeFunction) {
        self.natives.insert(native.name.to_string(), native);
    }

    #[must_use]
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Namespace {
        &mut self.globals
    }

    /// Handle onto the live call stack. Clones observe the same frames.
    #[must_use]
    pub fn call_stack(&self) -> CallStack {
        self.stack.clone()
    }

    #[must_use]
    pub fn new_unit(&mut self) -> UnitId {
        self.next_unit += 1;
        UnitId(self.next_unit)
    }

    #[must_use]
    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    pub fn set_default_group(&mut self, group: impl Into<String>) {
        self.default_group = group.into();
    }

    pub fn begin_capture(&mut self) {
        self.output.begin();
    }

    pub fn end_capture(&mut self) -> String {
        self.output.end()
    }

    pub fn cursor_mut(&mut self) -> &mut dyn Cursor {
        self.cursor.as_mut()
    }

    /// Replace the cursor with a wrapper around it.
    ///
    /// Returns `false` and leaves the cursor untouched when it already
    /// records its calls.
    pub fn wrap_cursor<F>(&mut self, wrap: F) -> bool
    where
        F: FnOnce(Box<dyn Cursor>) -> Box<dyn Cursor>,
    {
        if self.cursor.is_intercepted() {
            return false;
        }
        let inner = std::mem::replace(&mut self.cursor, Box::new(DetachedCursor));
        self.cursor = wrap(inner);
        true
    }

    /// Evaluate a unit of source against `namespace`.
    ///
    /// Returns the value of the final statement when it is an expression.
    ///
    /// # Errors
    /// Returns the first syntax or runtime error, tagged with its line.
    pub fn eval_source(
        &mut self,
        namespace: &mut Namespace,
        source: &str,
        unit: UnitId,
        kind: UnitKind,
    ) -> Result<Option<Value>, ScriptError> {
        let program = parse_program(source)?;
        let _frame = self.stack.enter(CallFrame {
            unit,
            kind,
            function: MODULE_FUNCTION.to_string(),
            line: 0,
        });
        let mut scope = Scope {
            globals: namespace,
            locals: None,
            unit,
            kind,
        };

        let Some((last, leading)) = program.split_last() else {
            return Ok(None);
        };
        for statement in leading {
            if let Flow::Return(_) = self.exec_statement(&mut scope, statement)? {
                return Err(ScriptError::at(statement.line, "'return' outside function"));
            }
        }
        if let StmtKind::Expr(expr) = &last.kind {
            self.stack.set_line(last.line);
            let value = self
                .eval_expr(&mut scope, expr)
                .map_err(|err| err.with_line(last.line))?;
            return Ok(Some(value));
        }
        if let Flow::Return(_) = self.exec_statement(&mut scope, last)? {
            return Err(ScriptError::at(last.line, "'return' outside function"));
        }
        Ok(None)
    }

    /// Evaluate a unit of source against the persistent namespace.
    ///
    /// # Errors
    /// See [`Interpreter::eval_source`].
    pub fn eval_in_globals(
        &mut self,
        source: &str,
        unit: UnitId,
        kind: UnitKind,
    ) -> Result<Option<Value>, ScriptError> {
        let mut namespace = std::mem::take(&mut self.globals);
        let result = self.eval_source(&mut namespace, source, unit, kind);
        self.globals = namespace;
        result
    }

    /// Call a value with positional arguments, resolving names in `namespace`.
    ///
    /// # Errors
    /// Returns whatever the callee raises.
    pub fn call(
        &mut self,
        namespace: &mut Namespace,
        callee: &Value,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        let mut scope = Scope {
            globals: namespace,
            locals: None,
            unit: UnitId(0),
            kind: UnitKind::Internal,
        };
        self.call_value(&mut scope, callee, args, Vec::new())
    }

    fn exec_block(
        &mut self,
        scope: &mut Scope<'_>,
        statements: &[Statement],
    ) -> Result<Flow, ScriptError> {
        for statement in statements {
            if let Flow::Return(value) = self.exec_statement(scope, statement)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_statement(
        &mut self,
        scope: &mut Scope<'_>,
        statement: &Statement,
    ) -> Result<Flow, ScriptError> {
        self.stack.set_line(statement.line);
        self.exec_kind(scope, &statement.kind)
            .map_err(|err| err.with_line(statement.line))
    }

    fn exec_kind(&mut self, scope: &mut Scope<'_>, kind: &StmtKind) -> Result<Flow, ScriptError> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval_expr(scope, expr)?;
            }
            StmtKind::Assign(Target::Name(name), expr) => {
                let value = self.eval_expr(scope, expr)?;
                scope.store(name, value);
            }
            StmtKind::Assign(Target::Attr(object, attr), expr) => {
                let object = self.eval_expr(scope, object)?;
                let value = self.eval_expr(scope, expr)?;
                match object {
                    Value::Record(record) => record.lock().set(attr, value)?,
                    other => {
                        return Err(ScriptError::new(format!(
                            "cannot set attribute '{attr}' on {}",
                            other.type_name()
                        )))
                    }
                }
            }
            StmtKind::Def(decl) => {
                let function = Function {
                    decl: Arc::clone(decl),
                    unit: scope.unit,
                    kind: scope.kind,
                };
                scope.store(&decl.name, Value::Function(Arc::new(function)));
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval_expr(scope, expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.eval_expr(scope, condition)?.is_truthy() {
                        return self.exec_block(scope, body);
                    }
                }
                return self.exec_block(scope, otherwise);
            }
            StmtKind::For { var, iter, body } => {
                let items = match self.eval_expr(scope, iter)? {
                    Value::List(items) => items,
                    Value::Str(text) => text.chars().map(|ch| Value::Str(ch.to_string())).collect(),
                    other => {
                        return Err(ScriptError::new(format!(
                            "'{}' object is not iterable",
                            other.type_name()
                        )))
                    }
                };
                for item in items {
                    scope.store(var, item);
                    if let Flow::Return(value) = self.exec_block(scope, body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            StmtKind::Pass => {}
            StmtKind::Model(decl) => {
                let model = self.define_model(scope, decl)?;
                scope.store(&decl.name, Value::Model(Arc::new(model)));
            }
        }
        Ok(Flow::Normal)
    }

    fn define_model(
        &mut self,
        scope: &mut Scope<'_>,
        decl: &ModelDecl,
    ) -> Result<ModelDef, ScriptError> {
        let mut fields = Vec::with_capacity(decl.fields.len());
        for field in &decl.fields {
            let default = match &field.default {
                Some(expr) => Some(
                    self.eval_expr(scope, expr)
                        .map_err(|err| err.with_line(field.line))?,
                ),
                None => None,
            };
            fields.push(FieldDef {
                name: field.name.clone(),
                ty: field.ty,
                nullable: field.nullable,
                default,
            });
        }
        Ok(ModelDef::new(
            decl.name.clone(),
            decl.group.clone(),
            fields,
            self.default_group.clone(),
        ))
    }

    fn lookup(&self, scope: &Scope<'_>, name: &str) -> Result<Value, ScriptError> {
        if let Some(value) = scope.lookup(name) {
            return Ok(value);
        }
        if name == "db" {
            return Ok(Value::Cursor);
        }
        self.natives
            .get(name)
            .map(|native| Value::Native(*native))
            .ok_or_else(|| ScriptError::new(format!("name '{name}' is not defined")))
    }

    fn eval_expr(&mut self, scope: &mut Scope<'_>, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::Int(value) => Ok(Value::Int(*value)),
            Expr::Float(value) => Ok(Value::Float(*value)),
            Expr::Str(value) => Ok(Value::Str(value.clone())),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::None => Ok(Value::None),
            Expr::Name(name) => self.lookup(scope, name),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(scope, item)?);
                }
                Ok(Value::List(values))
            }
            Expr::Call {
                callee,
                args,
                kwargs,
            } => {
                let callee = self.eval_expr(scope, callee)?;
                let mut positional = Vec::with_capacity(args.len());
                for arg in args {
                    positional.push(self.eval_expr(scope, arg)?);
                }
                let mut keywords = Vec::with_capacity(kwargs.len());
                for (name, arg) in kwargs {
                    keywords.push((name.clone(), self.eval_expr(scope, arg)?));
                }
                self.call_value(scope, &callee, positional, keywords)
            }
            Expr::Attr(object, name) => {
                let object = self.eval_expr(scope, object)?;
                get_attr(object, name)
            }
            Expr::Index(object, index) => {
                let object = self.eval_expr(scope, object)?;
                let index = self.eval_expr(scope, index)?;
                index_value(&object, &index)
            }
            Expr::Neg(inner) => match self.eval_expr(scope, inner)? {
                Value::Int(value) => value
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| ScriptError::new("integer overflow")),
                Value::Float(value) => Ok(Value::Float(-value)),
                other => Err(ScriptError::new(format!(
                    "bad operand type for unary -: '{}'",
                    other.type_name()
                ))),
            },
            Expr::Not(inner) => Ok(Value::Bool(!self.eval_expr(scope, inner)?.is_truthy())),
            Expr::And(lhs, rhs) => {
                let lhs = self.eval_expr(scope, lhs)?;
                if lhs.is_truthy() {
                    self.eval_expr(scope, rhs)
                } else {
                    Ok(lhs)
                }
            }
            Expr::Or(lhs, rhs) => {
                let lhs = self.eval_expr(scope, lhs)?;
                if lhs.is_truthy() {
                    Ok(lhs)
                } else {
                    self.eval_expr(scope, rhs)
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval_expr(scope, lhs)?;
                let rhs = self.eval_expr(scope, rhs)?;
                binary(*op, &lhs, &rhs)
            }
        }
    }

    fn call_value(
        &mut self,
        scope: &mut Scope<'_>,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match callee {
            Value::Function(function) => self.call_function(scope, function, args, kwargs),
            Value::Native(native) if native.name == "print" => {
                self.print(&args, &kwargs)?;
                Ok(Value::None)
            }
            Value::Native(native) => {
                if !kwargs.is_empty() {
                    return Err(ScriptError::new(format!(
                        "{}() takes no keyword arguments",
                        native.name
                    )));
                }
                (native.func)(&args).map_err(ScriptError::new)
            }
            Value::Model(model) => {
                if !args.is_empty() {
                    return Err(ScriptError::new(format!(
                        "{}() takes keyword arguments only",
                        model.name()
                    )));
                }
                let record = model.instantiate(kwargs)?;
                Ok(Value::Record(Arc::new(Mutex::new(record))))
            }
            Value::Method(receiver, name) => self.call_method(receiver, name, args, kwargs),
            other => Err(ScriptError::new(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        scope: &mut Scope<'_>,
        function: &Arc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        let decl = Arc::clone(&function.decl);
        if args.len() > decl.params.len() {
            return Err(ScriptError::new(format!(
                "{}() takes {} arguments but {} were given",
                decl.name,
                decl.params.len(),
                args.len()
            )));
        }
        let mut bound: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        bound.resize(decl.params.len(), None);
        for (name, value) in kwargs {
            let index = decl
                .params
                .iter()
                .position(|param| *param == name)
                .ok_or_else(|| {
                    ScriptError::new(format!(
                        "{}() got an unexpected keyword argument '{name}'",
                        decl.name
                    ))
                })?;
            if bound[index].is_some() {
                return Err(ScriptError::new(format!(
                    "{}() got multiple values for argument '{name}'",
                    decl.name
                )));
            }
            bound[index] = Some(value);
        }

        let mut locals = Namespace::new();
        for (param, value) in decl.params.iter().zip(bound) {
            let value = value.ok_or_else(|| {
                ScriptError::new(format!(
                    "{}() missing required argument '{param}'",
                    decl.name
                ))
            })?;
            locals.set(param.clone(), value);
        }

        if self.stack.depth() >= MAX_CALL_DEPTH {
            return Err(ScriptError::new("maximum recursion depth exceeded"));
        }
        let _frame = self.stack.enter(CallFrame {
            unit: function.unit,
            kind: function.kind,
            function: decl.name.clone(),
            line: 0,
        });
        let mut inner = Scope {
            globals: &mut *scope.globals,
            locals: Some(locals),
            unit: function.unit,
            kind: function.kind,
        };
        match self.exec_block(&mut inner, &decl.body)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::None),
        }
    }

    fn print(&mut self, args: &[Value], kwargs: &[(String, Value)]) -> Result<(), ScriptError> {
        let mut separator = " ".to_string();
        let mut end = "\n".to_string();
        for (name, value) in kwargs {
            let text = match value {
                Value::Str(text) => text.clone(),
                Value::None => continue,
                other => {
                    return Err(ScriptError::new(format!(
                        "{name} must be None or a string, not {}",
                        other.type_name()
                    )))
                }
            };
            match name.as_str() {
                "sep" => separator = text,
                "end" => end = text,
                other => {
                    return Err(ScriptError::new(format!(
                        "print() got an unexpected keyword argument '{other}'"
                    )))
                }
            }
        }
        let mut line = args
            .iter()
            .map(Value::display)
            .collect::<Vec<_>>()
            .join(&separator);
        line.push_str(&end);
        self.output.write(&line);
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, ScriptError> {
        Ok(self.cursor.execute(sql, params)?)
    }

    fn call_method(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match receiver {
            Value::Cursor => self.cursor_method(name, args),
            Value::Manager(model) => {
                if name == "bulk_create" {
                    let [Value::List(records)] = args.as_slice() else {
                        return Err(ScriptError::new("bulk_create() expects a list of records"));
                    };
                    return self.bulk_create(model, records);
                }
                if !args.is_empty() {
                    return Err(ScriptError::new(format!(
                        "{name}() takes keyword arguments only"
                    )));
                }
                self.manager_method(model, name, kwargs)
            }
            Value::Record(record) => match name {
                "save" => {
                    self.save_record(record)?;
                    Ok(Value::None)
                }
                "delete" => self.delete_record(record),
                _ => Err(no_attribute(receiver, name)),
            },
            Value::Str(text) => str_method(text, name, &args),
            _ => Err(no_attribute(receiver, name)),
        }
    }

    fn cursor_method(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        let mut args = args.into_iter();
        let sql = match args.next() {
            Some(Value::Str(sql)) => sql,
            _ => return Err(ScriptError::new(format!("{name}() expects an SQL string"))),
        };
        let params = args.next().unwrap_or(Value::List(Vec::new()));
        if args.next().is_some() {
            return Err(ScriptError::new(format!("{name}() takes at most 2 arguments")));
        }
        let Value::List(params) = params else {
            return Err(ScriptError::new(format!("{name}() parameters must be a list")));
        };

        if name == "executemany" {
            let mut sets = Vec::with_capacity(params.len());
            for set in &params {
                let Value::List(values) = set else {
                    return Err(ScriptError::new(
                        "executemany() parameter sets must be lists",
                    ));
                };
                sets.push(values.iter().map(Value::to_sql).collect::<Result<Vec<_>, _>>()?);
            }
            let result = self.cursor.execute_many(&sql, &sets)?;
            return Ok(Value::Int(count_value(result.rows_affected)));
        }

        let params = params
            .iter()
            .map(Value::to_sql)
            .collect::<Result<Vec<_>, _>>()?;
        let result = self.execute(&sql, &params)?;
        Ok(Value::List(
            result
                .rows
                .iter()
                .map(|row| Value::List(row.iter().map(|raw| Value::from_sql(raw, None)).collect()))
                .collect(),
        ))
    }

    fn select_records(
        &mut self,
        model: &Arc<ModelDef>,
        filters: &[(String, Value)],
        negate: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, ScriptError> {
        let (sql, params) = model.select_sql(filters, negate, limit)?;
        let result = self.execute(&sql, &params)?;
        Ok(result
            .rows
            .iter()
            .map(|row| Value::Record(Arc::new(Mutex::new(model.from_row(row)))))
            .collect())
    }

    fn manager_method(
        &mut self,
        model: &Arc<ModelDef>,
        name: &str,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match name {
            "create" => {
                let record: RecordRef = Arc::new(Mutex::new(model.instantiate(kwargs)?));
                self.save_record(&record)?;
                Ok(Value::Record(record))
            }
            "all" | "filter" => Ok(Value::List(self.select_records(model, &kwargs, false, None)?)),
            "exclude" => Ok(Value::List(self.select_records(model, &kwargs, true, None)?)),
            "first" => Ok(self
                .select_records(model, &kwargs, false, Some(1))?
                .into_iter()
                .next()
                .unwrap_or(Value::None)),
            "get" => {
                let mut found = self.select_records(model, &kwargs, false, Some(2))?;
                match found.len() {
                    1 => Ok(found.remove(0)),
                    0 => Err(ScriptError::new(format!(
                        "{} matching query does not exist",
                        model.name()
                    ))),
                    _ => Err(ScriptError::new(format!(
                        "get() returned more than one {}",
                        model.name()
                    ))),
                }
            }
            "count" => {
                let (sql, params) = model.count_sql(&kwargs)?;
                let result = self.execute(&sql, &params)?;
                match result.rows.first().and_then(|row| row.first()) {
                    Some(SqlValue::Integer(count)) => Ok(Value::Int(*count)),
                    _ => Ok(Value::Int(0)),
                }
            }
            "delete" => {
                let (sql, params) = model.delete_where_sql(&kwargs)?;
                let result = self.execute(&sql, &params)?;
                Ok(Value::Int(count_value(result.rows_affected)))
            }
            _ => Err(ScriptError::new(format!(
                "'manager' object has no attribute '{name}'"
            ))),
        }
    }

    fn bulk_create(
        &mut self,
        model: &Arc<ModelDef>,
        records: &[Value],
    ) -> Result<Value, ScriptError> {
        let mut sets = Vec::with_capacity(records.len());
        for value in records {
            let Value::Record(record) = value else {
                return Err(ScriptError::new(format!(
                    "bulk_create() expects {} records, got {}",
                    model.name(),
                    value.type_name()
                )));
            };
            let record = record.lock();
            if record.model.name() != model.name() {
                return Err(ScriptError::new(format!(
                    "bulk_create() expects {} records, got {}",
                    model.name(),
                    record.model.name()
                )));
            }
            sets.push(record.params()?);
        }
        if !sets.is_empty() {
            self.cursor.execute_many(&model.insert_sql(), &sets)?;
        }
        Ok(Value::List(records.to_vec()))
    }

    fn save_record(&mut self, record: &RecordRef) -> Result<(), ScriptError> {
        let (model, id, mut params) = {
            let record = record.lock();
            (Arc::clone(&record.model), record.id, record.params()?)
        };
        match id {
            None => {
                let result = self.execute(&model.insert_sql(), &params)?;
                record.lock().id = Some(result.last_insert_rowid);
            }
            Some(_) if model.fields().is_empty() => {}
            Some(id) => {
                params.push(SqlValue::Integer(id));
                self.execute(&model.update_sql(), &params)?;
            }
        }
        Ok(())
    }

    fn delete_record(&mut self, record: &RecordRef) -> Result<Value, ScriptError> {
        let (model, id) = {
            let record = record.lock();
            (Arc::clone(&record.model), record.id)
        };
        let Some(id) = id else {
            return Err(ScriptError::new(format!(
                "{} object can't be deleted because its id is None",
                model.name()
            )));
        };
        let result = self.execute(&model.delete_by_id_sql(), &[SqlValue::Integer(id)])?;
        record.lock().id = None;
        Ok(Value::Int(count_value(result.rows_affected)))
    }
}

fn count_value(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn no_attribute(value: &Value, name: &str) -> ScriptError {
    ScriptError::new(format!(
        "'{}' object has no attribute '{name}'",
        value.type_name()
    ))
}

fn get_attr(object: Value, name: &str) -> Result<Value, ScriptError> {
    let is_method = match &object {
        Value::Manager(_) => MANAGER_METHODS.contains(&name),
        Value::Record(_) => RECORD_METHODS.contains(&name),
        Value::Cursor => CURSOR_METHODS.contains(&name),
        Value::Str(_) => STR_METHODS.contains(&name),
        _ => false,
    };
    if is_method {
        return Ok(Value::Method(Box::new(object), name.to_string()));
    }
    match &object {
        Value::Model(model) if name == "objects" => Ok(Value::Manager(Arc::clone(model))),
        Value::Model(model) if name == "table_name" => Ok(Value::Str(model.table())),
        Value::Record(record) => {
            let record = record.lock();
            record.get(name).ok_or_else(|| {
                ScriptError::new(format!(
                    "'{}' object has no attribute '{name}'",
                    record.model.name()
                ))
            })
        }
        _ => Err(no_attribute(&object, name)),
    }
}

fn index_value(object: &Value, index: &Value) -> Result<Value, ScriptError> {
    let Value::Int(raw) = index else {
        return Err(ScriptError::new(format!(
            "indices must be integers, not {}",
            index.type_name()
        )));
    };
    let resolve = |len: usize| -> Result<usize, ScriptError> {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let position = if *raw < 0 { len + raw } else { *raw };
        if (0..len).contains(&position) {
            usize::try_from(position).map_err(|_| ScriptError::new("index out of range"))
        } else {
            Err(ScriptError::new("index out of range"))
        }
    };
    match object {
        Value::List(items) => Ok(items[resolve(items.len())?].clone()),
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            Ok(Value::Str(chars[resolve(chars.len())?].to_string()))
        }
        other => Err(ScriptError::new(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn str_method(text: &str, name: &str, args: &[Value]) -> Result<Value, ScriptError> {
    match (name, args) {
        ("upper", []) => Ok(Value::Str(text.to_uppercase())),
        ("lower", []) => Ok(Value::Str(text.to_lowercase())),
        ("strip", []) => Ok(Value::Str(text.trim().to_string())),
        ("startswith", [Value::Str(prefix)]) => Ok(Value::Bool(text.starts_with(prefix.as_str()))),
        ("endswith", [Value::Str(suffix)]) => Ok(Value::Bool(text.ends_with(suffix.as_str()))),
        _ => Err(ScriptError::new(format!("invalid arguments for str.{name}()"))),
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(raw) => Some(*raw as f64),
        Value::Float(raw) => Some(*raw),
        Value::Bool(raw) => Some(f64::from(u8::from(*raw))),
        _ => None,
    }
}

fn unsupported(op: BinOp, lhs: &Value, rhs: &Value) -> ScriptError {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
    };
    ScriptError::new(format!(
        "unsupported operand types for {symbol}: '{}' and '{}'",
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn overflow() -> ScriptError {
    ScriptError::new("integer overflow")
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, ScriptError> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(values_equal(lhs, rhs))),
        BinOp::Ne => return Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => match (as_float(lhs), as_float(rhs)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => return Err(unsupported(op, lhs, rhs)),
                },
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            return Ok(Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }));
        }
        _ => {}
    }

    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => match op {
            BinOp::Add => a.checked_add(*b).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(*b).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(*b).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if *b == 0 {
                    return Err(ScriptError::new("division by zero"));
                }
                #[allow(clippy::cast_precision_loss)]
                let quotient = *a as f64 / *b as f64;
                Ok(Value::Float(quotient))
            }
            BinOp::Mod => {
                if *b == 0 {
                    return Err(ScriptError::new("modulo by zero"));
                }
                let remainder = a.checked_rem(*b).ok_or_else(overflow)?;
                let adjusted = if remainder != 0 && (remainder < 0) != (*b < 0) {
                    remainder + b
                } else {
                    remainder
                };
                Ok(Value::Int(adjusted))
            }
            _ => Err(unsupported(op, lhs, rhs)),
        },
        (Value::Str(a), Value::Str(b)) if op == BinOp::Add => Ok(Value::Str(format!("{a}{b}"))),
        (Value::Str(text), Value::Int(times)) | (Value::Int(times), Value::Str(text))
            if op == BinOp::Mul =>
        {
            let times = usize::try_from(*times).unwrap_or(0);
            match text.len().checked_mul(times) {
                Some(len) if len <= MAX_STR_LEN => Ok(Value::Str(text.repeat(times))),
                _ => Err(ScriptError::new("repeated string is too large")),
            }
        }
        (Value::List(a), Value::List(b)) if op == BinOp::Add => {
            Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        _ => {
            let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) else {
                return Err(unsupported(op, lhs, rhs));
            };
            match op {
                BinOp::Add => Ok(Value::Float(a + b)),
                BinOp::Sub => Ok(Value::Float(a - b)),
                BinOp::Mul => Ok(Value::Float(a * b)),
                BinOp::Div if b == 0.0 => Err(ScriptError::new("division by zero")),
                BinOp::Div => Ok(Value::Float(a / b)),
                BinOp::Mod if b == 0.0 => Err(ScriptError::new("modulo by zero")),
                BinOp::Mod => Ok(Value::Float(a - b * (a / b).floor())),
                _ => Err(unsupported(op, lhs, rhs)),
            }
        }
    }
}

const BUILTINS: &[NativeFunction] = &[
    NativeFunction {
        name: "print",
        func: builtin_print,
    },
    NativeFunction {
        name: "len",
        func: builtin_len,
    },
    NativeFunction {
        name: "str",
        func: builtin_str,
    },
    NativeFunction {
        name: "int",
        func: builtin_int,
    },
    NativeFunction {
        name: "range",
        func: builtin_range,
    },
    NativeFunction {
        name: "repr",
        func: builtin_repr,
    },
];

// print needs the interpreter's output; calls are routed in `call_value`.
fn builtin_print(_args: &[Value]) -> Result<Value, String> {
    Err("print() is not callable here".to_string())
}

fn builtin_len(args: &[Value]) -> Result<Value, String> {
    let len = match args {
        [Value::Str(text)] => text.chars().count(),
        [Value::List(items)] => items.len(),
        [other] => return Err(format!("object of type '{}' has no len()", other.type_name())),
        _ => return Err("len() takes exactly one argument".to_string()),
    };
    Ok(Value::Int(count_value(len)))
}

fn builtin_str(args: &[Value]) -> Result<Value, String> {
    match args {
        [] => Ok(Value::Str(String::new())),
        [value] => Ok(Value::Str(value.display())),
        _ => Err("str() takes at most one argument".to_string()),
    }
}

fn builtin_repr(args: &[Value]) -> Result<Value, String> {
    match args {
        [value] => Ok(Value::Str(value.repr())),
        _ => Err("repr() takes exactly one argument".to_string()),
    }
}

fn builtin_int(args: &[Value]) -> Result<Value, String> {
    match args {
        [] => Ok(Value::Int(0)),
        [Value::Int(value)] => Ok(Value::Int(*value)),
        [Value::Bool(value)] => Ok(Value::Int(i64::from(*value))),
        [Value::Float(value)] if value.is_finite() => {
            #[allow(clippy::cast_possible_truncation)]
            let truncated = value.trunc() as i64;
            Ok(Value::Int(truncated))
        }
        [Value::Str(text)] => text
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("invalid literal for int(): '{text}'")),
        [other] => Err(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        )),
        _ => Err("int() takes at most one argument".to_string()),
    }
}

fn builtin_range(args: &[Value]) -> Result<Value, String> {
    let bounds: Vec<i64> = args
        .iter()
        .map(|arg| match arg {
            Value::Int(value) => Ok(*value),
            other => Err(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            )),
        })
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err("range() expects 1 to 3 arguments".to_string()),
    };
    if step == 0 {
        return Err("range() arg 3 must not be zero".to_string());
    }
    let span = if step > 0 {
        stop.saturating_sub(start)
    } else {
        start.saturating_sub(stop)
    };
    if span / step.saturating_abs() > MAX_RANGE_LEN {
        return Err("range() is too large".to_string());
    }
    let mut values = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        values.push(Value::Int(current));
        let Some(next) = current.checked_add(step) else {
            break;
        };
        current = next;
    }
    Ok(Value::List(values))
}

#[cfg(test)]
mod tests {
    use super::Interpreter;
    use crate::cursor::SqliteCursor;
    use crate::model::{as_schema_describable, SchemaDescribable};
    use crate::stack::UnitKind;
    use crate::value::{Namespace, Value};

    fn interpreter() -> Interpreter {
        let cursor = SqliteCursor::open_in_memory();
        assert!(cursor.is_ok());
        Interpreter::new(Box::new(cursor.unwrap_or_else(|_| unreachable!())))
    }

    fn eval(interp: &mut Interpreter, namespace: &mut Namespace, source: &str) -> Option<Value> {
        let unit = interp.new_unit();
        let result = interp.eval_source(namespace, source, unit, UnitKind::Script);
        assert!(result.is_ok(), "{result:?}");
        result.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn functions_branches_and_loops_evaluate() {
        let mut interp = interpreter();
        let mut namespace = Namespace::new();
        let value = eval(
            &mut interp,
            &mut namespace,
            "\
def fib(n):
    if n < 2:
        return n
    return fib(n - 1) + fib(n - 2)

total = 0
for i in range(5):
    if i % 2 == 0:
        total = total + i
    elif i == 3:
        pass
    else:
        total = total - 1
fib(10) + total
",
        );
        assert_eq!(value, Some(Value::Int(60)));
        assert!(matches!(namespace.get("total"), Some(Value::Int(5))));
    }

    #[test]
    fn print_writes_into_the_active_capture() {
        let mut interp = interpreter();
        let mut namespace = Namespace::new();
        interp.begin_capture();
        eval(&mut interp, &mut namespace, "print(\"a\", 1, sep=\"-\")\nprint([True, None])\n");
        assert_eq!(interp.end_capture(), "a-1\n[True, None]\n");
    }

    #[test]
    fn errors_report_the_failing_line() {
        let mut interp = interpreter();
        let mut namespace = Namespace::new();
        let unit = interp.new_unit();
        let result = interp.eval_source(
            &mut namespace,
            "x = 1\ndef f():\n    return missing\nf()\n",
            unit,
            UnitKind::Script,
        );
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert_eq!(err.line, Some(3));
        assert_eq!(err.message, "name 'missing' is not defined");
        assert_eq!(interp.call_stack().depth(), 0);
    }

    #[test]
    fn models_persist_records_through_the_cursor() {
        let mut interp = interpreter();
        let mut namespace = Namespace::new();
        eval(
            &mut interp,
            &mut namespace,
            "model Person(group=\"shop\"):\n    name: text\n    age: int? = 7\n",
        );
        let model = namespace.get("Person").cloned();
        assert!(model.is_some());
        let model = model.unwrap_or_else(|| unreachable!());
        let describable = as_schema_describable(&model);
        assert!(describable.is_some());
        let sql = describable
            .unwrap_or_else(|| unreachable!())
            .create_table_sql("sandbox");
        assert!(interp.cursor_mut().execute(&sql, &[]).is_ok());

        interp.begin_capture();
        let value = eval(
            &mut interp,
            &mut namespace,
            "\
Person.objects.create(name=\"Ada\")
p = Person(name=\"Grace\", age=36)
p.save()
p.age = 37
p.save()
Person.objects.bulk_create([Person(name=\"Linus\"), Person(name=\"Ken\")])
older = Person.objects.filter(age=37)
print(older[0].name, Person.objects.get(name=\"Ada\").age)
Person.objects.count()
",
        );
        assert_eq!(interp.end_capture(), "Grace 7\n");
        assert_eq!(value, Some(Value::Int(4)));
    }

    #[test]
    fn get_requires_exactly_one_match() {
        let mut interp = interpreter();
        let mut namespace = Namespace::new();
        eval(&mut interp, &mut namespace, "model Tag:\n    label: text\n");
        let sql = as_schema_describable(namespace.get("Tag").unwrap_or(&Value::None))
            .map(|model| model.create_table_sql("sandbox"));
        assert_eq!(
            sql.as_deref(),
            Some("CREATE TABLE \"sandbox_tag\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \"label\" TEXT NOT NULL)")
        );
        assert!(interp
            .cursor_mut()
            .execute(&sql.unwrap_or_default(), &[])
            .is_ok());

        let unit = interp.new_unit();
        let missing = interp.eval_source(
            &mut namespace,
            "Tag.objects.get(label=\"x\")\n",
            unit,
            UnitKind::Script,
        );
        assert_eq!(
            missing.err().map(|err| err.message),
            Some("Tag matching query does not exist".to_string())
        );
        let value = eval(
            &mut interp,
            &mut namespace,
            "Tag.objects.create(label=\"x\")\nTag.objects.create(label=\"x\")\nTag.objects.count(label=\"x\")\n",
        );
        assert_eq!(value, Some(Value::Int(2)));
    }

    #[test]
    fn db_execute_returns_rows() {
        let mut interp = interpreter();
        let mut namespace = Namespace::new();
        let value = eval(
            &mut interp,
            &mut namespace,
            "db.execute(\"CREATE TABLE t (v INTEGER)\")\ndb.executemany(\"INSERT INTO t VALUES (?)\", [[1], [2]])\ndb.execute(\"SELECT v FROM t WHERE v > ?\", [1])\n",
        );
        assert_eq!(value, Some(Value::List(vec![Value::List(vec![Value::Int(2)])])));
    }

    #[test]
    fn range_stops_before_overflowing() {
        let mut interp = interpreter();
        let mut namespace = Namespace::new();
        let value = eval(
            &mut interp,
            &mut namespace,
            "len(range(9223372036854775800, 9223372036854775807, 5))\n",
        );
        assert_eq!(value, Some(Value::Int(2)));
    }

    #[test]
    fn oversized_string_repetition_is_a_script_error() {
        let mut interp = interpreter();
        let mut namespace = Namespace::new();
        assert_eq!(
            eval(&mut interp, &mut namespace, "\"ab\" * 3\n"),
            Some(Value::Str("ababab".to_string()))
        );

        let unit = interp.new_unit();
        let result = interp.eval_source(
            &mut namespace,
            "x = 1\ns = \"ab\" * 9223372036854775807\n",
            unit,
            UnitKind::Script,
        );
        let err = result.err().unwrap_or_else(|| unreachable!());
        assert_eq!(err.message, "repeated string is too large");
        assert_eq!(err.line, Some(2));
    }

    #[test]
    fn wrap_cursor_replaces_an_unintercepted_cursor() {
        let mut interp = interpreter();
        assert!(!interp.cursor_mut().is_intercepted());
        assert!(interp.wrap_cursor(|inner| inner));
        assert_eq!(interp.default_group(), "sandbox");
    }
}
