#![forbid(unsafe_code)]
//! Host interpreter boundary for ormscope.
//!
//! Everything the orchestration layer needs from a running program lives
//! here: evaluation of modelscript units, namespaces, the live call stack,
//! redirectable output, model schemas, and the [`Cursor`] every data access
//! funnels through.

mod cursor;
mod error;
mod interpreter;
mod model;
mod output;
mod packages;
mod stack;
mod syntax;
mod value;

pub use cursor::{Cursor, QueryResult, SqlValue, SqliteCursor};
pub use error::{CursorError, HostError, ScriptError};
pub use interpreter::{Interpreter, FALLBACK_GROUP, MODULE_FUNCTION};
pub use model::{
    as_schema_describable, quote_ident, FieldDef, FieldType, ModelDef, Record, SchemaDescribable,
};
pub use output::OutputCapture;
pub use packages::{
    parse_requirements, BuiltinPackages, PackageInstaller, Requirement, VersionOp,
};
pub use stack::{CallFrame, CallStack, FrameGuard, UnitId, UnitKind};
pub use value::{values_equal, Function, Namespace, NativeFn, NativeFunction, RecordRef, Value};
