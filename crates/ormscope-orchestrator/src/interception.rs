//! Recording wrapper around an instance's data-access cursor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use ormscope_domain::{
    classify_statement, now_utc, CallIdSequence, CallTag, CapturedCall, InstanceId,
};
use ormscope_host::{CallStack, Cursor, CursorError, Interpreter, QueryResult, SqlValue, UnitId};
use ormscope_trace_core::{TraceBus, TraceSink};
use parking_lot::Mutex;
use serde_json::Value;

use crate::attribution::resolve;

/// The script currently being executed, for attribution.
#[derive(Debug, Clone)]
pub struct ActiveScript {
    pub unit: UnitId,
    pub lines: Arc<[String]>,
}

impl ActiveScript {
    #[must_use]
    pub fn new(unit: UnitId, source: &str) -> Self {
        Self {
            unit,
            lines: source.lines().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Phase {
    script: Option<ActiveScript>,
    tag: Option<CallTag>,
}

/// Shared state telling an [`InterceptingCursor`] what is running.
#[derive(Debug, Clone, Default)]
pub struct InterceptionContext {
    phase: Arc<Mutex<Phase>>,
}

impl InterceptionContext {
    /// Mark `script` (if any) as active and label calls with `tag` until the
    /// guard drops. The previous phase is restored afterwards.
    #[must_use]
    pub fn enter(&self, script: Option<ActiveScript>, tag: CallTag) -> PhaseGuard {
        let previous = std::mem::replace(
            &mut *self.phase.lock(),
            Phase {
                script,
                tag: Some(tag),
            },
        );
        PhaseGuard {
            context: self.clone(),
            previous: Some(previous),
        }
    }

    #[must_use]
    pub fn tag(&self) -> Option<CallTag> {
        self.phase.lock().tag
    }

    #[must_use]
    pub fn active_unit(&self) -> Option<UnitId> {
        self.phase.lock().script.as_ref().map(|script| script.unit)
    }

    fn snapshot(&self) -> Phase {
        self.phase.lock().clone()
    }
}

#[derive(Debug)]
pub struct PhaseGuard {
    context: InterceptionContext,
    previous: Option<Phase>,
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.context.phase.lock() = previous;
        }
    }
}

/// A [`Cursor`] that records every call on a [`TraceSink`].
///
/// Results and errors of the wrapped cursor are returned unchanged.
pub struct InterceptingCursor {
    inner: Box<dyn Cursor>,
    instance_id: InstanceId,
    stack: CallStack,
    context: InterceptionContext,
    sink: Arc<dyn TraceSink>,
    ids: Arc<CallIdSequence>,
}

impl std::fmt::Debug for InterceptingCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptingCursor")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl InterceptingCursor {
    #[must_use]
    pub fn new(
        inner: Box<dyn Cursor>,
        instance_id: InstanceId,
        stack: CallStack,
        context: InterceptionContext,
        sink: Arc<dyn TraceSink>,
        ids: Arc<CallIdSequence>,
    ) -> Self {
        Self {
            inner,
            instance_id,
            stack,
            context,
            sink,
            ids,
        }
    }

    fn record(
        &self,
        statement: &str,
        parameters: Vec<Value>,
        many: bool,
        started: Instant,
        phase: &Phase,
        outcome: Result<&QueryResult, &CursorError>,
    ) {
        let elapsed = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let attribution = phase
            .script
            .as_ref()
            .map(|script| resolve(&self.stack.snapshot(), script.unit, &script.lines[..]))
            .unwrap_or_default();
        let error = outcome.err().map(ToString::to_string);
        if let Some(error) = &error {
            tracing::debug!(statement, error = %error, "intercepted call failed");
        }

        self.sink.append(CapturedCall {
            id: self.ids.next_id(),
            instance_id: self.instance_id,
            statement: statement.to_string(),
            parameters,
            many,
            execution_time_micros: elapsed,
            kind: classify_statement(statement),
            source_line: attribution.line,
            source_context: attribution.context,
            tag: phase.tag,
            succeeded: error.is_none(),
            error,
            timestamp: now_utc(),
        });
    }
}

impl Cursor for InterceptingCursor {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, CursorError> {
        let phase = self.context.snapshot();
        let started = Instant::now();
        let result = self.inner.execute(sql, params);
        self.record(
            sql,
            params.iter().map(SqlValue::to_json).collect(),
            false,
            started,
            &phase,
            result.as_ref(),
        );
        result
    }

    fn execute_many(
        &mut self,
        sql: &str,
        param_sets: &[Vec<SqlValue>],
    ) -> Result<QueryResult, CursorError> {
        let phase = self.context.snapshot();
        let started = Instant::now();
        let result = self.inner.execute_many(sql, param_sets);
        let parameters = param_sets
            .iter()
            .map(|set| Value::Array(set.iter().map(SqlValue::to_json).collect()))
            .collect();
        self.record(sql, parameters, true, started, &phase, result.as_ref());
        result
    }

    fn is_intercepted(&self) -> bool {
        true
    }
}

/// Tracks which instances already have their cursor wrapped.
///
/// Installing twice for the same instance hands back the existing context
/// instead of wrapping again.
#[derive(Debug)]
pub struct InterceptorRegistry {
    bus: Arc<TraceBus>,
    ids: Arc<CallIdSequence>,
    installed: Mutex<BTreeMap<InstanceId, InterceptionContext>>,
}

impl InterceptorRegistry {
    #[must_use]
    pub fn new(bus: Arc<TraceBus>, ids: Arc<CallIdSequence>) -> Self {
        Self {
            bus,
            ids,
            installed: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<TraceBus> {
        &self.bus
    }

    #[must_use]
    pub fn ids(&self) -> &Arc<CallIdSequence> {
        &self.ids
    }

    /// Wrap the interpreter's cursor for `instance_id` unless already done.
    pub fn install(
        &self,
        instance_id: InstanceId,
        interpreter: &mut Interpreter,
    ) -> InterceptionContext {
        let mut installed = self.installed.lock();
        if let Some(context) = installed.get(&instance_id) {
            return context.clone();
        }

        let context = InterceptionContext::default();
        let stack = interpreter.call_stack();
        let sink: Arc<dyn TraceSink> = Arc::clone(&self.bus) as Arc<dyn TraceSink>;
        let ids = Arc::clone(&self.ids);
        let wrap_context = context.clone();
        let wrapped = interpreter.wrap_cursor(move |inner| -> Box<dyn Cursor> {
            Box::new(InterceptingCursor::new(
                inner,
                instance_id,
                stack,
                wrap_context,
                sink,
                ids,
            ))
        });
        if wrapped {
            tracing::debug!(instance_id = %instance_id, "interception installed");
        } else {
            tracing::warn!(
                instance_id = %instance_id,
                "cursor already intercepted by another registry"
            );
        }
        installed.insert(instance_id, context.clone());
        context
    }

    #[must_use]
    pub fn is_installed(&self, instance_id: InstanceId) -> bool {
        self.installed.lock().contains_key(&instance_id)
    }

    /// Forget every instance except `keep`.
    pub fn retain_only(&self, keep: InstanceId) {
        self.installed.lock().retain(|id, _| *id == keep);
    }
}
