use ormscope_domain::{CallTag, CapturedCall};
use ormscope_host::{as_schema_describable, CallFrame, ScriptError, UnitKind, Value};
use ormscope_runtime::RuntimeInstance;
use serde::{Deserialize, Serialize};

use crate::config::PlaygroundConfig;
use crate::interception::{ActiveScript, InterceptorRegistry};

/// Bootstrap binding that overrides the configured default group.
pub const DEFAULT_GROUP_BINDING: &str = "DEFAULT_GROUP";
const PROVISIONING_FRAME: &str = "<provisioning>";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredModel {
    pub name: String,
    pub table: String,
}

/// Result of one script execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOutcome {
    /// Everything the script printed, plus formatted errors and notes.
    pub output: String,
    /// Calls captured while this run was in progress, in execution order.
    pub calls: Vec<CapturedCall>,
    pub discovered_models: Vec<DiscoveredModel>,
    pub entry_invoked: bool,
}

/// Render a script failure the way it is shown to the user.
#[must_use]
pub fn format_script_error(err: &ScriptError) -> String {
    match err.line {
        Some(line) => format!(
            "Traceback (most recent call last):\nError on line {line}: {}\n",
            err.message
        ),
        None => format!(
            "Traceback (most recent call last):\nError: {}\n",
            err.message
        ),
    }
}

pub struct Orchestrator<'a> {
    registry: &'a InterceptorRegistry,
    config: &'a PlaygroundConfig,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(registry: &'a InterceptorRegistry, config: &'a PlaygroundConfig) -> Self {
        Self { registry, config }
    }

    /// Execute a full script against `instance`.
    ///
    /// Script and entry-procedure failures are reported in
    /// [`RunOutcome::output`]; this never fails.
    #[allow(clippy::too_many_lines)]
    pub fn run(&self, source: &str, instance: &RuntimeInstance) -> RunOutcome {
        let mut interpreter = instance.lock();
        let context = self.registry.install(instance.id(), &mut interpreter);
        let first_call = self.registry.ids().peek();

        let mut namespace = interpreter.globals().clone();
        let default_group = match namespace.get(DEFAULT_GROUP_BINDING) {
            Some(Value::Str(group)) if !group.trim().is_empty() => group.clone(),
            _ => self.config.default_group.clone(),
        };
        interpreter.set_default_group(default_group.clone());

        let mut output = String::new();
        interpreter.begin_capture();

        let unit = interpreter.new_unit();
        let script = ActiveScript::new(unit, source);
        {
            let _phase = context.enter(Some(script.clone()), CallTag::Script);
            if let Err(err) = interpreter.eval_source(&mut namespace, source, unit, UnitKind::Script)
            {
                tracing::debug!(line = ?err.line, error = %err.message, "script failed");
                output.push_str(&interpreter.end_capture());
                output.push_str(&format_script_error(&err));
                interpreter.begin_capture();
            }
        }

        let mut discovered_models = Vec::new();
        let mut create_statements = Vec::new();
        for (binding, value) in namespace.iter() {
            let Some(model) = as_schema_describable(value) else {
                continue;
            };
            model.assign_group(&default_group);
            discovered_models.push(DiscoveredModel {
                name: binding.clone(),
                table: model.table_name(&default_group),
            });
            create_statements.push((binding.clone(), model.create_table_sql(&default_group)));
        }

        if !create_statements.is_empty() {
            let internal = interpreter.new_unit();
            let _frame = interpreter.call_stack().enter(CallFrame {
                unit: internal,
                kind: UnitKind::Internal,
                function: PROVISIONING_FRAME.to_string(),
                line: 0,
            });
            let _phase = context.enter(None, CallTag::Provisioning);
            for (model, statement) in &create_statements {
                if let Err(err) = interpreter.cursor_mut().execute(statement, &[]) {
                    tracing::debug!(model = %model, error = %err, "table provisioning skipped");
                }
            }
        }

        let entry_name = self.config.entry_procedure.as_str();
        let mut entry_invoked = false;
        match namespace.get(entry_name).cloned() {
            Some(entry @ Value::Function(_)) if is_zero_arg(&entry) => {
                let _phase = context.enter(Some(script), CallTag::EntryProcedure);
                entry_invoked = true;
                if let Err(err) = interpreter.call(&mut namespace, &entry, Vec::new()) {
                    tracing::debug!(line = ?err.line, error = %err.message, "entry procedure failed");
                    output.push_str(&interpreter.end_capture());
                    output.push_str(&format_script_error(&err));
                    interpreter.begin_capture();
                }
            }
            Some(other) => {
                output.push_str(&interpreter.end_capture());
                output.push_str(&format!(
                    "Note: '{entry_name}' is bound to a {} that is not a zero-argument function; it was not invoked.\n",
                    other.type_name()
                ));
                interpreter.begin_capture();
            }
            None => {}
        }

        let persistent = interpreter.globals_mut();
        for (name, value) in namespace.iter() {
            if !name.starts_with("__") {
                persistent.set(name.clone(), value.clone());
            }
        }

        output.push_str(&interpreter.end_capture());
        let end_call = self.registry.ids().peek();
        drop(interpreter);

        let calls = self
            .registry
            .bus()
            .since(first_call)
            .into_iter()
            .filter(|call| call.id < end_call && call.instance_id == instance.id())
            .collect();

        RunOutcome {
            output,
            calls,
            discovered_models,
            entry_invoked,
        }
    }
}

fn is_zero_arg(value: &Value) -> bool {
    matches!(value, Value::Function(function) if function.arity() == 0)
}

#[cfg(test)]
mod tests {
    use super::format_script_error;
    use ormscope_host::ScriptError;

    #[test]
    fn script_errors_render_with_their_line() {
        assert_eq!(
            format_script_error(&ScriptError::at(4, "boom")),
            "Traceback (most recent call last):\nError on line 4: boom\n"
        );
        assert_eq!(
            format_script_error(&ScriptError::new("boom")),
            "Traceback (most recent call last):\nError: boom\n"
        );
    }
}
