use ormscope_domain::CallTag;
use ormscope_host::{UnitKind, Value};
use ormscope_runtime::RuntimeInstance;
use serde::{Deserialize, Serialize};

use crate::interception::InterceptorRegistry;
use crate::orchestrator::format_script_error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractiveOutcome {
    pub success: bool,
    pub output: String,
    /// Display form of the statement's value, when it produced one other
    /// than `None`.
    pub value: Option<String>,
    pub error: Option<String>,
}

/// Ad hoc statements against an instance's persistent namespace.
pub struct SessionBridge<'a> {
    registry: &'a InterceptorRegistry,
}

impl<'a> SessionBridge<'a> {
    #[must_use]
    pub fn new(registry: &'a InterceptorRegistry) -> Self {
        Self { registry }
    }

    /// Evaluate `statement` so later statements see its bindings.
    ///
    /// Failures are reported in the outcome, never returned.
    pub fn execute(&self, statement: &str, instance: &RuntimeInstance) -> InteractiveOutcome {
        let mut interpreter = instance.lock();
        let context = self.registry.install(instance.id(), &mut interpreter);
        let unit = interpreter.new_unit();

        let _phase = context.enter(None, CallTag::Interactive);
        interpreter.begin_capture();
        let result = interpreter.eval_in_globals(statement, unit, UnitKind::Interactive);
        let output = interpreter.end_capture();

        match result {
            Ok(value) => InteractiveOutcome {
                success: true,
                output,
                value: value
                    .filter(|value| !matches!(value, Value::None))
                    .map(|value| value.repr()),
                error: None,
            },
            Err(err) => InteractiveOutcome {
                success: false,
                output,
                value: None,
                error: Some(format_script_error(&err)),
            },
        }
    }
}
