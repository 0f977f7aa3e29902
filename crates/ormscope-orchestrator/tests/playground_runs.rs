use std::sync::Arc;

use ormscope_domain::{CallTag, CapturedCall, StatementKind};
use ormscope_orchestrator::{Playground, PlaygroundConfig, PlaygroundError, RunOutcome};
use ormscope_runtime::RuntimeError;
use ormscope_trace_core::TraceListener;
use parking_lot::Mutex;

const PERSON_WITH_ENTRY: &str = "\
model Person:
    name: text

def run():
    Person.objects.create(name=\"Ada\")
";

fn run(playground: &Playground, source: &str) -> RunOutcome {
    playground
        .run(source)
        .unwrap_or_else(|err| panic!("run failed: {err}"))
}

fn config_with_bootstrap(bootstrap: &str) -> PlaygroundConfig {
    PlaygroundConfig {
        bootstrap: bootstrap.to_string(),
        ..PlaygroundConfig::default()
    }
}

#[test]
fn script_without_data_access_captures_nothing() {
    let playground = Playground::default();
    let outcome = run(&playground, "x = 2\nprint(\"hello\", x * 3)\n");
    assert_eq!(outcome.output, "hello 6\n");
    assert!(outcome.calls.is_empty());
    assert!(outcome.discovered_models.is_empty());
    assert!(!outcome.entry_invoked);
}

#[test]
fn unchanged_configuration_reuses_one_instance() {
    let playground = Playground::new(config_with_bootstrap("GREETING = \"hi\"\n"));
    run(&playground, "print(GREETING)\n");
    let first = playground.instance();
    assert!(first.is_ok());
    let second = playground.run("print(GREETING)\n");
    assert!(second.is_ok());
    assert_eq!(second.unwrap_or_else(|_| unreachable!()).output, "hi\n");
    assert_eq!(playground.manager().builds(), 1);

    let again = playground.instance();
    assert!(again.is_ok());
    assert!(Arc::ptr_eq(
        &first.unwrap_or_else(|_| unreachable!()),
        &again.unwrap_or_else(|_| unreachable!())
    ));
}

#[test]
fn changing_bootstrap_discards_bindings() {
    let playground = Playground::default();
    run(&playground, "x = 41\n");
    let seen = playground.execute_interactive("x + 1");
    assert!(seen.is_ok());
    assert_eq!(
        seen.unwrap_or_else(|_| unreachable!()).value.as_deref(),
        Some("42")
    );

    playground.set_bootstrap("y = 1\n");
    let gone = playground.execute_interactive("x");
    assert!(gone.is_ok());
    let gone = gone.unwrap_or_else(|_| unreachable!());
    assert!(!gone.success);
    assert!(gone
        .error
        .as_deref()
        .is_some_and(|error| error.contains("name 'x' is not defined")));
    assert_eq!(playground.manager().builds(), 2);
}

#[test]
fn rerunning_a_model_script_is_idempotent() {
    let playground = Playground::default();
    let first = run(&playground, PERSON_WITH_ENTRY);
    assert_eq!(first.output, "");
    assert!(first.entry_invoked);
    assert_eq!(first.discovered_models.len(), 1);
    assert_eq!(first.discovered_models[0].table, "sandbox_person");

    let tags: Vec<Option<CallTag>> = first.calls.iter().map(|call| call.tag).collect();
    assert_eq!(
        tags,
        vec![Some(CallTag::Provisioning), Some(CallTag::EntryProcedure)]
    );
    assert_eq!(first.calls[0].kind, StatementKind::Ddl);
    assert!(first.calls[0].source_line.is_none());
    assert_eq!(first.calls[1].kind, StatementKind::Dml);
    assert_eq!(first.calls[1].source_line, Some(5));

    let second = run(&playground, PERSON_WITH_ENTRY);
    assert_eq!(second.output, "");
    let count = playground.table_count("sandbox_person");
    assert!(count.is_ok());
    assert_eq!(count.unwrap_or_else(|_| unreachable!()), 2);
}

#[test]
fn top_level_calls_point_at_their_script_line() {
    let playground = Playground::default();
    run(&playground, "model Person:\n    name: text\n");
    let outcome = run(
        &playground,
        "x = 1\ny = 2\nPerson.objects.create(name=\"Ada\")\n",
    );
    let insert: Vec<&CapturedCall> = outcome
        .calls
        .iter()
        .filter(|call| call.tag == Some(CallTag::Script))
        .collect();
    assert_eq!(insert.len(), 1);
    assert_eq!(insert[0].source_line, Some(3));
    assert_eq!(
        insert[0].source_context.as_deref(),
        Some("Person.objects.create(name=\"Ada\")")
    );
    assert!(insert[0].succeeded);
}

#[test]
fn failing_call_is_recorded_once_and_reported() {
    let playground = Playground::default();
    let outcome = run(&playground, "db.execute(\"SELECT * FROM missing_table\")\n");
    assert_eq!(outcome.calls.len(), 1);
    let call = &outcome.calls[0];
    assert!(!call.succeeded);
    assert!(call
        .error
        .as_deref()
        .is_some_and(|error| error.contains("no such table")));
    assert!(outcome.output.starts_with("Traceback (most recent call last):\n"));
    assert!(outcome.output.contains("Error on line 1: "));
    assert!(outcome.output.contains("no such table"));
}

#[test]
fn late_subscribers_only_see_new_calls() {
    let playground = Playground::default();
    run(&playground, "db.execute(\"CREATE TABLE t (v INTEGER)\")\n");
    assert_eq!(playground.trace().len(), 1);
    playground.clear_trace();
    assert!(playground.trace().is_empty());

    let received: Arc<Mutex<Vec<CapturedCall>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let listener: Arc<dyn TraceListener> =
        Arc::new(move |call: &CapturedCall| sink.lock().push(call.clone()));
    let subscription = playground.subscribe(&listener);

    let outcome = run(&playground, "db.execute(\"INSERT INTO t VALUES (?)\", [7])\n");
    assert_eq!(outcome.calls.len(), 1);
    assert_eq!(received.lock().len(), 1);
    assert_eq!(received.lock()[0].parameters, vec![serde_json::json!(7)]);
    assert_eq!(playground.trace().len(), 1);

    assert!(playground.unsubscribe(subscription));
    run(&playground, "db.execute(\"DELETE FROM t\")\n");
    assert_eq!(received.lock().len(), 1);
    assert_eq!(playground.trace().len(), 2);
}

#[test]
fn failing_interactive_call_is_recorded_once() {
    let playground = Playground::default();
    run(&playground, "x = 1\n");
    let seen = playground.trace().len();

    let outcome = playground.execute_interactive("db.execute(\"SELEC 1\")");
    assert!(outcome.is_ok());
    let outcome = outcome.unwrap_or_else(|_| unreachable!());
    assert!(!outcome.success);
    assert_eq!(outcome.value, None);
    assert!(outcome
        .error
        .as_deref()
        .is_some_and(|error| error.contains("syntax error")));

    let calls: Vec<CapturedCall> = playground.trace().into_iter().skip(seen).collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tag, Some(CallTag::Interactive));
    assert!(!calls[0].succeeded);
    assert!(calls[0].error.is_some());
}

#[test]
fn listener_can_read_the_trace_while_notified() {
    let playground: Arc<Playground> = Arc::new(Playground::default());
    let lengths: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lengths);
    let observed = Arc::clone(&playground);
    let listener: Arc<dyn TraceListener> = Arc::new(move |_: &CapturedCall| {
        sink.lock().push(observed.trace().len());
    });
    playground.subscribe(&listener);

    run(&playground, "db.execute(\"SELECT 1\")\ndb.execute(\"SELECT 2\")\n");
    assert_eq!(*lengths.lock(), vec![1, 2]);
}

#[test]
fn runaway_scripts_fail_with_a_script_error() {
    let playground = Playground::default();
    let nested = format!("x = {}1{}\n", "(".repeat(5000), ")".repeat(5000));
    let outcome = run(&playground, &nested);
    assert!(outcome.output.contains("expression too deeply nested"));

    let repeated = run(&playground, "s = \"ab\" * 9223372036854775807\n");
    assert!(repeated.output.contains("repeated string is too large"));

    let counted = run(&playground, "print(len(range(9223372036854775800, 9223372036854775807, 5)))\n");
    assert_eq!(counted.output, "2\n");
}

#[test]
fn interactive_statements_see_run_bindings() {
    let playground = Playground::default();
    let outcome = run(&playground, PERSON_WITH_ENTRY);
    let last_run_call = outcome.calls.iter().map(|call| call.id).max();
    assert!(last_run_call.is_some());

    let counted = playground.execute_interactive("Person.objects.count()");
    assert!(counted.is_ok());
    let counted = counted.unwrap_or_else(|_| unreachable!());
    assert!(counted.success);
    assert_eq!(counted.value.as_deref(), Some("1"));

    let trace = playground.trace();
    let interactive = trace.last();
    assert!(interactive.is_some());
    let interactive = interactive.unwrap_or_else(|| unreachable!());
    assert_eq!(interactive.tag, Some(CallTag::Interactive));
    assert!(Some(interactive.id) > last_run_call);

    let printed = playground.execute_interactive("print(\"ok\")");
    assert!(printed.is_ok());
    let printed = printed.unwrap_or_else(|_| unreachable!());
    assert_eq!(printed.output, "ok\n");
    assert_eq!(printed.value, None);
}

#[test]
fn bootstrap_default_group_names_tables() {
    let playground = Playground::new(config_with_bootstrap("DEFAULT_GROUP = \"shop\"\n"));
    let outcome = run(&playground, PERSON_WITH_ENTRY);
    assert_eq!(outcome.discovered_models[0].table, "shop_person");

    let tables = playground.list_tables();
    assert!(tables.is_ok());
    assert_eq!(
        tables.unwrap_or_else(|_| unreachable!()),
        vec!["shop_person".to_string()]
    );
}

#[test]
fn non_callable_entry_binding_is_noted() {
    let playground = Playground::default();
    let outcome = run(&playground, "run = 5\n");
    assert!(!outcome.entry_invoked);
    assert!(outcome.output.contains("Note: 'run' is bound to a int"));

    let with_args = run(&playground, "def run(n):\n    print(n)\n");
    assert!(!with_args.entry_invoked);
    assert!(with_args.output.contains("Note: 'run'"));
}

#[test]
fn failing_bootstrap_leaves_no_instance() {
    let playground = Playground::default();
    playground.set_bootstrap("undefined_name + 1\n");
    let outcome = playground.run("print(1)\n");
    assert!(matches!(
        outcome,
        Err(PlaygroundError::Runtime(RuntimeError::Configuration {
            phase: "evaluating bootstrap",
            ..
        }))
    ));
    assert!(playground.manager().current().is_none());

    playground.set_bootstrap("");
    assert!(playground.run("print(1)\n").is_ok());
}

#[test]
fn unknown_dependency_fails_configuration() {
    let playground = Playground::default();
    playground.set_dependencies("does-not-exist==1.0\n");
    let outcome = playground.run("print(1)\n");
    assert!(matches!(
        outcome,
        Err(PlaygroundError::Runtime(RuntimeError::Configuration {
            phase: "installing dependencies",
            ..
        }))
    ));

    playground.set_dependencies("text>=1.0\n");
    let outcome = run(&playground, "print(upper(\"ada\"))\n");
    assert_eq!(outcome.output, "ADA\n");
}

#[test]
fn introspection_browses_provisioned_tables() {
    let playground = Playground::default();
    run(&playground, PERSON_WITH_ENTRY);

    let schema = playground.table_schema("sandbox_person");
    assert!(schema.is_ok());
    let schema = schema.unwrap_or_else(|_| unreachable!());
    let names: Vec<&str> = schema.iter().map(|column| column.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name"]);
    assert!(schema[0].primary_key);
    assert!(!schema[1].nullable);

    let rows = playground.table_rows("sandbox_person", None);
    assert!(rows.is_ok());
    let rows = rows.unwrap_or_else(|_| unreachable!());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&serde_json::json!("Ada")));

    let query = playground.execute_query("SELECT name FROM sandbox_person");
    assert!(query.is_ok());
    let query = query.unwrap_or_else(|_| unreachable!());
    assert!(query.success);
    assert_eq!(query.rows, vec![vec![serde_json::json!("Ada")]]);

    let broken = playground.execute_query("SELEC 1");
    assert!(broken.is_ok());
    assert!(!broken.unwrap_or_else(|_| unreachable!()).success);

    assert!(playground
        .trace()
        .iter()
        .any(|call| call.tag == Some(CallTag::Introspection)));

    let dropped = playground.reset_database();
    assert!(dropped.is_ok());
    assert_eq!(
        dropped.unwrap_or_else(|_| unreachable!()),
        vec!["sandbox_person".to_string()]
    );
    let tables = playground.list_tables();
    assert!(tables.is_ok());
    assert!(tables.unwrap_or_else(|_| unreachable!()).is_empty());
    assert!(playground.table_schema("sandbox_person").is_err());
}
