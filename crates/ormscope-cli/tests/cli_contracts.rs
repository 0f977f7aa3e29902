use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use serde_json::Value;
use ulid::Ulid;

const PERSON_SCRIPT: &str = "\
model Person:
    name: text

def run():
    Person.objects.create(name=\"Ada\")
    print(\"created\", Person.objects.count())
";

const REPL_INPUT: &str = "\
Person.objects.count()
for i in range(2):
    Person.objects.create(name=str(i))

Person.objects.count()
";

fn temp_path(name: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ormscope-cli-test-{}-{}.{}", name, Ulid::new(), ext))
}

fn write_temp(name: &str, ext: &str, body: &str) -> PathBuf {
    let path = temp_path(name, ext);
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
    path
}

fn ormscope(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ormscope"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to spawn ormscope: {err}"))
}

fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "ormscope failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn json_lines(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .filter(|line| line.starts_with('{'))
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|err| panic!("invalid JSON line {line}: {err}"))
        })
        .collect()
}

#[test]
fn run_prints_output_then_captured_calls() {
    let script = write_temp("run", "ms", PERSON_SCRIPT);
    let stdout = stdout_of(&ormscope(&["run", "--script", script.to_string_lossy().as_ref()]));

    assert!(stdout.starts_with("created 1\n"));
    let calls = json_lines(&stdout);
    let tags: Vec<&str> = calls
        .iter()
        .filter_map(|call| call.get("tag").and_then(Value::as_str))
        .collect();
    assert_eq!(tags, vec!["provisioning", "entry_procedure", "entry_procedure"]);
    assert_eq!(calls[1]["source_line"], Value::from(5));
    assert_eq!(calls[1]["kind"], Value::from("DML"));
    assert!(calls.iter().all(|call| call["succeeded"] == Value::Bool(true)));
}

#[test]
fn run_json_emits_a_single_outcome_document() {
    let script = write_temp("run-json", "ms", PERSON_SCRIPT);
    let config = write_temp("run-json", "yaml", "default_group: shop\nrow_limit: 5\n");
    let stdout = stdout_of(&ormscope(&[
        "run",
        "--script",
        script.to_string_lossy().as_ref(),
        "--config",
        config.to_string_lossy().as_ref(),
        "--json",
    ]));

    let outcome: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("invalid outcome JSON: {err}"));
    assert_eq!(outcome["entry_invoked"], Value::Bool(true));
    assert_eq!(outcome["discovered_models"][0]["table"], Value::from("shop_person"));
    assert_eq!(outcome["calls"].as_array().map(Vec::len), Some(3));
}

#[test]
fn run_reports_script_errors_in_output() {
    let script = write_temp("run-error", "ms", "x = 1\nprint(missing)\n");
    let stdout = stdout_of(&ormscope(&["run", "--script", script.to_string_lossy().as_ref()]));
    assert!(stdout.contains("Error on line 2: name 'missing' is not defined"));
}

#[test]
fn broken_bootstrap_fails_the_command() {
    let script = write_temp("bootstrap", "ms", "print(1)\n");
    let bootstrap = write_temp("bootstrap", "ms", "nope(\n");
    let output = ormscope(&[
        "run",
        "--script",
        script.to_string_lossy().as_ref(),
        "--bootstrap",
        bootstrap.to_string_lossy().as_ref(),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("evaluating bootstrap"));
}

#[test]
fn repl_shares_the_script_namespace() {
    let script = write_temp("repl", "ms", PERSON_SCRIPT);
    let mut child = Command::new(env!("CARGO_BIN_EXE_ormscope"))
        .args(["repl", "--script", script.to_string_lossy().as_ref()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|err| panic!("failed to spawn ormscope: {err}"));
    {
        let stdin = child.stdin.as_mut();
        assert!(stdin.is_some());
        let stdin = stdin.unwrap_or_else(|| unreachable!());
        stdin
            .write_all(REPL_INPUT.as_bytes())
            .unwrap_or_else(|err| panic!("failed to write stdin: {err}"));
    }
    let output = child
        .wait_with_output()
        .unwrap_or_else(|err| panic!("failed to wait for ormscope: {err}"));
    let stdout = stdout_of(&output);

    let plain: Vec<&str> = stdout.lines().filter(|line| !line.starts_with('{')).collect();
    assert_eq!(plain, vec!["created 1", "1", "3"]);
    let interactive = json_lines(&stdout)
        .into_iter()
        .filter(|call| call["tag"] == Value::from("interactive"))
        .count();
    assert_eq!(interactive, 4);
}

#[test]
fn tables_schema_and_rows_browse_the_database() {
    let script = write_temp("browse", "ms", PERSON_SCRIPT);
    let script_arg = script.to_string_lossy().into_owned();

    let tables = stdout_of(&ormscope(&["tables", "--script", &script_arg]));
    assert_eq!(tables, "created 1\nsandbox_person\n");

    let schema = stdout_of(&ormscope(&[
        "schema",
        "--script",
        &script_arg,
        "--table",
        "sandbox_person",
    ]));
    let columns = json_lines(&schema);
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[0]["name"], Value::from("id"));
    assert_eq!(columns[0]["primary_key"], Value::Bool(true));
    assert_eq!(columns[1]["data_type"], Value::from("TEXT"));

    let rows = stdout_of(&ormscope(&[
        "rows",
        "--script",
        &script_arg,
        "--table",
        "sandbox_person",
        "--limit",
        "10",
    ]));
    let rows = json_lines(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], Value::from("Ada"));

    let missing = ormscope(&["schema", "--table", "nope"]);
    assert!(!missing.status.success());
}
