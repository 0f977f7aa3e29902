use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ormscope_orchestrator::{Playground, PlaygroundConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ormscope")]
#[command(about = "Run model scripts against a scratch database and trace every query")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a script, print its output and one JSON line per captured call.
    Run(RunArgs),
    /// Read statements from stdin against the live namespace.
    Repl(SessionArgs),
    Tables(SessionArgs),
    Schema(TableArgs),
    Rows(RowsArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Script executed before the command itself.
    #[arg(long)]
    script: Option<PathBuf>,
    /// YAML playground configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bootstrap: Option<PathBuf>,
    #[arg(long)]
    requirements: Option<PathBuf>,
    #[arg(long)]
    default_group: Option<String>,
    #[arg(long)]
    entry_procedure: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Print the whole run outcome as one JSON document.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Args)]
struct TableArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    table: String,
}

#[derive(Debug, Args)]
struct RowsArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    table: String,
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Repl(args) => repl_command(&args),
        Commands::Tables(args) => tables_command(&args),
        Commands::Schema(args) => schema_command(&args),
        Commands::Rows(args) => rows_command(&args),
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_config(args: &SessionArgs) -> Result<PlaygroundConfig> {
    let mut config = match &args.config {
        Some(path) => PlaygroundConfig::load(path)?,
        None => PlaygroundConfig::default(),
    };
    if let Some(path) = &args.bootstrap {
        config.bootstrap = read_file(path)?;
    }
    if let Some(path) = &args.requirements {
        config.requirements = read_file(path)?;
    }
    if let Some(group) = &args.default_group {
        config.default_group.clone_from(group);
    }
    if let Some(entry) = &args.entry_procedure {
        config.entry_procedure.clone_from(entry);
    }
    Ok(config)
}

/// Build the playground and run `--script` when given, echoing its output.
fn open_session(args: &SessionArgs) -> Result<Playground> {
    let playground = Playground::new(load_config(args)?);
    if let Some(path) = &args.script {
        let source = read_file(path)?;
        tracing::info!(script = %path.display(), "running script");
        let outcome = playground.run(&source)?;
        print!("{}", outcome.output);
    }
    Ok(playground)
}

fn run_command(args: &RunArgs) -> Result<()> {
    let Some(path) = &args.session.script else {
        anyhow::bail!("run requires --script");
    };
    let source = read_file(path)?;
    let playground = Playground::new(load_config(&args.session)?);
    let outcome = playground.run(&source)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    print!("{}", outcome.output);
    for call in &outcome.calls {
        println!("{}", serde_json::to_string(call)?);
    }
    Ok(())
}

fn repl_command(args: &SessionArgs) -> Result<()> {
    let playground = open_session(args)?;
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut pending = String::new();

    for line in stdin.lock().lines() {
        let line = line?;
        // A line ending in ':' opens a block that runs to the next blank line.
        if !pending.is_empty() || line.trim_end().ends_with(':') {
            if line.trim().is_empty() {
                let statement = std::mem::take(&mut pending);
                execute_statement(&playground, &statement, &mut stdout)?;
            } else {
                pending.push_str(&line);
                pending.push('\n');
            }
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        execute_statement(&playground, &line, &mut stdout)?;
    }
    if !pending.is_empty() {
        execute_statement(&playground, &pending, &mut stdout)?;
    }
    Ok(())
}

fn execute_statement(
    playground: &Playground,
    statement: &str,
    out: &mut impl Write,
) -> Result<()> {
    let seen = playground.trace().len();
    let outcome = playground.execute_interactive(statement)?;
    write!(out, "{}", outcome.output)?;
    if let Some(value) = &outcome.value {
        writeln!(out, "{value}")?;
    }
    if let Some(error) = &outcome.error {
        write!(out, "{error}")?;
    }
    for call in playground.trace().iter().skip(seen) {
        writeln!(out, "{}", serde_json::to_string(call)?)?;
    }
    out.flush()?;
    Ok(())
}

fn tables_command(args: &SessionArgs) -> Result<()> {
    let playground = open_session(args)?;
    for table in playground.list_tables()? {
        println!("{table}");
    }
    Ok(())
}

fn schema_command(args: &TableArgs) -> Result<()> {
    let playground = open_session(&args.session)?;
    for column in playground.table_schema(&args.table)? {
        println!("{}", serde_json::to_string(&column)?);
    }
    Ok(())
}

fn rows_command(args: &RowsArgs) -> Result<()> {
    let playground = open_session(&args.session)?;
    let rows = playground.table_rows(&args.table, args.limit)?;
    for row in rows {
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}
