//! Read-only inspection of stored traces.
//!
//! Every command prints a single JSON document on stdout. Diagnostics go to
//! stderr through `tracing`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::debug;
use xray_domain::RunId;
use xray_trace_core::TraceStore;
use xray_trace_sqlite::{SqliteTraceStore, TRACE_SCHEMA_VERSION};

#[derive(Debug, Parser)]
#[command(name = "xray")]
#[command(about = "Inspect X-Ray run traces")]
pub struct Cli {
    /// Trace database path.
    #[arg(long, env = "XRAY_DB_PATH", default_value = "xray.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the trace schema.
    Migrate,
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    /// Runs, most recent first.
    List(ListArgs),
    /// A run together with its steps.
    Show(RunArgs),
    /// The steps of a run in index order.
    Steps(RunArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    run_id: String,
}

/// Executes a parsed CLI invocation and prints its JSON result.
///
/// # Errors
/// Returns an error when the database cannot be opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = run_with_db(&cli.db, cli.command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes `command` against the trace database at `db_path`.
///
/// Only `migrate` creates a missing database; the read commands require it to exist.
///
/// # Errors
/// Returns an error when the database is missing or cannot be opened, or the command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<Value> {
    if matches!(command, Command::Runs { .. }) && !db_path.is_file() {
        bail!(
            "trace database {} does not exist; run `xray migrate` to create it",
            db_path.display()
        );
    }

    debug!(db = %db_path.display(), "opening trace database");
    let store = SqliteTraceStore::open(db_path)
        .with_context(|| format!("failed to open trace database {}", db_path.display()))?;

    match command {
        Command::Migrate => {
            store.migrate()?;
            Ok(json!({
                "db": db_path.display().to_string(),
                "schema_version": TRACE_SCHEMA_VERSION,
            }))
        }
        Command::Runs { command } => run_runs(command, &store),
    }
}

/// Executes a `runs` subcommand against any trace store.
///
/// # Errors
/// Returns an error for malformed or unknown run ids and for store failures.
pub fn run_runs(command: RunsCommand, store: &dyn TraceStore) -> Result<Value> {
    let output = match command {
        RunsCommand::List(args) => serde_json::to_value(store.list_runs(args.limit, args.offset)?)?,
        RunsCommand::Show(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            serde_json::to_value(store.get_run_trace(run_id)?)?
        }
        RunsCommand::Steps(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            store
                .get_run(run_id)
                .with_context(|| format!("cannot list steps of {run_id}"))?;
            serde_json::to_value(store.get_steps(run_id)?)?
        }
    };
    Ok(output)
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    Ok(RunId::parse(raw.trim())?)
}
