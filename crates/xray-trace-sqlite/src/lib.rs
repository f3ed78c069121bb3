#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::debug;
use xray_domain::{
    now_utc, DateTimeUtc, RecordKind, RunCompletion, RunId, RunRecord, RunStatus, StepId,
    StepRecord, StepStatus, TraceError, TraceResult,
};
use xray_trace_core::TraceStore;

pub const TRACE_SCHEMA_VERSION: i64 = 1;

pub const DEFAULT_DB_PATH: &str = "xray.db";

pub const DB_PATH_ENV: &str = "XRAY_DB_PATH";

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  duration_ms INTEGER CHECK (duration_ms IS NULL OR duration_ms >= 0),
  status TEXT NOT NULL CHECK (status IN ('running','success','error')),
  metadata TEXT NOT NULL,
  error TEXT
);

CREATE TABLE IF NOT EXISTS steps (
  id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  name TEXT NOT NULL,
  step_index INTEGER NOT NULL CHECK (step_index >= 0),
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  duration_ms INTEGER NOT NULL CHECK (duration_ms >= 0),
  status TEXT NOT NULL CHECK (status IN ('success','error')),
  input TEXT,
  output TEXT,
  reasoning TEXT,
  filters_applied TEXT,
  evaluations TEXT NOT NULL,
  error TEXT,
  CHECK ((status = 'error') = (error IS NOT NULL)),
  UNIQUE(run_id, step_index),
  FOREIGN KEY (run_id) REFERENCES runs(id)
);

CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_steps_run_index ON steps(run_id, step_index);

CREATE TRIGGER IF NOT EXISTS trg_runs_terminal_is_final
BEFORE UPDATE ON runs
WHEN OLD.status <> 'running'
BEGIN
  SELECT RAISE(FAIL, 'runs are immutable once finalized');
END;

CREATE TRIGGER IF NOT EXISTS trg_steps_no_update
BEFORE UPDATE ON steps
BEGIN
  SELECT RAISE(FAIL, 'steps are immutable once recorded');
END;
";

const RUN_COLUMNS: &str =
    "id, name, started_at, ended_at, duration_ms, status, metadata, error";

const STEP_COLUMNS: &str = "id, run_id, name, step_index, started_at, ended_at, duration_ms,
    status, input, output, reasoning, filters_applied, evaluations, error";

/// [`TraceStore`] backed by a single `SQLite` file.
///
/// The store only remembers the path; every operation opens its own
/// connection and drops it before returning, so one instance can be shared
/// freely between threads and scopes.
#[derive(Debug, Clone)]
pub struct SqliteTraceStore {
    path: PathBuf,
}

impl SqliteTraceStore {
    /// Open or create a trace database at `path` and apply the schema.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] if the parent directory cannot be
    /// created or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> TraceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                TraceError::storage(
                    format!("failed to create database directory {}", parent.display()),
                    err,
                )
            })?;
        }

        let store = Self { path };
        store.migrate()?;
        Ok(store)
    }

    /// Open the database named by `XRAY_DB_PATH`, or `xray.db` when unset.
    ///
    /// # Errors
    /// See [`SqliteTraceStore::open`].
    pub fn from_env() -> TraceResult<Self> {
        let path = std::env::var_os(DB_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_DB_PATH), PathBuf::from);
        Self::open(path)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> TraceResult<Connection> {
        let conn = Connection::open(&self.path).storage_with(|| {
            format!("failed to open sqlite database at {}", self.path.display())
        })?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .storage("failed to configure sqlite pragmas")?;

        Ok(conn)
    }
}

impl TraceStore for SqliteTraceStore {
    fn migrate(&self) -> TraceResult<()> {
        let conn = self.connect()?;

        if table_exists(&conn, "runs")? && !table_exists(&conn, "schema_migrations")? {
            return Err(TraceError::storage_msg(format!(
                "{} has a runs table without schema_migrations; refusing to migrate a database this store did not create",
                self.path.display()
            )));
        }

        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .storage("failed to enable WAL journal mode")?;
        conn.execute_batch(SCHEMA_V1)
            .storage("failed to apply trace schema")?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![TRACE_SCHEMA_VERSION, format_timestamp(now_utc())?],
        )
        .storage("failed to record trace migration")?;

        debug!(path = %self.path.display(), version = TRACE_SCHEMA_VERSION, "trace schema ready");
        Ok(())
    }

    fn create_run(&self, run: &RunRecord) -> TraceResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO runs(
                id, name, started_at, ended_at, duration_ms, status, metadata, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id.to_string(),
                run.name,
                format_timestamp(run.started_at)?,
                run.ended_at.map(format_timestamp).transpose()?,
                run.duration_ms.map(duration_to_sql).transpose()?,
                run.status.as_str(),
                encode_document(&run.metadata, "runs.metadata")?,
                run.error,
            ],
        )
        .storage("failed to insert run")?;
        Ok(())
    }

    fn update_run(&self, run_id: RunId, completion: &RunCompletion) -> TraceResult<()> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage("failed to start run update transaction")?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM runs WHERE id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .storage("failed to read run status")?;

        match current.as_deref().map(parse_run_status).transpose()? {
            None => return Err(TraceError::not_found(RecordKind::Run, run_id)),
            Some(status) if status.is_terminal() => {
                return Err(TraceError::already_finalized(RecordKind::Run, run_id));
            }
            Some(_) => {}
        }

        tx.execute(
            "UPDATE runs SET ended_at = ?2, duration_ms = ?3, status = ?4, error = ?5
             WHERE id = ?1 AND status = 'running'",
            params![
                run_id.to_string(),
                format_timestamp(completion.ended_at)?,
                duration_to_sql(completion.duration_ms)?,
                completion.status().as_str(),
                completion.error,
            ],
        )
        .storage("failed to update run")?;

        tx.commit().storage("failed to commit run update")?;
        Ok(())
    }

    fn create_step(&self, step: &StepRecord) -> TraceResult<()> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage("failed to start step transaction")?;

        let run_exists = tx
            .query_row(
                "SELECT 1 FROM runs WHERE id = ?1",
                params![step.run_id.to_string()],
                |_| Ok(()),
            )
            .optional()
            .storage("failed to look up step run")?
            .is_some();
        if !run_exists {
            return Err(TraceError::not_found(RecordKind::Run, step.run_id));
        }

        let step_exists = tx
            .query_row(
                "SELECT 1 FROM steps WHERE id = ?1",
                params![step.id.to_string()],
                |_| Ok(()),
            )
            .optional()
            .storage("failed to look up step")?
            .is_some();
        if step_exists {
            return Err(TraceError::already_finalized(RecordKind::Step, step.id));
        }

        tx.execute(
            "INSERT INTO steps(
                id, run_id, name, step_index, started_at, ended_at, duration_ms,
                status, input, output, reasoning, filters_applied,
                evaluations, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                step.id.to_string(),
                step.run_id.to_string(),
                step.name,
                i64::try_from(step.index)
                    .map_err(|err| TraceError::storage("step index too large for sqlite", err))?,
                format_timestamp(step.started_at)?,
                format_timestamp(step.ended_at)?,
                duration_to_sql(step.duration_ms)?,
                step.status.as_str(),
                step.input
                    .as_ref()
                    .map(|value| encode_document(value, "steps.input"))
                    .transpose()?,
                step.output
                    .as_ref()
                    .map(|value| encode_document(value, "steps.output"))
                    .transpose()?,
                step.reasoning,
                step.filters_applied
                    .as_ref()
                    .map(|value| encode_document(value, "steps.filters_applied"))
                    .transpose()?,
                serde_json::to_string(&step.evaluations)
                    .map_err(|err| TraceError::serialization("steps.evaluations", err))?,
                step.error,
            ],
        )
        .storage("failed to insert step")?;

        tx.commit().storage("failed to commit step")?;
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> TraceResult<RunRecord> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))
            .storage("failed to prepare run lookup")?;
        let raw = stmt
            .query_row(params![run_id.to_string()], RawRun::from_row)
            .optional()
            .storage("failed to read run")?;

        match raw {
            Some(raw) => raw.into_record(),
            None => Err(TraceError::not_found(RecordKind::Run, run_id)),
        }
    }

    fn list_runs(&self, limit: usize, offset: usize) -> TraceResult<Vec<RunRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?1 OFFSET ?2"
            ))
            .storage("failed to prepare run listing")?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit, offset], RawRun::from_row)
            .storage("failed to list runs")?;

        let mut out = Vec::new();
        for raw in rows {
            out.push(raw.storage("failed to read run row")?.into_record()?);
        }
        Ok(out)
    }

    fn get_steps(&self, run_id: RunId) -> TraceResult<Vec<StepRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps
                 WHERE run_id = ?1
                 ORDER BY step_index ASC"
            ))
            .storage("failed to prepare step listing")?;

        let rows = stmt
            .query_map(params![run_id.to_string()], RawStep::from_row)
            .storage("failed to list steps")?;

        let mut out = Vec::new();
        for raw in rows {
            out.push(raw.storage("failed to read step row")?.into_record()?);
        }
        Ok(out)
    }
}

/// Run row as stored, before any decoding.
struct RawRun {
    id: String,
    name: String,
    started_at: String,
    ended_at: Option<String>,
    duration_ms: Option<i64>,
    status: String,
    metadata: String,
    error: Option<String>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            duration_ms: row.get(4)?,
            status: row.get(5)?,
            metadata: row.get(6)?,
            error: row.get(7)?,
        })
    }

    fn into_record(self) -> TraceResult<RunRecord> {
        Ok(RunRecord {
            id: RunId::parse(&self.id)?,
            name: self.name,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: self
                .ended_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            duration_ms: self.duration_ms.map(duration_from_sql).transpose()?,
            status: parse_run_status(&self.status)?,
            metadata: decode_document(&self.metadata, "runs.metadata")?,
            error: self.error,
        })
    }
}

struct RawStep {
    id: String,
    run_id: String,
    name: String,
    step_index: i64,
    started_at: String,
    ended_at: String,
    duration_ms: i64,
    status: String,
    input: Option<String>,
    output: Option<String>,
    reasoning: Option<String>,
    filters_applied: Option<String>,
    evaluations: String,
    error: Option<String>,
}

impl RawStep {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            name: row.get(2)?,
            step_index: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            duration_ms: row.get(6)?,
            status: row.get(7)?,
            input: row.get(8)?,
            output: row.get(9)?,
            reasoning: row.get(10)?,
            filters_applied: row.get(11)?,
            evaluations: row.get(12)?,
            error: row.get(13)?,
        })
    }

    fn into_record(self) -> TraceResult<StepRecord> {
        let evaluations: Vec<Value> = serde_json::from_str(&self.evaluations)
            .map_err(|err| TraceError::serialization("invalid steps.evaluations", err))?;

        Ok(StepRecord {
            id: StepId::parse(&self.id)?,
            run_id: RunId::parse(&self.run_id)?,
            name: self.name,
            index: usize::try_from(self.step_index).map_err(|err| {
                TraceError::storage(format!("invalid step_index: {}", self.step_index), err)
            })?,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: parse_timestamp(&self.ended_at)?,
            duration_ms: duration_from_sql(self.duration_ms)?,
            status: parse_step_status(&self.status)?,
            input: self
                .input
                .as_deref()
                .map(|raw| decode_document(raw, "steps.input"))
                .transpose()?,
            output: self
                .output
                .as_deref()
                .map(|raw| decode_document(raw, "steps.output"))
                .transpose()?,
            reasoning: self.reasoning,
            filters_applied: self
                .filters_applied
                .as_deref()
                .map(|raw| decode_document(raw, "steps.filters_applied"))
                .transpose()?,
            evaluations,
            error: self.error,
        })
    }
}

trait StorageResultExt<T> {
    fn storage(self, context: &str) -> TraceResult<T>;

    fn storage_with<F>(self, context: F) -> TraceResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> StorageResultExt<T> for rusqlite::Result<T> {
    fn storage(self, context: &str) -> TraceResult<T> {
        self.map_err(|err| TraceError::storage(context, err))
    }

    fn storage_with<F>(self, context: F) -> TraceResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| TraceError::storage(context(), err))
    }
}

fn table_exists(conn: &Connection, table: &str) -> TraceResult<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .storage_with(|| format!("failed to look up table {table}"))
}

fn encode_document(value: &Value, field: &str) -> TraceResult<String> {
    serde_json::to_string(value).map_err(|err| TraceError::serialization(field, err))
}

fn decode_document(raw: &str, field: &str) -> TraceResult<Value> {
    serde_json::from_str(raw).map_err(|err| TraceError::serialization(format!("invalid {field}"), err))
}

fn parse_run_status(value: &str) -> TraceResult<RunStatus> {
    RunStatus::parse(value)
        .ok_or_else(|| TraceError::storage_msg(format!("unknown run status: {value}")))
}

fn parse_step_status(value: &str) -> TraceResult<StepStatus> {
    StepStatus::parse(value)
        .ok_or_else(|| TraceError::storage_msg(format!("unknown step status: {value}")))
}

fn duration_to_sql(value: u64) -> TraceResult<i64> {
    i64::try_from(value).map_err(|err| TraceError::storage("duration_ms too large for sqlite", err))
}

fn duration_from_sql(value: i64) -> TraceResult<u64> {
    u64::try_from(value)
        .map_err(|err| TraceError::storage(format!("invalid duration_ms: {value}"), err))
}

/// Fixed-width UTC text, so `ORDER BY started_at` is chronological.
fn format_timestamp(value: DateTimeUtc) -> TraceResult<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .map_err(|err| TraceError::storage("invalid datetime format", err))
}

fn parse_timestamp(value: &str) -> TraceResult<OffsetDateTime> {
    PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .map_err(|err| TraceError::storage(format!("invalid stored timestamp {value:?}"), err))
}
