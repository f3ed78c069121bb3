#![forbid(unsafe_code)]
//! Records, identifiers and the error taxonomy shared by every X-Ray crate.
//!
//! A [`RunRecord`] describes one traced invocation and owns an ordered list of
//! [`StepRecord`]s. Payload fields (`metadata`, `input`, `output`,
//! `filters_applied`, `evaluations`) are opaque [`Value`] documents: they are
//! stored and returned verbatim and never interpreted.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type TraceResult<T> = Result<T, TraceError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse the canonical ULID text form.
    ///
    /// # Errors
    /// Returns [`TraceError::InvalidId`] if `value` is not a valid ULID.
    pub fn parse(value: &str) -> TraceResult<Self> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| TraceError::invalid_id(RecordKind::Run, value, err))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StepId(pub Ulid);

impl StepId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse the canonical ULID text form.
    ///
    /// # Errors
    /// Returns [`TraceError::InvalidId`] if `value` is not a valid ULID.
    pub fn parse(value: &str) -> TraceResult<Self> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| TraceError::invalid_id(RecordKind::Step, value, err))
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StepId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Steps have no persisted running state; only these terminal values are written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RecordKind {
    Run,
    Step,
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Run => "run",
            Self::Step => "step",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },
    #[error("{kind} {id} is already finalized")]
    AlreadyFinalized { kind: RecordKind, id: String },
    #[error("invalid {kind} id {value:?}")]
    InvalidId {
        kind: RecordKind,
        value: String,
        #[source]
        source: ulid::DecodeError,
    },
    #[error("storage failure: {context}")]
    Storage {
        context: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("serialization failure: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TraceError {
    pub fn not_found(kind: RecordKind, id: impl Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_finalized(kind: RecordKind, id: impl Display) -> Self {
        Self::AlreadyFinalized {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_id(kind: RecordKind, value: impl Into<String>, source: ulid::DecodeError) -> Self {
        Self::InvalidId {
            kind,
            value: value.into(),
            source,
        }
    }

    pub fn storage(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Storage {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub fn storage_msg(context: impl Into<String>) -> Self {
        Self::Storage {
            context: context.into(),
            source: None,
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: RunId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub duration_ms: Option<u64>,
    pub status: RunStatus,
    pub metadata: Value,
    pub error: Option<String>,
}

impl RunRecord {
    /// A freshly opened run: `running`, no terminal fields.
    #[must_use]
    pub fn started(id: RunId, name: impl Into<String>, metadata: Value, started_at: DateTimeUtc) -> Self {
        Self {
            id,
            name: name.into(),
            started_at,
            ended_at: None,
            duration_ms: None,
            status: RunStatus::Running,
            metadata,
            error: None,
        }
    }

    pub fn apply_completion(&mut self, completion: &RunCompletion) {
        self.ended_at = Some(completion.ended_at);
        self.duration_ms = Some(completion.duration_ms);
        self.status = completion.status();
        self.error.clone_from(&completion.error);
    }
}

/// Terminal fields written once when a run scope closes.
///
/// The status is derived from `error` so a completion can never carry
/// `success` together with an error message.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunCompletion {
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: DateTimeUtc,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl RunCompletion {
    #[must_use]
    pub fn status(&self) -> RunStatus {
        if self.error.is_some() {
            RunStatus::Error
        } else {
            RunStatus::Success
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub id: StepId,
    pub run_id: RunId,
    pub name: String,
    pub index: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: DateTimeUtc,
    pub duration_ms: u64,
    pub status: StepStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub reasoning: Option<String>,
    pub filters_applied: Option<Value>,
    pub evaluations: Vec<Value>,
    pub error: Option<String>,
}

/// A run together with its steps in index order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunTrace {
    pub run: RunRecord,
    pub steps: Vec<StepRecord>,
}

/// Current UTC time truncated to whole microseconds, the precision the stores keep.
#[must_use]
pub fn now_utc() -> DateTimeUtc {
    let now = OffsetDateTime::now_utc();
    now - Duration::nanoseconds(i64::from(now.nanosecond() % 1_000))
}
