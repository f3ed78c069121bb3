#![forbid(unsafe_code)]
//! Scoped capture of run and step traces.
//!
//! ```no_run
//! use serde_json::json;
//! use xray_engine::{TraceError, XRay};
//!
//! # fn main() -> Result<(), TraceError> {
//! let xray = XRay::open("xray.db")?;
//! xray.in_run("pipeline_A", Some(json!({"product_id": "123"})), |run| {
//!     run.in_step("generate_keywords", Some(json!({"title": "bottle"})), None, |step| {
//!         step.set_output(&json!(["water bottle", "insulated"]))?;
//!         Ok::<_, TraceError>(())
//!     })
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! A [`RunScope`] is written as `running` the moment it opens and receives its
//! terminal fields exactly once when it closes. Each [`StepScope`] is written
//! once, in terminal form, when it closes. Scopes that are dropped without
//! being closed (early return, `?`, panic) are recorded as `error`.

mod client;
mod clock;
mod run;
mod step;

use std::fmt::Display;

pub use client::XRay;
pub use run::RunScope;
pub use step::StepScope;
pub use xray_domain::{
    RunId, RunRecord, RunStatus, RunTrace, StepId, StepRecord, StepStatus, TraceError,
    TraceResult,
};
pub use xray_trace_core::{MemoryTraceStore, TraceStore};
pub use xray_trace_sqlite::SqliteTraceStore;

const UNSPECIFIED_ERROR: &str = "unspecified error";

pub(crate) fn error_message(error: impl Display) -> String {
    let message = error.to_string();
    if message.trim().is_empty() {
        UNSPECIFIED_ERROR.to_string()
    } else {
        message
    }
}
