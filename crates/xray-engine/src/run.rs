use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};
use xray_domain::{RunCompletion, RunId, RunRecord, TraceError, TraceResult};
use xray_trace_core::TraceStore;

use crate::clock::ScopeClock;
use crate::error_message;
use crate::step::StepScope;

/// An open run.
///
/// Steps are opened through [`RunScope::step`] or [`RunScope::in_step`], which
/// borrow the run mutably: a run has at most one open step and cannot be
/// closed while one is open. Closing consumes the scope. A scope dropped
/// without [`close`](RunScope::close) or [`fail`](RunScope::fail) is
/// finalized as `error`.
pub struct RunScope {
    store: Arc<dyn TraceStore>,
    record: RunRecord,
    clock: ScopeClock,
    next_index: usize,
    failed_steps: usize,
    finalized: bool,
}

impl RunScope {
    pub(crate) fn open(
        store: Arc<dyn TraceStore>,
        name: &str,
        metadata: Value,
    ) -> TraceResult<Self> {
        let clock = ScopeClock::start();
        let record = RunRecord::started(RunId::new(), name, metadata, clock.started_at());
        store.create_run(&record)?;
        info!(run_id = %record.id, run = %record.name, "run opened");

        Ok(Self {
            store,
            record,
            clock,
            next_index: 0,
            failed_steps: 0,
            finalized: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> RunId {
        self.record.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// The run as last written: `running` until the scope is finalized.
    #[must_use]
    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Number of steps opened so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.next_index
    }

    /// Open the next step. Its index is one past the previous step's.
    pub fn step(
        &mut self,
        name: &str,
        input: Option<Value>,
        reasoning: Option<&str>,
    ) -> StepScope<'_> {
        let index = self.next_index;
        self.next_index += 1;
        StepScope::open(self, index, name, input, reasoning.map(str::to_string))
    }

    /// Run `body` inside a step scope.
    ///
    /// `Ok` records the step as `success`. `Err(e)` records it as `error` with
    /// `e`'s message, then returns the same `e`. A step failure does not fail
    /// the run unless the error keeps propagating out of the run's own body.
    ///
    /// # Errors
    /// The body's error, or a converted [`TraceError`] if the step could not be written.
    pub fn in_step<T, E, F>(
        &mut self,
        name: &str,
        input: Option<Value>,
        reasoning: Option<&str>,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut StepScope<'_>) -> Result<T, E>,
        E: From<TraceError> + Display,
    {
        let mut step = self.step(name, input, reasoning);
        match body(&mut step) {
            Ok(value) => {
                step.close().map_err(E::from)?;
                Ok(value)
            }
            Err(err) => {
                let step_id = step.id();
                if let Err(persist) = step.fail(&err) {
                    error!(
                        run_id = %self.record.id,
                        step_id = %step_id,
                        cause = %err,
                        error = %persist,
                        "failed to record step failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Finalize the run as `success`.
    ///
    /// # Errors
    /// Returns the store's error if the terminal fields cannot be written.
    pub fn close(mut self) -> TraceResult<RunRecord> {
        self.finalize(None)
    }

    /// Finalize the run as `error` with `error`'s message.
    ///
    /// # Errors
    /// Returns the store's error if the terminal fields cannot be written.
    pub fn fail(mut self, error: impl Display) -> TraceResult<RunRecord> {
        self.finalize(Some(error_message(error)))
    }

    pub(crate) fn store(&self) -> &dyn TraceStore {
        self.store.as_ref()
    }

    /// Hand back the index of a step whose write failed.
    pub(crate) fn release_index(&mut self, index: usize) {
        if index + 1 == self.next_index {
            self.next_index = index;
        }
    }

    pub(crate) fn note_failed_step(&mut self) {
        self.failed_steps += 1;
    }

    fn finalize(&mut self, error: Option<String>) -> TraceResult<RunRecord> {
        self.finalized = true;

        let elapsed = self.clock.stop();
        let completion = RunCompletion {
            ended_at: elapsed.ended_at,
            duration_ms: elapsed.duration_ms,
            error,
        };
        self.store.update_run(self.record.id, &completion)?;
        self.record.apply_completion(&completion);

        match &completion.error {
            None => info!(
                run_id = %self.record.id,
                duration_ms = completion.duration_ms,
                steps = self.next_index,
                failed_steps = self.failed_steps,
                "run closed"
            ),
            Some(message) => warn!(
                run_id = %self.record.id,
                duration_ms = completion.duration_ms,
                steps = self.next_index,
                error = %message,
                "run failed"
            ),
        }
        Ok(self.record.clone())
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }

        let reason = if std::thread::panicking() {
            "run panicked before it was closed"
        } else {
            "run dropped without being closed"
        };
        if let Err(err) = self.finalize(Some(reason.to_string())) {
            error!(run_id = %self.record.id, error = %err, "failed to record abandoned run");
        }
    }
}

impl Debug for RunScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunScope")
            .field("record", &self.record)
            .field("next_index", &self.next_index)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}
