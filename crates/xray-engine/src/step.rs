use std::fmt::{Debug, Display, Formatter};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};
use xray_domain::{RunId, StepId, StepRecord, StepStatus, TraceError, TraceResult};

use crate::clock::ScopeClock;
use crate::error_message;
use crate::run::RunScope;

/// An open step of a [`RunScope`].
///
/// Nothing is written until the step closes; the record is then written once
/// in terminal form.
pub struct StepScope<'run> {
    run: &'run mut RunScope,
    id: StepId,
    index: usize,
    name: String,
    clock: ScopeClock,
    input: Option<Value>,
    output: Option<Value>,
    reasoning: Option<String>,
    filters_applied: Option<Value>,
    evaluations: Vec<Value>,
    finalized: bool,
}

impl<'run> StepScope<'run> {
    pub(crate) fn open(
        run: &'run mut RunScope,
        index: usize,
        name: &str,
        input: Option<Value>,
        reasoning: Option<String>,
    ) -> Self {
        let id = StepId::new();
        debug!(run_id = %run.id(), step_id = %id, step = name, index, "step opened");
        Self {
            run,
            id,
            index,
            name: name.to_string(),
            clock: ScopeClock::start(),
            input,
            output: None,
            reasoning,
            filters_applied: None,
            evaluations: Vec::new(),
            finalized: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> StepId {
        self.id
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run.id()
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the step output.
    ///
    /// # Errors
    /// [`TraceError::Serialization`] if `output` cannot be represented as JSON;
    /// the previous output is kept.
    pub fn set_output<T: Serialize + ?Sized>(&mut self, output: &T) -> TraceResult<()> {
        self.output = Some(to_document(output, "step output")?);
        Ok(())
    }

    /// Replace the description of the filters this step applied.
    ///
    /// # Errors
    /// [`TraceError::Serialization`] if `filters` cannot be represented as JSON.
    pub fn set_filters<T: Serialize + ?Sized>(&mut self, filters: &T) -> TraceResult<()> {
        self.filters_applied = Some(to_document(filters, "step filters_applied")?);
        Ok(())
    }

    pub fn set_reasoning(&mut self, reasoning: impl Into<String>) {
        self.reasoning = Some(reasoning.into());
    }

    /// Append one evaluation.
    ///
    /// # Errors
    /// [`TraceError::Serialization`] if `evaluation` cannot be represented as JSON.
    pub fn add_evaluation<T: Serialize + ?Sized>(&mut self, evaluation: &T) -> TraceResult<()> {
        self.evaluations
            .push(to_document(evaluation, "step evaluation")?);
        Ok(())
    }

    /// Append evaluations in iteration order. Either all are appended or none.
    ///
    /// # Errors
    /// [`TraceError::Serialization`] if any item cannot be represented as JSON.
    pub fn add_evaluations<I, T>(&mut self, evaluations: I) -> TraceResult<()>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        let encoded = evaluations
            .into_iter()
            .map(|evaluation| to_document(&evaluation, "step evaluation"))
            .collect::<TraceResult<Vec<_>>>()?;
        self.evaluations.extend(encoded);
        Ok(())
    }

    /// Record the step as `success`.
    ///
    /// # Errors
    /// Returns the store's error if the step cannot be written.
    pub fn close(mut self) -> TraceResult<StepRecord> {
        self.finalize(None)
    }

    /// Record the step as `error` with `error`'s message.
    ///
    /// # Errors
    /// Returns the store's error if the step cannot be written.
    pub fn fail(mut self, error: impl Display) -> TraceResult<StepRecord> {
        self.finalize(Some(error_message(error)))
    }

    fn finalize(&mut self, error: Option<String>) -> TraceResult<StepRecord> {
        self.finalized = true;

        let elapsed = self.clock.stop();
        let status = if error.is_some() {
            StepStatus::Error
        } else {
            StepStatus::Success
        };
        let record = StepRecord {
            id: self.id,
            run_id: self.run.id(),
            name: std::mem::take(&mut self.name),
            index: self.index,
            started_at: self.clock.started_at(),
            ended_at: elapsed.ended_at,
            duration_ms: elapsed.duration_ms,
            status,
            input: self.input.take(),
            output: self.output.take(),
            reasoning: self.reasoning.take(),
            filters_applied: self.filters_applied.take(),
            evaluations: std::mem::take(&mut self.evaluations),
            error,
        };

        if let Err(err) = self.run.store().create_step(&record) {
            self.run.release_index(self.index);
            return Err(err);
        }

        match &record.error {
            None => debug!(
                run_id = %record.run_id,
                step_id = %record.id,
                index = record.index,
                duration_ms = record.duration_ms,
                "step closed"
            ),
            Some(message) => {
                self.run.note_failed_step();
                warn!(
                    run_id = %record.run_id,
                    step_id = %record.id,
                    index = record.index,
                    error = %message,
                    "step failed"
                );
            }
        }
        Ok(record)
    }
}

impl Drop for StepScope<'_> {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }

        let reason = if std::thread::panicking() {
            "step panicked before it was closed"
        } else {
            "step dropped without being closed"
        };
        if let Err(err) = self.finalize(Some(reason.to_string())) {
            error!(
                run_id = %self.run.id(),
                step_id = %self.id,
                error = %err,
                "failed to record abandoned step"
            );
        }
    }
}

impl Debug for StepScope<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepScope")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("name", &self.name)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

fn to_document<T: Serialize + ?Sized>(value: &T, context: &str) -> TraceResult<Value> {
    serde_json::to_value(value).map_err(|err| TraceError::serialization(context, err))
}
