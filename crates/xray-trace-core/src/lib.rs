#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use xray_domain::{
    RecordKind, RunCompletion, RunId, RunRecord, RunTrace, StepRecord, TraceError, TraceResult,
};

/// Durable persistence for runs and steps.
///
/// Implementations must be safe to share across threads. Every operation
/// acquires whatever resource it needs and releases it before returning, on
/// success and on failure alike. Failures of the underlying medium are
/// returned, never hidden.
pub trait TraceStore: Send + Sync {
    /// Prepare the backing medium. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] if the schema cannot be applied.
    fn migrate(&self) -> TraceResult<()>;

    /// # Errors
    /// Returns [`TraceError::Storage`] if the write fails, including when the id already exists.
    fn create_run(&self, run: &RunRecord) -> TraceResult<()>;

    /// Write the terminal fields of a running run.
    ///
    /// # Errors
    /// [`TraceError::NotFound`] for an unknown id, [`TraceError::AlreadyFinalized`]
    /// if the run already left `running`.
    fn update_run(&self, run_id: RunId, completion: &RunCompletion) -> TraceResult<()>;

    /// Write a step in its terminal form.
    ///
    /// # Errors
    /// [`TraceError::NotFound`] if the owning run is unknown,
    /// [`TraceError::AlreadyFinalized`] if a step with the same id was already written.
    fn create_step(&self, step: &StepRecord) -> TraceResult<()>;

    /// # Errors
    /// [`TraceError::NotFound`] if the run does not exist.
    fn get_run(&self, run_id: RunId) -> TraceResult<RunRecord>;

    /// Runs ordered most recent first by `started_at`.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] if the read fails.
    fn list_runs(&self, limit: usize, offset: usize) -> TraceResult<Vec<RunRecord>>;

    /// Steps of a run in ascending `index` order. Unknown runs yield an empty list.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] if the read fails.
    fn get_steps(&self, run_id: RunId) -> TraceResult<Vec<StepRecord>>;

    /// # Errors
    /// [`TraceError::NotFound`] if the run does not exist.
    fn get_run_trace(&self, run_id: RunId) -> TraceResult<RunTrace> {
        let run = self.get_run(run_id)?;
        let steps = self.get_steps(run_id)?;
        Ok(RunTrace { run, steps })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: BTreeMap<RunId, RunRecord>,
    steps: BTreeMap<RunId, Vec<StepRecord>>,
}

/// Process-local [`TraceStore`] with the same contract as the durable backends.
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    state: Mutex<MemoryState>,
}

impl MemoryTraceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> TraceResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TraceError::storage_msg("memory trace store lock poisoned"))
    }
}

impl TraceStore for MemoryTraceStore {
    fn migrate(&self) -> TraceResult<()> {
        Ok(())
    }

    fn create_run(&self, run: &RunRecord) -> TraceResult<()> {
        let mut state = self.lock()?;
        if state.runs.contains_key(&run.id) {
            return Err(TraceError::storage_msg(format!(
                "failed to insert run: duplicate id {}",
                run.id
            )));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    fn update_run(&self, run_id: RunId, completion: &RunCompletion) -> TraceResult<()> {
        let mut state = self.lock()?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| TraceError::not_found(RecordKind::Run, run_id))?;
        if run.status.is_terminal() {
            return Err(TraceError::already_finalized(RecordKind::Run, run_id));
        }
        run.apply_completion(completion);
        Ok(())
    }

    fn create_step(&self, step: &StepRecord) -> TraceResult<()> {
        let mut state = self.lock()?;
        if !state.runs.contains_key(&step.run_id) {
            return Err(TraceError::not_found(RecordKind::Run, step.run_id));
        }
        let steps = state.steps.entry(step.run_id).or_default();
        if steps.iter().any(|existing| existing.id == step.id) {
            return Err(TraceError::already_finalized(RecordKind::Step, step.id));
        }
        if steps.iter().any(|existing| existing.index == step.index) {
            return Err(TraceError::storage_msg(format!(
                "failed to insert step: index {} already used in run {}",
                step.index, step.run_id
            )));
        }
        let position = steps.partition_point(|existing| existing.index < step.index);
        steps.insert(position, step.clone());
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> TraceResult<RunRecord> {
        self.lock()?
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| TraceError::not_found(RecordKind::Run, run_id))
    }

    fn list_runs(&self, limit: usize, offset: usize) -> TraceResult<Vec<RunRecord>> {
        let state = self.lock()?;
        let mut runs: Vec<&RunRecord> = state.runs.values().collect();
        runs.sort_by(|lhs, rhs| {
            rhs.started_at
                .cmp(&lhs.started_at)
                .then_with(|| rhs.id.cmp(&lhs.id))
        });
        Ok(runs.into_iter().skip(offset).take(limit).cloned().collect())
    }

    fn get_steps(&self, run_id: RunId) -> TraceResult<Vec<StepRecord>> {
        Ok(self
            .lock()?
            .steps
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
