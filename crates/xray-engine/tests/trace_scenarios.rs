use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use ulid::Ulid;
use xray_domain::RunCompletion;
use xray_engine::{
    MemoryTraceStore, RunId, RunRecord, RunStatus, RunTrace, SqliteTraceStore, StepRecord,
    StepStatus, TraceError, TraceResult, TraceStore, XRay,
};

#[derive(Debug, thiserror::Error)]
enum PipelineError {
    #[error("bad input")]
    BadInput,
    #[error(transparent)]
    Trace(#[from] TraceError),
}

fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("xray-engine-test-{name}-{}.sqlite", Ulid::new()))
}

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn sqlite_xray(name: &str) -> XRay {
    must(XRay::open(temp_db_path(name)))
}

fn trace_of(xray: &XRay, run_id: RunId) -> RunTrace {
    must(xray.store().get_run_trace(run_id))
}

fn assert_timing(started_at: time::OffsetDateTime, ended_at: time::OffsetDateTime, duration_ms: u64) {
    let span = ended_at - started_at;
    assert!(!span.is_negative());
    assert_eq!(
        u64::try_from(span.whole_milliseconds()).unwrap_or_else(|_| unreachable!()),
        duration_ms
    );
}

#[test]
fn pipeline_a_end_to_end() {
    let xray = sqlite_xray("pipeline-a");
    let mut seen = None;

    let result: Result<(), PipelineError> = xray.in_run("pipeline_A", None, |run| {
        seen = Some(run.id());
        run.in_step("search", Some(json!({"q": "widget"})), None, |step| {
            step.set_output(&json!({"count": 3}))?;
            Ok::<_, PipelineError>(())
        })?;
        run.in_step("filter", None, None, |step| {
            step.set_filters(&json!({"min_rating": 4.0}))?;
            step.add_evaluation(&json!({"id": "p1", "qualified": true}))?;
            step.add_evaluation(&json!({"id": "p2", "qualified": false}))?;
            Err(PipelineError::BadInput)
        })
    });
    assert!(matches!(result, Err(PipelineError::BadInput)));

    let trace = trace_of(&xray, seen.unwrap_or_else(|| unreachable!()));
    assert_eq!(trace.run.name, "pipeline_A");
    assert_eq!(trace.run.status, RunStatus::Error);
    assert_eq!(trace.run.error.as_deref(), Some("bad input"));

    assert_eq!(trace.steps.len(), 2);
    let search = &trace.steps[0];
    assert_eq!((search.index, search.name.as_str()), (0, "search"));
    assert_eq!(search.status, StepStatus::Success);
    assert_eq!(search.input, Some(json!({"q": "widget"})));
    assert_eq!(search.output, Some(json!({"count": 3})));
    assert_eq!(search.error, None);

    let filter = &trace.steps[1];
    assert_eq!((filter.index, filter.name.as_str()), (1, "filter"));
    assert_eq!(filter.status, StepStatus::Error);
    assert_eq!(filter.filters_applied, Some(json!({"min_rating": 4.0})));
    assert_eq!(
        filter.evaluations,
        vec![
            json!({"id": "p1", "qualified": true}),
            json!({"id": "p2", "qualified": false}),
        ]
    );
    assert!(filter.error.as_deref().is_some_and(|message| !message.is_empty()));
}

#[test]
fn keyword_pipeline_end_to_end() {
    let xray = sqlite_xray("keyword-pipeline");
    let candidates = [
        json!({"asin": "p1", "rating": 4.6}),
        json!({"asin": "p2", "rating": 3.1}),
        json!({"asin": "p3", "rating": 4.2}),
    ];

    let run_id = must(xray.in_run("keyword_pipeline", Some(json!({"product_id": "123"})), |run| {
        run.in_step(
            "generate_keywords",
            Some(json!({"title": "Stainless water bottle"})),
            Some("extract search terms from the product title"),
            |step| {
                step.set_output(&json!(["water bottle", "stainless bottle"]))?;
                Ok::<_, TraceError>(())
            },
        )?;

        run.in_step(
            "filter_candidates",
            Some(json!({"candidates": candidates.len()})),
            Some("drop anything rated below 4.0"),
            |step| {
                step.set_filters(&json!({"min_rating": 4.0}))?;
                for candidate in &candidates {
                    let rating = candidate["rating"].as_f64().unwrap_or_default();
                    step.add_evaluation(&json!({
                        "id": candidate["asin"],
                        "qualified": rating >= 4.0,
                    }))?;
                }
                step.set_output(&json!({"kept": ["p1", "p3"]}))?;
                Ok::<_, TraceError>(())
            },
        )?;

        Ok::<_, TraceError>(run.id())
    }));

    let trace = trace_of(&xray, run_id);
    assert_eq!(trace.run.name, "keyword_pipeline");
    assert_eq!(trace.run.status, RunStatus::Success);
    assert_eq!(trace.run.metadata, json!({"product_id": "123"}));
    assert_eq!(trace.run.error, None);
    let (ended_at, duration_ms) = (
        trace.run.ended_at.unwrap_or_else(|| unreachable!()),
        trace.run.duration_ms.unwrap_or_else(|| unreachable!()),
    );
    assert_timing(trace.run.started_at, ended_at, duration_ms);

    assert_eq!(trace.steps.len(), 2);
    let first = &trace.steps[0];
    assert_eq!((first.index, first.name.as_str()), (0, "generate_keywords"));
    assert_eq!(first.output, Some(json!(["water bottle", "stainless bottle"])));

    let second = &trace.steps[1];
    assert_eq!((second.index, second.name.as_str()), (1, "filter_candidates"));
    assert_eq!(second.filters_applied, Some(json!({"min_rating": 4.0})));
    assert_eq!(
        second.evaluations,
        vec![
            json!({"id": "p1", "qualified": true}),
            json!({"id": "p2", "qualified": false}),
            json!({"id": "p3", "qualified": true}),
        ]
    );
    for step in &trace.steps {
        assert_eq!(step.status, StepStatus::Success);
        assert!(step.started_at >= trace.run.started_at);
        assert!(step.ended_at <= ended_at);
        assert_timing(step.started_at, step.ended_at, step.duration_ms);
    }
    assert!(first.ended_at <= second.started_at);
}

#[test]
fn error_propagates_through_step_and_run_after_both_are_written() {
    let xray = sqlite_xray("propagation");
    let mut seen = None;

    let result: Result<(), PipelineError> = xray.in_run("pipeline_B", None, |run| {
        seen = Some(run.id());
        run.in_step("validate", Some(json!({"title": ""})), None, |_| {
            Err(PipelineError::BadInput)
        })
    });
    assert!(matches!(result, Err(PipelineError::BadInput)));

    let trace = trace_of(&xray, seen.unwrap_or_else(|| unreachable!()));
    assert_eq!(trace.run.status, RunStatus::Error);
    assert_eq!(trace.run.error.as_deref(), Some("bad input"));
    assert!(trace.run.ended_at.is_some());

    assert_eq!(trace.steps.len(), 1);
    assert_eq!(trace.steps[0].status, StepStatus::Error);
    assert_eq!(trace.steps[0].error.as_deref(), Some("bad input"));
}

#[test]
fn caught_step_failure_does_not_fail_the_run() {
    let xray = sqlite_xray("caught");
    let run_id = must(xray.in_run("pipeline_C", None, |run| {
        let attempt: Result<(), PipelineError> =
            run.in_step("primary_source", None, None, |_| Err(PipelineError::BadInput));
        assert!(attempt.is_err());
        run.in_step("fallback_source", None, Some("primary failed"), |step| {
            step.set_output(&json!({"source": "fallback"}))?;
            Ok::<_, PipelineError>(())
        })?;
        Ok::<_, PipelineError>(run.id())
    }));

    let trace = trace_of(&xray, run_id);
    assert_eq!(trace.run.status, RunStatus::Success);
    let statuses: Vec<StepStatus> = trace.steps.iter().map(|step| step.status).collect();
    assert_eq!(statuses, vec![StepStatus::Error, StepStatus::Success]);
}

#[test]
fn durations_follow_wall_time() {
    let xray = sqlite_xray("duration");
    let mut run = must(xray.run("timed", None));
    let (step, measured) = must(run.in_step("sleep", None, None, |step| {
        let step_clock = Instant::now();
        thread::sleep(Duration::from_millis(60));
        Ok::<_, TraceError>((step.id(), step_clock.elapsed()))
    }));
    let run_id = run.id();
    let record = must(run.close());

    let steps = must(xray.store().get_steps(run_id));
    assert_eq!(steps[0].id, step);
    let duration_ms = steps[0].duration_ms;
    let measured_ms = u64::try_from(measured.as_millis()).unwrap_or(u64::MAX);
    assert!(measured_ms >= 50);
    assert!(
        duration_ms.abs_diff(measured_ms) <= 20,
        "recorded {duration_ms}ms, measured {measured_ms}ms"
    );
    assert_timing(steps[0].started_at, steps[0].ended_at, duration_ms);

    assert!(record.duration_ms.unwrap_or_default() >= duration_ms);
}

#[test]
fn ten_steps_get_contiguous_indices() {
    let xray = sqlite_xray("contiguous");
    let mut run = must(xray.run("many", None));
    for position in 0..10 {
        must(run.in_step(&format!("step_{position}"), Some(json!(position)), None, |_| {
            Ok::<_, TraceError>(())
        }));
    }
    let run_id = run.id();
    must(run.close());

    let steps = must(xray.store().get_steps(run_id));
    let indices: Vec<usize> = steps.iter().map(|step| step.index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    for window in steps.windows(2) {
        assert!(window[0].started_at <= window[1].started_at);
    }
}

#[test]
fn panicking_body_still_records_run_and_step() {
    let xray = sqlite_xray("panic");
    let run_id = Arc::new(std::sync::Mutex::new(None));
    let seen = Arc::clone(&run_id);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        xray.in_run("exploding", None, |run| {
            if let Ok(mut slot) = seen.lock() {
                *slot = Some(run.id());
            }
            run.in_step("boom", None, None, |_| -> Result<(), TraceError> {
                panic!("ranking model crashed")
            })
        })
    }));
    assert!(outcome.is_err());

    let run_id = run_id
        .lock()
        .ok()
        .and_then(|slot| *slot)
        .unwrap_or_else(|| unreachable!());
    let trace = trace_of(&xray, run_id);
    assert_eq!(trace.run.status, RunStatus::Error);
    assert_eq!(trace.run.error.as_deref(), Some("run panicked before it was closed"));
    assert_eq!(trace.steps.len(), 1);
    assert_eq!(trace.steps[0].status, StepStatus::Error);
    assert_eq!(
        trace.steps[0].error.as_deref(),
        Some("step panicked before it was closed")
    );
}

#[test]
fn concurrent_runs_share_one_store() {
    let xray = sqlite_xray("concurrent");
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let xray = xray.clone();
            thread::spawn(move || {
                xray.in_run(&format!("worker_{worker}"), Some(json!({"worker": worker})), |run| {
                    for position in 0..5 {
                        run.in_step(&format!("step_{position}"), None, None, |step| {
                            step.add_evaluation(&json!({"worker": worker, "position": position}))
                        })?;
                    }
                    Ok::<_, TraceError>(run.id())
                })
            })
        })
        .collect();

    let run_ids: Vec<RunId> = handles
        .into_iter()
        .map(|handle| must(handle.join().unwrap_or_else(|_| unreachable!())))
        .collect();

    assert_eq!(must(xray.store().list_runs(10, 0)).len(), 4);
    for run_id in run_ids {
        let trace = trace_of(&xray, run_id);
        assert_eq!(trace.run.status, RunStatus::Success);
        let indices: Vec<usize> = trace.steps.iter().map(|step| step.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        let worker = trace.run.metadata["worker"].clone();
        assert!(trace
            .steps
            .iter()
            .all(|step| step.evaluations[0]["worker"] == worker));
    }
}

#[test]
fn open_run_is_readable_while_running() {
    let xray = sqlite_xray("live");
    let mut run = must(xray.run("in_flight", Some(json!({"attempt": 1}))));
    must(run.in_step("first", None, None, |_| Ok::<_, TraceError>(())));

    let listed = must(xray.store().list_runs(1, 0));
    assert_eq!(listed[0].id, run.id());
    assert_eq!(listed[0].status, RunStatus::Running);
    assert_eq!(listed[0].duration_ms, None);
    assert_eq!(must(xray.store().get_steps(run.id())).len(), 1);

    let closed = must(run.close());
    assert_eq!(must(xray.store().get_run(closed.id)).status, RunStatus::Success);
}

#[test]
fn stored_documents_round_trip_verbatim() {
    let xray = sqlite_xray("documents");
    let metadata = json!({
        "product": {"title": "Gourde isotherme 750 ml ✓", "tags": ["inox", "réutilisable", "水筒"]},
        "limits": {"max": 9_007_199_254_740_991_i64, "min": -17, "ratio": 0.125},
        "empty": {"list": [], "map": {}},
        "flags": [true, false, null],
    });
    let run_id = must(xray.in_run("documents", Some(metadata.clone()), |run| {
        run.in_step("echo", Some(metadata.clone()), None, |step| {
            step.set_output(&metadata)?;
            step.add_evaluations(metadata["product"]["tags"].as_array().cloned().unwrap_or_default())
        })?;
        Ok::<_, TraceError>(run.id())
    }));

    let trace = trace_of(&xray, run_id);
    assert_eq!(trace.run.metadata, metadata);
    assert_eq!(trace.steps[0].input.as_ref(), Some(&metadata));
    assert_eq!(trace.steps[0].output.as_ref(), Some(&metadata));
    let keys: Vec<&String> = trace.run.metadata.as_object().map(|map| map.keys().collect()).unwrap_or_default();
    assert_eq!(keys, vec!["product", "limits", "empty", "flags"]);
    assert_eq!(
        trace.steps[0].evaluations,
        vec![json!("inox"), json!("réutilisable"), json!("水筒")]
    );
}

/// Memory store whose terminal run write can be switched off.
#[derive(Default)]
struct BrokenFinalizeStore {
    inner: MemoryTraceStore,
    reject_updates: AtomicBool,
}

impl TraceStore for BrokenFinalizeStore {
    fn migrate(&self) -> TraceResult<()> {
        self.inner.migrate()
    }

    fn create_run(&self, run: &RunRecord) -> TraceResult<()> {
        self.inner.create_run(run)
    }

    fn update_run(&self, run_id: RunId, completion: &RunCompletion) -> TraceResult<()> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(TraceError::storage_msg("disk full"));
        }
        self.inner.update_run(run_id, completion)
    }

    fn create_step(&self, step: &StepRecord) -> TraceResult<()> {
        self.inner.create_step(step)
    }

    fn get_run(&self, run_id: RunId) -> TraceResult<RunRecord> {
        self.inner.get_run(run_id)
    }

    fn list_runs(&self, limit: usize, offset: usize) -> TraceResult<Vec<RunRecord>> {
        self.inner.list_runs(limit, offset)
    }

    fn get_steps(&self, run_id: RunId) -> TraceResult<Vec<StepRecord>> {
        self.inner.get_steps(run_id)
    }
}

#[test]
fn finalize_failure_is_never_reported_as_success() {
    let store = Arc::new(BrokenFinalizeStore::default());
    store.reject_updates.store(true, Ordering::SeqCst);
    let xray = XRay::new(store.clone());

    let ok_body: Result<u32, PipelineError> = xray.in_run("ok_body", None, |_| Ok(5));
    assert!(matches!(
        ok_body,
        Err(PipelineError::Trace(TraceError::Storage { ref context, .. })) if context == "disk full"
    ));

    let failing_body: Result<u32, PipelineError> =
        xray.in_run("failing_body", None, |_| Err(PipelineError::BadInput));
    assert!(matches!(failing_body, Err(PipelineError::BadInput)));

    let runs = must(store.list_runs(10, 0));
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|run| run.status == RunStatus::Running));
}

#[test]
fn both_backends_answer_reads_alike() {
    let stores: [Arc<dyn TraceStore>; 2] = [
        Arc::new(MemoryTraceStore::new()),
        Arc::new(must(SqliteTraceStore::open(temp_db_path("contract")))),
    ];

    for store in stores {
        let xray = XRay::new(Arc::clone(&store));
        let first = must(xray.in_run("first", None, |run| {
            run.in_step("a", Some(Value::Null), None, |_| Ok::<_, TraceError>(()))?;
            Ok::<_, TraceError>(run.id())
        }));
        thread::sleep(Duration::from_millis(2));
        let second = must(xray.run("second", None));

        let listed: Vec<RunId> = must(store.list_runs(10, 0)).iter().map(|run| run.id).collect();
        assert_eq!(listed, vec![second.id(), first]);
        assert!(matches!(
            store.get_run(RunId::new()),
            Err(TraceError::NotFound { .. })
        ));
        assert!(must(store.get_steps(RunId::new())).is_empty());
        assert!(matches!(
            store.update_run(
                first,
                &RunCompletion {
                    ended_at: xray_domain::now_utc(),
                    duration_ms: 0,
                    error: None,
                }
            ),
            Err(TraceError::AlreadyFinalized { .. })
        ));
        must(second.close());
    }
}
