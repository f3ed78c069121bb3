use std::fmt::{Debug, Display, Formatter};
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::error;
use xray_domain::{TraceError, TraceResult};
use xray_trace_core::TraceStore;
use xray_trace_sqlite::SqliteTraceStore;

use crate::run::RunScope;

/// Entry point for tracing runs.
///
/// Holds nothing but the shared store handle, so it is cheap to clone and one
/// instance can serve any number of runs, sequential or concurrent.
#[derive(Clone)]
pub struct XRay {
    store: Arc<dyn TraceStore>,
}

impl XRay {
    #[must_use]
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        Self { store }
    }

    /// Trace into the `SQLite` file at `path`, creating it if needed.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> TraceResult<Self> {
        Ok(Self::new(Arc::new(SqliteTraceStore::open(path)?)))
    }

    /// Trace into the default `SQLite` store (`XRAY_DB_PATH`, else `xray.db`).
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] if the database cannot be opened or migrated.
    pub fn from_env() -> TraceResult<Self> {
        Ok(Self::new(Arc::new(SqliteTraceStore::from_env()?)))
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    /// Open a run. It is persisted as `running` before this returns.
    ///
    /// `metadata` defaults to an empty object.
    ///
    /// # Errors
    /// Returns the store's error if the opening record cannot be written.
    pub fn run(&self, name: &str, metadata: Option<Value>) -> TraceResult<RunScope> {
        RunScope::open(
            Arc::clone(&self.store),
            name,
            metadata.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        )
    }

    /// Run `body` inside a run scope.
    ///
    /// `Ok` finalizes the run as `success`. `Err(e)` finalizes it as `error`
    /// with `e`'s message and then hands the same `e` back. If the body
    /// succeeded but the run could not be finalized, the storage error is
    /// returned instead.
    ///
    /// # Errors
    /// The body's error, or a converted [`TraceError`] from the store.
    pub fn in_run<T, E, F>(&self, name: &str, metadata: Option<Value>, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut RunScope) -> Result<T, E>,
        E: From<TraceError> + Display,
    {
        let mut run = self.run(name, metadata).map_err(E::from)?;
        match body(&mut run) {
            Ok(value) => {
                run.close().map_err(E::from)?;
                Ok(value)
            }
            Err(err) => {
                let run_id = run.id();
                if let Err(persist) = run.fail(&err) {
                    error!(
                        run_id = %run_id,
                        cause = %err,
                        error = %persist,
                        "failed to record run failure"
                    );
                }
                Err(err)
            }
        }
    }
}

impl Debug for XRay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XRay").finish_non_exhaustive()
    }
}
