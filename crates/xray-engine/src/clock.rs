use std::time::Instant;

use time::Duration;
use xray_domain::{now_utc, DateTimeUtc};

/// Wall-clock start paired with a monotonic reading.
///
/// `ended_at` is derived from the monotonic elapsed time rather than a second
/// wall-clock read, so `ended_at - started_at` and `duration_ms` always agree
/// and never go negative.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScopeClock {
    started_at: DateTimeUtc,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Elapsed {
    pub ended_at: DateTimeUtc,
    pub duration_ms: u64,
}

impl ScopeClock {
    pub(crate) fn start() -> Self {
        Self {
            started_at: now_utc(),
            started: Instant::now(),
        }
    }

    pub(crate) fn started_at(&self) -> DateTimeUtc {
        self.started_at
    }

    pub(crate) fn stop(&self) -> Elapsed {
        let micros = i64::try_from(self.started.elapsed().as_micros()).unwrap_or(i64::MAX);
        Elapsed {
            ended_at: self
                .started_at
                .saturating_add(Duration::microseconds(micros)),
            duration_ms: u64::try_from(micros / 1_000).unwrap_or_default(),
        }
    }
}
