#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use eventflow_core::models::{WorkerPhase, WorkerStatus};
use proptest::prelude::*;

/// Any Worker or Job phase.
pub fn phase_strategy() -> impl Strategy<Value = WorkerPhase> {
    prop::sample::select(WorkerPhase::all())
}

/// A status observation with optional timestamps.
pub fn status_strategy() -> impl Strategy<Value = WorkerStatus> {
    (
        phase_strategy(),
        prop::option::of(0i64..1_000_000),
        prop::option::of(0i64..1_000_000),
    )
        .prop_map(|(phase, started, ended)| WorkerStatus {
            phase,
            started: started.and_then(|s| Utc.timestamp_opt(s, 0).single()),
            ended: ended.and_then(|s| Utc.timestamp_opt(s, 0).single()),
        })
}

/// An arbitrarily ordered, possibly duplicated stream of observations.
pub fn status_sequence_strategy() -> impl Strategy<Value = Vec<WorkerStatus>> {
    prop::collection::vec(status_strategy(), 0..20)
}
