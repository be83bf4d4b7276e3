//! Bounded worker pool for processing runs.

use super::progress::ProgressObserver;
use crate::core::Stage;
use crate::errors::{ContractViolation, FlowError, Result};
use crate::run::{Run, RunFailure};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info_span, Instrument};

/// Result of processing one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// The run index.
    pub index: usize,
    /// The run label.
    pub label: String,
    /// The stage reached.
    pub stage: Stage,
    /// Failure details, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl RunOutcome {
    /// Returns true if the run failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Outcomes of all runs of a session, ordered by run index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    /// Per-run outcomes.
    pub runs: Vec<RunOutcome>,
}

impl SessionOutcome {
    /// Returns the runs that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &RunOutcome> {
        self.runs.iter().filter(|o| !o.is_failure())
    }

    /// Returns the runs that failed.
    pub fn failed(&self) -> impl Iterator<Item = &RunOutcome> {
        self.runs.iter().filter(|o| o.is_failure())
    }

    /// Returns true if any run failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.runs.iter().any(RunOutcome::is_failure)
    }

    /// Returns the fraction of successful runs (1.0 for no runs).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.runs.is_empty() {
            return 1.0;
        }
        self.succeeded().count() as f64 / self.runs.len() as f64
    }
}

/// Advances every run to `until` using `min(workers, runs)` tasks.
///
/// Workers claim runs through a shared cursor, so each run is advanced
/// exactly once and by exactly one worker. Errors and panics of one run are
/// recorded in its outcome and do not affect the others.
///
/// # Errors
///
/// Returns [`FlowError::InvalidWorkers`] for zero workers and
/// [`FlowError::Internal`] if a worker task could not be joined.
pub async fn process_runs(
    runs: &[Arc<Run>],
    until: Stage,
    workers: usize,
    progress: Arc<dyn ProgressObserver>,
) -> Result<SessionOutcome> {
    if workers == 0 {
        return Err(FlowError::InvalidWorkers(workers));
    }
    let runs: Arc<Vec<Arc<Run>>> = Arc::new(runs.to_vec());
    let total = runs.len();
    let cursor = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let count = workers.min(total).max(1);
    debug!(workers = count, runs = total, until = %until, "Starting workers");

    let mut handles = Vec::with_capacity(count);
    for worker in 0..count {
        let runs = Arc::clone(&runs);
        let cursor = Arc::clone(&cursor);
        let finished = Arc::clone(&finished);
        let progress = Arc::clone(&progress);
        let task = async move {
            let mut outcomes = Vec::new();
            loop {
                let next = cursor.fetch_add(1, Ordering::AcqRel);
                let Some(run) = runs.get(next) else {
                    break;
                };
                let outcome = process_one(run, until).await;
                let done = finished.fetch_add(1, Ordering::AcqRel) + 1;
                progress.run_finished(&outcome, done, total);
                outcomes.push(outcome);
            }
            outcomes
        };
        handles.push(tokio::spawn(task.instrument(info_span!("worker", worker))));
    }

    let mut outcomes = Vec::with_capacity(total);
    for joined in futures::future::join_all(handles).await {
        let batch = joined.map_err(|err| FlowError::Internal(format!("worker task failed: {err}")))?;
        outcomes.extend(batch);
    }
    outcomes.sort_by_key(|outcome| outcome.index);
    Ok(SessionOutcome { runs: outcomes })
}

async fn process_one(run: &Run, until: Stage) -> RunOutcome {
    let failure = match AssertUnwindSafe(run.advance(until)).catch_unwind().await {
        Ok(Ok(_)) => None,
        Ok(Err(err @ FlowError::Contract(ContractViolation::Reentrant { .. }))) => {
            Some(RunFailure::new(run.stage(), &err))
        }
        Ok(Err(err)) => Some(
            run.failure()
                .unwrap_or_else(|| RunFailure::new(run.stage(), &err)),
        ),
        Err(payload) => {
            let stage = Stage::pending(run.stage(), until)
                .first()
                .copied()
                .unwrap_or_else(|| run.stage());
            let failure = RunFailure {
                stage,
                kind: "panic".into(),
                message: panic_message(payload.as_ref()),
            };
            error!(run = %run.label(), stage = %stage, "Run panicked: {}", failure.message);
            run.record_failure(failure.clone());
            Some(failure)
        }
    };
    RunOutcome {
        index: run.index(),
        label: run.label().to_string(),
        stage: run.stage(),
        failure,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
