//! Progress observers for session processing.

use super::scheduler::RunOutcome;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};

/// Receives a notification after each run finished processing.
///
/// Observers are called from worker tasks and must not block. They never
/// influence scheduling.
pub trait ProgressObserver: Send + Sync {
    /// Called once per run with the number of finished runs so far.
    fn run_finished(&self, outcome: &RunOutcome, finished: usize, total: usize);
}

/// An observer that ignores all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgress;

impl ProgressObserver for NoOpProgress {
    fn run_finished(&self, _outcome: &RunOutcome, _finished: usize, _total: usize) {}
}

/// An observer that logs each finished run.
#[derive(Debug, Clone)]
pub struct LoggingProgress {
    level: Level,
}

impl Default for LoggingProgress {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingProgress {
    /// Creates a logging observer with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging observer.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl ProgressObserver for LoggingProgress {
    fn run_finished(&self, outcome: &RunOutcome, finished: usize, total: usize) {
        if let Some(failure) = &outcome.failure {
            warn!(
                run = %outcome.label,
                stage = %failure.stage,
                "[{finished}/{total}] Run failed: {}",
                failure.message
            );
        } else if self.level == Level::DEBUG {
            debug!(run = %outcome.label, stage = %outcome.stage, "[{finished}/{total}] Run finished");
        } else {
            info!(run = %outcome.label, stage = %outcome.stage, "[{finished}/{total}] Run finished");
        }
    }
}

/// An observer that keeps every notification, for tests.
#[derive(Debug, Default)]
pub struct CollectingProgress {
    outcomes: RwLock<Vec<(RunOutcome, usize, usize)>>,
}

impl CollectingProgress {
    /// Creates a new collecting observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected notifications as (outcome, finished, total).
    #[must_use]
    pub fn notifications(&self) -> Vec<(RunOutcome, usize, usize)> {
        self.outcomes.read().clone()
    }

    /// Returns the number of notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.read().is_empty()
    }
}

impl ProgressObserver for CollectingProgress {
    fn run_finished(&self, outcome: &RunOutcome, finished: usize, total: usize) {
        self.outcomes.write().push((outcome.clone(), finished, total));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;

    fn outcome() -> RunOutcome {
        RunOutcome {
            index: 0,
            label: "[run-0]".into(),
            stage: Stage::Run,
            failure: None,
        }
    }

    #[test]
    fn test_noop_and_logging() {
        NoOpProgress.run_finished(&outcome(), 1, 1);
        LoggingProgress::default().run_finished(&outcome(), 1, 1);
        LoggingProgress::debug().run_finished(&outcome(), 1, 1);
    }

    #[test]
    fn test_collecting() {
        let progress = CollectingProgress::new();
        assert!(progress.is_empty());

        progress.run_finished(&outcome(), 1, 2);

        assert_eq!(progress.len(), 1);
        assert_eq!(progress.notifications()[0].1, 1);
    }
}
