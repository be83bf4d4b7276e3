//! Sessions: batches of runs sharing a directory tree.
//!
//! A session owns its runs and lays out their working directories as
//! `<root>/<session>/runs/<run>`. Runs are processed by a bounded pool of
//! workers (see [`process_runs`]); afterwards the session aggregates a
//! [`Report`] with one row per run.

mod integration_tests;
mod lock;
mod progress;
mod scheduler;

pub use lock::{SessionLock, LOCK_FILE};
pub use progress::{CollectingProgress, LoggingProgress, NoOpProgress, ProgressObserver};
pub use scheduler::{process_runs, RunOutcome, SessionOutcome};

use crate::core::Stage;
use crate::errors::{FlowError, Result};
use crate::feature::ConfigResolver;
use crate::report::{Postprocess, Report};
use crate::run::{Run, RunBuilder};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument};

/// A batch of runs processed together.
#[derive(Debug)]
pub struct Session {
    index: usize,
    dir: PathBuf,
    resolver: Arc<ConfigResolver>,
    runs: Vec<Arc<Run>>,
    created_at: DateTime<Utc>,
    lock: Option<SessionLock>,
}

impl Session {
    /// Creates session `index` below `root`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the session directory can not be created.
    pub fn new(index: usize, root: impl AsRef<Path>, resolver: Arc<ConfigResolver>) -> Result<Self> {
        let dir = root.as_ref().join(index.to_string());
        fs::create_dir_all(dir.join("runs"))?;
        debug!(session = index, dir = %dir.display(), "Created session");
        Ok(Self {
            index,
            dir,
            resolver,
            runs: Vec::new(),
            created_at: Utc::now(),
            lock: None,
        })
    }

    /// Creates a session with the next free index below `root`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if `root` can not be read or created.
    pub fn create_next(root: impl AsRef<Path>, resolver: Arc<ConfigResolver>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let mut next = 0;
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if let Some(index) = entry.file_name().to_str().and_then(|n| n.parse::<usize>().ok()) {
                next = next.max(index + 1);
            }
        }
        Self::new(next, root, resolver)
    }

    /// Locks the environment directory `env_dir` for the session's lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::LockUnavailable`] if another session holds it.
    pub fn with_lock(mut self, env_dir: &Path) -> Result<Self> {
        self.lock = Some(SessionLock::acquire(env_dir)?);
        Ok(self)
    }

    /// Returns the session index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the session directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the working directory of run `index`.
    #[must_use]
    pub fn run_dir(&self, index: usize) -> PathBuf {
        self.dir.join("runs").join(index.to_string())
    }

    /// Returns the resolver used for new runs.
    #[must_use]
    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.resolver
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns true if the session holds an environment lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Returns the runs in creation order.
    #[must_use]
    pub fn runs(&self) -> &[Arc<Run>] {
        &self.runs
    }

    /// Returns a run by index.
    #[must_use]
    pub fn run(&self, index: usize) -> Option<&Arc<Run>> {
        self.runs.get(index)
    }

    /// Returns the number of runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if the session has no runs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Builds a run from `builder` and adds it to the session.
    ///
    /// The run gets the next index and a directory below the session.
    ///
    /// # Errors
    ///
    /// Returns feature resolution and IO errors.
    pub fn add_run(&mut self, builder: RunBuilder) -> Result<Arc<Run>> {
        let index = self.runs.len();
        let run = builder
            .index(index)
            .session(self.index)
            .working_dir(self.run_dir(index))
            .build(&self.resolver)?;
        let run = Arc::new(run);
        self.runs.push(Arc::clone(&run));
        Ok(run)
    }

    /// Adds an independent copy of run `index` to the session.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Internal`] for an unknown index and a reentrancy
    /// error while the source run is active.
    pub fn duplicate_run(&mut self, index: usize) -> Result<Arc<Run>> {
        let source = self
            .runs
            .get(index)
            .ok_or_else(|| FlowError::Internal(format!("session has no run {index}")))?;
        let new_index = self.runs.len();
        let copy = source.duplicate_with(new_index, Some(self.index), Some(self.run_dir(new_index)))?;
        let copy = Arc::new(copy);
        self.runs.push(Arc::clone(&copy));
        Ok(copy)
    }

    /// Advances all runs to `until` with `workers` parallel workers.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidWorkers`] for zero workers. Run failures
    /// are reported in the outcome, not as errors.
    pub async fn process_runs(
        &self,
        until: Stage,
        workers: usize,
        progress: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<SessionOutcome> {
        let progress = progress.unwrap_or_else(|| Arc::new(NoOpProgress));
        info!(
            session = self.index,
            runs = self.runs.len(),
            workers,
            "Processing all runs until stage {until}"
        );
        let outcome = process_runs(&self.runs, until, workers, progress)
            .instrument(info_span!("session", session = self.index))
            .await?;
        info!(
            session = self.index,
            failed = outcome.failed().count(),
            "Done processing runs"
        );
        Ok(outcome)
    }

    /// Exports every run, honouring each run's `run.export_optional` flag.
    ///
    /// # Errors
    ///
    /// Returns the first reentrancy or IO error.
    pub fn export_runs(&self) -> Result<Vec<PathBuf>> {
        self.runs
            .iter()
            .map(|run| run.export(run.export_optional()))
            .collect()
    }

    /// Collects one row per run and applies session post-processes in order.
    ///
    /// Runs without a result contribute a partial row.
    ///
    /// # Errors
    ///
    /// Returns the first post-process error.
    pub fn report(&self, postprocesses: &[Arc<dyn Postprocess>]) -> Result<Report> {
        let mut report = Report::from_rows(self.runs.iter().map(|run| run.result_or_partial()).collect());
        for postprocess in postprocesses {
            debug!(session = self.index, postprocess = postprocess.name(), "Applying postprocess");
            postprocess.post_session(&mut report)?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_run;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_directory_tree() {
        let root = tempfile::tempdir().unwrap();
        let mut session = Session::new(3, root.path(), Arc::default()).unwrap();

        let run = session.add_run(fake_run("aww", 1)).unwrap();

        assert_eq!(run.dir(), root.path().join("3").join("runs").join("0"));
        assert_eq!(run.label(), "[session-3] [run-0]");
        assert!(run.dir().is_dir());
    }

    #[test]
    fn test_create_next_index() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("4")).unwrap();
        fs::create_dir_all(root.path().join("latest")).unwrap();

        let session = Session::create_next(root.path(), Arc::default()).unwrap();

        assert_eq!(session.index(), 5);
    }

    #[test]
    fn test_duplicate_run() {
        let root = tempfile::tempdir().unwrap();
        let mut session = Session::new(0, root.path(), Arc::default()).unwrap();
        session.add_run(fake_run("aww", 1)).unwrap();

        let copy = session.duplicate_run(0).unwrap();

        assert_eq!(copy.index(), 1);
        assert_eq!(session.len(), 2);
        assert!(session.duplicate_run(9).is_err());
    }

    #[test]
    fn test_locked_session() {
        let root = tempfile::tempdir().unwrap();
        let env = tempfile::tempdir().unwrap();

        let first = Session::new(0, root.path(), Arc::default())
            .unwrap()
            .with_lock(env.path())
            .unwrap();
        let second = Session::new(1, root.path(), Arc::default())
            .unwrap()
            .with_lock(env.path());

        assert!(first.is_locked());
        assert!(matches!(second, Err(FlowError::LockUnavailable { .. })));
        drop(first);
        assert!(Session::new(2, root.path(), Arc::default())
            .unwrap()
            .with_lock(env.path())
            .is_ok());
    }
}
