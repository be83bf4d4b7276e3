//! A single pipeline instance.
//!
//! A [`Run`] walks one (model, frontend, framework, backend, target)
//! combination through the stages LOAD, BUILD, COMPILE, RUN and POSTPROCESS.
//! Each handler requires the previous stage to be completed, records the
//! artifacts it produced and moves the current stage forward. The current
//! stage never decreases.
//!
//! All entry points that change a run claim its `active` flag for their whole
//! duration. A second caller observing the flag fails immediately with
//! [`ContractViolation::Reentrant`] and leaves the run untouched.

mod builder;
mod guard;
mod store;

pub use builder::RunBuilder;
pub use store::ArtifactStore;

use crate::components::{Backend, Frontend, ModelRef, Platform, StageContext, Target};
use crate::core::{Artifact, Config, Stage};
use crate::errors::{ContractViolation, FlowError, Result};
use crate::feature::{Components, Feature};
use crate::report::{Postprocess, ReportRow};
use guard::ActiveGuard;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, info_span, warn, Instrument};

/// Config key that makes exports include optional artifacts.
pub const EXPORT_OPTIONAL_KEY: &str = "run.export_optional";

/// Name of the run summary written on export.
pub const RUN_FILE: &str = "run.txt";

/// Details of a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The stage that failed.
    pub stage: Stage,
    /// Error category (`contract`, `backend`, `io`, ...).
    pub kind: String,
    /// Error message.
    pub message: String,
}

impl RunFailure {
    pub(crate) fn new(stage: Stage, error: &FlowError) -> Self {
        Self {
            stage,
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.stage, self.kind, self.message)
    }
}

#[derive(Debug)]
enum WorkingDir {
    Temp(TempDir),
    Managed(PathBuf),
}

impl WorkingDir {
    fn create(dir: Option<PathBuf>) -> io::Result<Self> {
        match dir {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                Ok(Self::Managed(dir))
            }
            None => tempfile::Builder::new()
                .prefix("mlonmcu-run-")
                .tempdir()
                .map(Self::Temp),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Temp(dir) => dir.path(),
            Self::Managed(dir) => dir,
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    stage: Stage,
    artifacts: ArtifactStore,
    result: Option<ReportRow>,
    failure: Option<RunFailure>,
    durations: BTreeMap<Stage, f64>,
}

/// One pipeline instance.
#[derive(Debug)]
pub struct Run {
    index: usize,
    session: Option<usize>,
    label: String,
    model: ModelRef,
    components: Components,
    frontend: Option<Arc<dyn Frontend>>,
    backend: AsyncMutex<Option<Box<dyn Backend>>>,
    platform: Option<Arc<dyn Platform>>,
    target: Option<Arc<dyn Target>>,
    postprocesses: Vec<Arc<dyn Postprocess>>,
    features: Vec<Feature>,
    config: Config,
    parallelism: usize,
    dir: WorkingDir,
    active: AtomicBool,
    state: RwLock<RunState>,
}

impl Run {
    /// Starts building a run for `model`.
    #[must_use]
    pub fn builder(model: ModelRef) -> RunBuilder {
        RunBuilder::new(model)
    }

    fn make_label(session: Option<usize>, index: usize) -> String {
        match session {
            Some(session) => format!("[session-{session}] [run-{index}]"),
            None => format!("[run-{index}]"),
        }
    }

    /// Returns the run index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the index of the owning session.
    #[must_use]
    pub fn session_index(&self) -> Option<usize> {
        self.session
    }

    /// Returns the run label (`[session-0] [run-3]`).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the label followed by a space, for log messages.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("{} ", self.label)
    }

    /// Returns the model reference.
    #[must_use]
    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    /// Returns the component names.
    #[must_use]
    pub fn components(&self) -> &Components {
        &self.components
    }

    /// Returns the platform name.
    #[must_use]
    pub fn platform_name(&self) -> Option<&str> {
        self.platform.as_ref().map(|p| p.name())
    }

    /// Returns the attached features.
    #[must_use]
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Returns the resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the number of compile jobs.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Returns the working directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the highest completed stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.state.read().stage
    }

    /// Returns true while an operation holds the run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns true if the run reached DONE (its POSTPROCESS completed).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.stage() >= Stage::Postprocess
    }

    /// Returns a copy of the artifacts recorded for `stage`.
    #[must_use]
    pub fn artifacts(&self, stage: Stage) -> Vec<Artifact> {
        self.state.read().artifacts.get(stage).to_vec()
    }

    /// Returns a snapshot of the artifact store.
    #[must_use]
    pub fn artifact_store(&self) -> ArtifactStore {
        self.state.read().artifacts.clone()
    }

    /// Returns the result row set by POSTPROCESS.
    #[must_use]
    pub fn result(&self) -> Option<ReportRow> {
        self.state.read().result.clone()
    }

    /// Returns the recorded failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<RunFailure> {
        self.state.read().failure.clone()
    }

    /// Returns the wall-clock duration of each completed stage in seconds.
    #[must_use]
    pub fn durations(&self) -> BTreeMap<Stage, f64> {
        self.state.read().durations.clone()
    }

    /// Returns whether exports include optional artifacts.
    #[must_use]
    pub fn export_optional(&self) -> bool {
        self.config.get_bool(EXPORT_OPTIONAL_KEY).unwrap_or(false)
    }

    /// Records a failure that escaped the stage handlers (a panic).
    pub(crate) fn record_failure(&self, failure: RunFailure) {
        self.state.write().failure = Some(failure);
    }

    fn claim(&self) -> std::result::Result<ActiveGuard<'_>, ContractViolation> {
        ActiveGuard::claim(&self.active, &self.label)
    }

    fn context(&self, stage: Stage) -> StageContext<'_> {
        StageContext {
            stage,
            run: &self.label,
            working_dir: self.dir(),
            config: &self.config,
        }
    }

    /// Processes every pending stage up to `target`.
    ///
    /// `DONE` is treated as `POSTPROCESS`. Returns the stage reached; if no
    /// stage is pending this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first stage error. Artifacts of stages completed before
    /// the failure are kept.
    pub async fn advance(&self, target: Stage) -> Result<Stage> {
        let _guard = self.claim()?;
        let pending = Stage::pending(self.stage(), target);
        if pending.is_empty() {
            debug!("{}Nothing to do until stage {target}", self.prefix());
            return Ok(self.stage());
        }
        info!("{}Processing run until stage {target}: {self}", self.prefix());
        for stage in pending {
            self.execute(stage).await?;
        }
        Ok(self.stage())
    }

    /// Advances to `until` and optionally exports the run afterwards.
    ///
    /// Optional artifacts are included when `run.export_optional` is set.
    ///
    /// # Errors
    ///
    /// Returns stage and export errors.
    pub async fn process(&self, until: Stage, export: bool) -> Result<Stage> {
        let reached = self.advance(until).await?;
        if export {
            self.export(self.export_optional())?;
        }
        Ok(reached)
    }

    /// Runs the LOAD handler.
    ///
    /// # Errors
    ///
    /// Returns contract and frontend errors.
    pub async fn load(&self) -> Result<()> {
        self.handle(Stage::Load).await
    }

    /// Runs the BUILD handler.
    ///
    /// # Errors
    ///
    /// Returns contract and backend errors.
    pub async fn build(&self) -> Result<()> {
        self.handle(Stage::Build).await
    }

    /// Runs the COMPILE handler.
    ///
    /// # Errors
    ///
    /// Returns contract and platform errors.
    pub async fn compile(&self) -> Result<()> {
        self.handle(Stage::Compile).await
    }

    /// Runs the RUN handler.
    ///
    /// # Errors
    ///
    /// Returns contract and target errors.
    pub async fn run(&self) -> Result<()> {
        self.handle(Stage::Run).await
    }

    /// Runs the POSTPROCESS handler.
    ///
    /// # Errors
    ///
    /// Returns contract and post-process errors.
    pub async fn postprocess(&self) -> Result<()> {
        self.handle(Stage::Postprocess).await
    }

    async fn handle(&self, stage: Stage) -> Result<()> {
        let _guard = self.claim()?;
        self.execute(stage).await
    }

    /// Executes one handler while the run is claimed.
    async fn execute(&self, stage: Stage) -> Result<()> {
        let started = Instant::now();
        let span = info_span!("stage", run = %self.label, stage = %stage);
        let outcome = self.dispatch(stage).instrument(span).await;
        let elapsed = started.elapsed().as_secs_f64();

        let mut state = self.state.write();
        match outcome {
            Ok(artifacts) => {
                state.artifacts.record(stage, artifacts);
                state.stage = state.stage.max(stage);
                state.durations.insert(stage, elapsed);
                state.failure = None;
                drop(state);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let duration_ms = (elapsed * 1000.0) as u64;
                info!(run = %self.label, stage = %stage, duration_ms, "Stage completed");
                Ok(())
            }
            Err(err) => {
                let failure = RunFailure::new(stage, &err);
                state.failure = Some(failure.clone());
                drop(state);
                warn!(
                    run = %self.label,
                    stage = %stage,
                    kind = %failure.kind,
                    "Stage failed: {}",
                    failure.message
                );
                Err(err)
            }
        }
    }

    async fn dispatch(&self, stage: Stage) -> Result<Vec<Artifact>> {
        self.check_precondition(stage)?;
        debug!("{}Processing stage {stage}", self.prefix());
        match stage {
            Stage::Load => self.handle_load().await,
            Stage::Build => self.handle_build().await,
            Stage::Compile => self.handle_compile().await,
            Stage::Run => self.handle_run().await,
            Stage::Postprocess => self.handle_postprocess().await,
            Stage::Nop | Stage::Done => Err(FlowError::Internal(format!(
                "stage {stage} has no handler"
            ))),
        }
    }

    fn check_precondition(&self, stage: Stage) -> std::result::Result<(), ContractViolation> {
        let current = self.stage();
        match stage.previous() {
            Some(required) if current < required => Err(ContractViolation::PreconditionNotMet {
                stage,
                required,
                current,
            }),
            _ => Ok(()),
        }
    }

    async fn handle_load(&self) -> Result<Vec<Artifact>> {
        let frontend = self
            .frontend
            .as_ref()
            .ok_or_else(|| missing_component("frontend", Stage::Load))?;
        let artifacts = frontend
            .generate_models(&self.context(Stage::Load), &self.model)
            .await?;
        if artifacts.is_empty() {
            return Err(ContractViolation::MissingArtifact { stage: Stage::Load }.into());
        }
        Ok(artifacts)
    }

    async fn handle_build(&self) -> Result<Vec<Artifact>> {
        let model = self
            .export_inputs(Stage::Load, true)?
            .ok_or(ContractViolation::MissingArtifact { stage: Stage::Load })?;
        let mut backend = self.backend.lock().await;
        let backend = backend
            .as_mut()
            .ok_or_else(|| missing_component("backend", Stage::Build))?;
        let ctx = self.context(Stage::Build);
        backend.load_model(&ctx, &model).await?;
        Ok(backend.generate_code(&ctx).await?)
    }

    async fn handle_compile(&self) -> Result<Vec<Artifact>> {
        self.export_inputs(Stage::Build, false)?;
        let platform = self
            .platform
            .as_ref()
            .ok_or_else(|| missing_component("platform", Stage::Compile))?;
        let executable = platform
            .compile(&self.context(Stage::Compile), self.dir(), self.parallelism)
            .await?;
        Ok(vec![executable])
    }

    async fn handle_run(&self) -> Result<Vec<Artifact>> {
        let executable = self
            .export_inputs(Stage::Compile, true)?
            .ok_or(ContractViolation::MissingArtifact {
                stage: Stage::Compile,
            })?;
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| missing_component("target", Stage::Run))?;
        Ok(target
            .execute(&self.context(Stage::Run), &executable)
            .await?)
    }

    async fn handle_postprocess(&self) -> Result<Vec<Artifact>> {
        self.export_inputs(Stage::Run, false)?;
        let artifacts: Vec<Artifact> = self.state.read().artifacts.iter().cloned().collect();
        let mut row = self.report_row();
        let mut produced = Vec::new();
        for postprocess in &self.postprocesses {
            debug!("{}Running postprocess '{}'", self.prefix(), postprocess.name());
            produced.extend(postprocess.post_run(&mut row, &artifacts)?);
        }
        self.state.write().result = Some(row);
        Ok(produced)
    }

    /// Exports the output of `stage` as input for the next handler and, if
    /// `primary` is set, returns the path of its first artifact.
    fn export_inputs(&self, stage: Stage, primary: bool) -> io::Result<Option<PathBuf>> {
        let mut state = self.state.write();
        state.artifacts.export_stage(stage, self.dir(), false, false)?;
        if primary {
            state.artifacts.export_primary(stage, self.dir())
        } else {
            Ok(None)
        }
    }

    /// Writes the artifacts of `stage` into the working directory.
    ///
    /// # Errors
    ///
    /// Returns a reentrancy error while the run is active, or an IO error.
    pub fn export_stage(&self, stage: Stage, include_optional: bool, subdir: bool) -> Result<Vec<PathBuf>> {
        let _guard = self.claim()?;
        let written = self
            .state
            .write()
            .artifacts
            .export_stage(stage, self.dir(), include_optional, subdir)?;
        Ok(written)
    }

    /// Exports every completed stage and writes `run.txt`.
    ///
    /// # Errors
    ///
    /// Returns a reentrancy error while the run is active, or an IO error.
    pub fn export(&self, include_optional: bool) -> Result<PathBuf> {
        let _guard = self.claim()?;
        debug!("{}Exporting run to {}", self.prefix(), self.dir().display());
        {
            let mut state = self.state.write();
            for stage in state.artifacts.stages() {
                state
                    .artifacts
                    .export_stage(stage, self.dir(), include_optional, false)?;
            }
        }
        let path = self.dir().join(RUN_FILE);
        fs::write(&path, self.to_string())?;
        Ok(path)
    }

    /// Creates an independent copy with a fresh temporary working directory.
    ///
    /// # Errors
    ///
    /// Returns a reentrancy error while the run is active.
    pub fn duplicate(&self) -> Result<Self> {
        self.duplicate_with(self.index, self.session, None)
    }

    /// Creates an independent copy with a new index and working directory.
    ///
    /// Configuration, features and collaborators are copied; the backend is
    /// cloned. Stage, artifacts, result and failure start fresh.
    ///
    /// # Errors
    ///
    /// Returns a reentrancy error while the run is active, or an IO error if
    /// the directory can not be created.
    pub fn duplicate_with(
        &self,
        index: usize,
        session: Option<usize>,
        dir: Option<PathBuf>,
    ) -> Result<Self> {
        let _guard = self.claim()?;
        let backend = {
            let slot = self
                .backend
                .try_lock()
                .map_err(|_| ContractViolation::Reentrant {
                    run: self.label.clone(),
                })?;
            slot.as_ref().map(|backend| backend.box_clone())
        };
        let label = Self::make_label(session, index);
        debug!("{}Duplicating run as {label}", self.prefix());
        Ok(Self {
            index,
            session,
            label,
            model: self.model.clone(),
            components: self.components.clone(),
            frontend: self.frontend.clone(),
            backend: AsyncMutex::new(backend),
            platform: self.platform.clone(),
            target: self.target.clone(),
            postprocesses: self.postprocesses.clone(),
            features: self.features.clone(),
            config: self.config.clone(),
            parallelism: self.parallelism,
            dir: WorkingDir::create(dir)?,
            active: AtomicBool::new(false),
            state: RwLock::new(RunState::default()),
        })
    }

    /// Builds the report row for the run's current state.
    #[must_use]
    pub fn report_row(&self) -> ReportRow {
        let state = self.state.read();
        let mut row = ReportRow::new();

        row.pre.set("Session", self.session.map_or(Value::Null, Value::from));
        row.pre.set("Run", self.index);
        row.pre.set("Model", self.model.name.clone());
        row.pre.set("Frontend", optional_name(self.components.frontend.as_deref()));
        row.pre.set("Framework", optional_name(self.components.framework.as_deref()));
        row.pre.set("Backend", optional_name(self.components.backend.as_deref()));
        row.pre.set("Target", optional_name(self.components.target.as_deref()));
        row.pre.set("Platform", optional_name(self.platform_name()));

        for artifact in state.artifacts.get(Stage::Run) {
            if let Some(metrics) = artifact.as_table().and_then(|rows| rows.first()) {
                for (column, value) in metrics {
                    row.main.set(column.clone(), value.clone());
                }
            }
        }
        for (stage, seconds) in &state.durations {
            row.main.set(stage.time_column(), *seconds);
        }

        let features: Vec<&str> = self.features.iter().map(Feature::name).collect();
        row.post.set("Features", features);
        row.post.set("Config", self.config.to_json());
        let postprocesses: Vec<&str> = self.postprocesses.iter().map(|p| p.name()).collect();
        row.post.set("Postprocesses", postprocesses);
        if let Some(failure) = &state.failure {
            row.post.set("Failed Stage", failure.stage.as_str());
            row.post.set("Error", failure.message.clone());
        }
        row
    }

    /// Returns the result row, or a partial row if POSTPROCESS did not run.
    #[must_use]
    pub fn result_or_partial(&self) -> ReportRow {
        self.result().unwrap_or_else(|| self.report_row())
    }
}

fn missing_component(kind: &str, stage: Stage) -> ContractViolation {
    ContractViolation::MissingComponent {
        kind: kind.to_string(),
        stage,
    }
}

fn optional_name(name: Option<&str>) -> Value {
    name.map_or(Value::Null, Value::from)
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![self.model.name.clone()];
        for name in [
            &self.components.frontend,
            &self.components.backend,
            &self.components.target,
        ]
        .into_iter()
        .flatten()
        {
            parts.push(name.clone());
        }
        parts.push(self.parallelism.to_string());
        if !self.features.is_empty() {
            let names: Vec<&str> = self.features.iter().map(Feature::name).collect();
            parts.push(format!("[{}]", names.join(", ")));
        }
        if !self.config.is_empty() {
            parts.push(self.config.to_canonical_json());
        }
        write!(f, "Run({})", parts.join(","))
    }
}
