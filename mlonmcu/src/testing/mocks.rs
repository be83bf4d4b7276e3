//! Scripted collaborators.

use crate::components::{Backend, Frontend, ModelRef, Platform, StageContext, Target};
use crate::core::{Artifact, ArtifactFormat, TableRow};
use crate::errors::CollaboratorError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared, append-only list of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    /// Returns all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Returns the number of entries starting with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// A frontend returning an in-memory model named after the model reference.
#[derive(Debug)]
pub struct StaticFrontend {
    name: String,
    extra: Vec<Artifact>,
}

impl StaticFrontend {
    /// Creates a frontend producing `<model>.tflite`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: Vec::new(),
        }
    }

    /// Adds an artifact returned after the model.
    #[must_use]
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.extra.push(artifact);
        self
    }
}

#[async_trait]
impl Frontend for StaticFrontend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_models(
        &self,
        _ctx: &StageContext<'_>,
        model: &ModelRef,
    ) -> Result<Vec<Artifact>, CollaboratorError> {
        let mut artifacts = vec![Artifact::bytes(
            format!("{}.tflite", model.name),
            b"TFL3".to_vec(),
            ArtifactFormat::Model,
        )];
        artifacts.extend(self.extra.iter().cloned());
        Ok(artifacts)
    }
}

/// A backend that records its calls and emits a C source file.
#[derive(Debug)]
pub struct RecordingBackend {
    name: String,
    log: CallLog,
    delay: Option<Duration>,
    loaded: Option<PathBuf>,
}

impl RecordingBackend {
    /// Creates a new recording backend.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: CallLog::new(),
            delay: None,
            loaded: None,
        }
    }

    /// Sleeps for `delay` while loading the model.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns the call log. Clones of the backend share it.
    #[must_use]
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_model(&mut self, ctx: &StageContext<'_>, model: &Path) -> Result<(), CollaboratorError> {
        let file = model
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.log.record(format!("load_model:{} {file}", ctx.run));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !model.exists() {
            return Err(CollaboratorError::backend(
                &self.name,
                format!("model file {} does not exist", model.display()),
            ));
        }
        self.loaded = Some(model.to_path_buf());
        Ok(())
    }

    async fn generate_code(&mut self, ctx: &StageContext<'_>) -> Result<Vec<Artifact>, CollaboratorError> {
        self.log.record(format!("generate_code:{}", ctx.run));
        let stem = self
            .loaded
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| CollaboratorError::backend(&self.name, "no model loaded"))?;
        Ok(vec![
            Artifact::text(
                format!("{stem}.c"),
                "int mlonmcu_run(void) { return 0; }\n",
                ArtifactFormat::Source,
            ),
            Artifact::text(format!("{}_out.log", self.name), "codegen ok\n", ArtifactFormat::Text)
                .optional(),
        ])
    }

    fn box_clone(&self) -> Box<dyn Backend> {
        Box::new(Self {
            name: self.name.clone(),
            log: self.log.clone(),
            delay: self.delay,
            loaded: None,
        })
    }
}

/// A backend that fails, or panics, during code generation.
#[derive(Debug, Clone)]
pub struct FailingBackend {
    name: String,
    message: String,
    panic: bool,
}

impl FailingBackend {
    /// Creates a backend returning a collaborator error.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            panic: false,
        }
    }

    /// Creates a backend that panics instead of returning an error.
    #[must_use]
    pub fn panicking(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: "backend panicked".into(),
            panic: true,
        }
    }
}

#[async_trait]
impl Backend for FailingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_model(&mut self, _ctx: &StageContext<'_>, _model: &Path) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn generate_code(&mut self, _ctx: &StageContext<'_>) -> Result<Vec<Artifact>, CollaboratorError> {
        if self.panic {
            panic!("{}", self.message);
        }
        Err(CollaboratorError::backend(&self.name, &self.message))
    }

    fn box_clone(&self) -> Box<dyn Backend> {
        Box::new(self.clone())
    }
}

/// A platform that returns a fake executable without compiling anything.
#[derive(Debug)]
pub struct FakePlatform {
    name: String,
    jobs: AtomicUsize,
}

impl FakePlatform {
    /// Creates a new fake platform.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: AtomicUsize::new(0),
        }
    }

    /// Returns the parallelism passed to the last compile call.
    #[must_use]
    pub fn last_parallelism(&self) -> usize {
        self.jobs.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn compile(
        &self,
        _ctx: &StageContext<'_>,
        src_dir: &Path,
        parallelism: usize,
    ) -> Result<Artifact, CollaboratorError> {
        if !src_dir.is_dir() {
            return Err(CollaboratorError::platform(
                &self.name,
                format!("source directory {} is missing", src_dir.display()),
            ));
        }
        self.jobs.store(parallelism, Ordering::Release);
        Ok(Artifact::bytes(
            "generic_mlif",
            b"\x7fELF".to_vec(),
            ArtifactFormat::Executable,
        ))
    }
}

/// A target reporting a fixed cycle count.
#[derive(Debug)]
pub struct FakeTarget {
    name: String,
    cycles: u64,
    log: CallLog,
}

impl FakeTarget {
    /// Creates a target reporting `cycles`.
    #[must_use]
    pub fn new(name: impl Into<String>, cycles: u64) -> Self {
        Self {
            name: name.into(),
            cycles,
            log: CallLog::new(),
        }
    }

    /// Returns the call log.
    #[must_use]
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

#[async_trait]
impl Target for FakeTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        executable: &Path,
    ) -> Result<Vec<Artifact>, CollaboratorError> {
        if !executable.exists() {
            return Err(CollaboratorError::target(
                &self.name,
                format!("executable {} does not exist", executable.display()),
            ));
        }
        self.log.record(format!("execute:{}", ctx.run));
        let mut metrics = TableRow::new();
        metrics.insert("Cycles".into(), json!(self.cycles));
        Ok(vec![
            Artifact::table("metrics.csv", vec![metrics]),
            Artifact::text(
                format!("{}_out.log", self.name),
                format!("Total Cycles: {}", self.cycles),
                ArtifactFormat::Text,
            )
            .optional(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Config, Stage};
    use pretty_assertions::assert_eq;

    fn ctx<'a>(dir: &'a Path, config: &'a Config) -> StageContext<'a> {
        StageContext {
            stage: Stage::Build,
            run: "[run-0]",
            working_dir: dir,
            config,
        }
    }

    #[tokio::test]
    async fn test_recording_backend() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("aww.tflite");
        std::fs::write(&model, b"TFL3").unwrap();
        let config = Config::new();
        let mut backend = RecordingBackend::new("tvmaot");
        let log = backend.log();

        backend.load_model(&ctx(dir.path(), &config), &model).await.unwrap();
        let artifacts = backend.generate_code(&ctx(dir.path(), &config)).await.unwrap();

        assert_eq!(artifacts[0].name(), "aww.c");
        assert!(artifacts[1].is_optional());
        assert_eq!(log.entries(), vec!["load_model:[run-0] aww.tflite", "generate_code:[run-0]"]);
    }

    #[tokio::test]
    async fn test_generate_without_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new();
        let mut backend = RecordingBackend::new("tvmaot");

        let err = backend.generate_code(&ctx(dir.path(), &config)).await.unwrap_err();

        assert_eq!(err.name, "tvmaot");
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new();
        let mut backend = FailingBackend::new("tflmi", "boom");

        let err = backend.generate_code(&ctx(dir.path(), &config)).await.unwrap_err();

        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn test_fake_target_reports_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("generic_mlif");
        std::fs::write(&exe, b"\x7fELF").unwrap();
        let config = Config::new();
        let target = FakeTarget::new("etiss_pulpino", 42);

        let artifacts = target.execute(&ctx(dir.path(), &config), &exe).await.unwrap();

        assert_eq!(artifacts[0].as_table().unwrap()[0]["Cycles"], json!(42));
        assert_eq!(artifacts[1].as_text(), Some("Total Cycles: 42"));
        assert_eq!(target.log().count("execute"), 1);
    }
}
