//! Collaborator interfaces driven by a run.
//!
//! A run never knows how a model is parsed, how code is generated or how a
//! program is executed. It talks to four roles through the traits in this
//! module, each call receiving a [`StageContext`] that describes where the
//! run is and how it is configured.

mod frontend;
mod process;

pub use frontend::FileFrontend;
pub use process::{CommandBackend, CommandPlatform, CommandTarget, DEFAULT_CYCLES_PATTERN};

use crate::core::{Artifact, Config, Stage};
use crate::errors::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Information passed to every collaborator call.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    /// The stage being processed.
    pub stage: Stage,
    /// Human-readable run label (`[session-0] [run-3]`).
    pub run: &'a str,
    /// The run's working directory.
    pub working_dir: &'a Path,
    /// The run's resolved configuration.
    pub config: &'a Config,
}

impl StageContext<'_> {
    /// Returns the options of one component with the prefix stripped.
    #[must_use]
    pub fn options(&self, component: &str) -> Config {
        self.config.scoped(component)
    }
}

/// Reference to the model a run processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    /// Model name used in reports.
    pub name: String,
    /// Files belonging to the model (the first one is the primary model).
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl ModelRef {
    /// Creates a model reference without files.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            paths: Vec::new(),
        }
    }

    /// Adds a model file.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Turns a model reference into model artifacts (LOAD).
#[async_trait]
pub trait Frontend: Send + Sync + fmt::Debug {
    /// Returns the frontend name (`tflite`, `onnx`, ...).
    fn name(&self) -> &str;

    /// Produces the model artifacts. The first artifact is the primary model.
    async fn generate_models(
        &self,
        ctx: &StageContext<'_>,
        model: &ModelRef,
    ) -> Result<Vec<Artifact>, CollaboratorError>;
}

/// Generates code for a model (BUILD).
///
/// Backends are stateful: a model is loaded first, code is generated from it
/// afterwards. Every run owns its own backend instance.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Returns the backend name (`tvmaot`, `tflmi`, ...).
    fn name(&self) -> &str;

    /// Loads the exported model file.
    async fn load_model(&mut self, ctx: &StageContext<'_>, model: &Path) -> Result<(), CollaboratorError>;

    /// Generates code for the loaded model.
    async fn generate_code(&mut self, ctx: &StageContext<'_>) -> Result<Vec<Artifact>, CollaboratorError>;

    /// Creates an independent copy for a duplicated run.
    fn box_clone(&self) -> Box<dyn Backend>;
}

impl Clone for Box<dyn Backend> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Compiles target software from generated code (COMPILE).
#[async_trait]
pub trait Platform: Send + Sync + fmt::Debug {
    /// Returns the platform name (`mlif`, ...).
    fn name(&self) -> &str;

    /// Builds the program found in `src_dir` using up to `parallelism` jobs.
    async fn compile(
        &self,
        ctx: &StageContext<'_>,
        src_dir: &Path,
        parallelism: usize,
    ) -> Result<Artifact, CollaboratorError>;
}

/// Executes a compiled program (RUN).
#[async_trait]
pub trait Target: Send + Sync + fmt::Debug {
    /// Returns the target name (`host_x86`, `etiss_pulpino`, ...).
    fn name(&self) -> &str;

    /// Runs the program and returns metric artifacts.
    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        executable: &Path,
    ) -> Result<Vec<Artifact>, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ref() {
        let model = ModelRef::new("aww").with_path("/models/aww.tflite");
        assert_eq!(model.to_string(), "aww");
        assert_eq!(model.paths.len(), 1);

        let parsed: ModelRef = serde_json::from_str(r#"{"name": "vww"}"#).unwrap();
        assert!(parsed.paths.is_empty());
    }

    #[test]
    fn test_context_options() {
        let config = Config::new().with("spike.vlen", 128).with("etiss.fpu", true);
        let dir = PathBuf::from("/tmp/run");
        let ctx = StageContext {
            stage: Stage::Run,
            run: "[run-0]",
            working_dir: &dir,
            config: &config,
        };
        assert_eq!(ctx.options("spike").get_u64("vlen"), Some(128));
        assert_eq!(ctx.options("spike").len(), 1);
    }
}
