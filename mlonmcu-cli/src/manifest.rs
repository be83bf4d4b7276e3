//! Session manifests.
//!
//! A manifest describes the runs of one session as the cartesian product of
//! its models, backends and targets. Collaborators are process-backed: the
//! backend, platform and target run external commands.

use anyhow::{bail, Context};
use mlonmcu::components::{
    CommandBackend, CommandPlatform, CommandTarget, FileFrontend, ModelRef,
};
use mlonmcu::core::Config;
use mlonmcu::report::{builtin_postprocess, Postprocess};
use mlonmcu::run::{Run, RunBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Code generator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSpec {
    /// Backend name (`tvmaot`, `tflmi`, ...).
    pub name: String,
    /// Program to run.
    pub program: String,
    /// Argument templates (`{model}`, `{out}`, `{dir}`).
    #[serde(default)]
    pub args: Vec<String>,
    /// Output directory relative to the run directory.
    #[serde(default)]
    pub output_dir: Option<String>,
}

/// Build command producing the target executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformSpec {
    /// Platform name.
    pub name: String,
    /// Program to run.
    pub program: String,
    /// Argument templates (`{src}`, `{jobs}`, `{dir}`).
    #[serde(default)]
    pub args: Vec<String>,
    /// Path of the produced executable, relative to the run directory.
    pub executable: PathBuf,
}

/// Program execution on a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    /// Target name.
    pub name: String,
    /// Simulator running the executable.
    #[serde(default)]
    pub simulator: Option<String>,
    /// Argument templates (`{exe}`, `{dir}`).
    #[serde(default)]
    pub args: Vec<String>,
    /// Regex with one capture group for the cycle count.
    #[serde(default)]
    pub cycles_pattern: Option<String>,
    /// Execution timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Description of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Models to process.
    pub models: Vec<ModelRef>,
    /// Frontend name.
    #[serde(default = "default_frontend")]
    pub frontend: String,
    /// Framework name.
    #[serde(default)]
    pub framework: Option<String>,
    /// Backends, one run per backend and model.
    #[serde(default)]
    pub backends: Vec<BackendSpec>,
    /// Platform used for COMPILE.
    #[serde(default)]
    pub platform: Option<PlatformSpec>,
    /// Targets, one run per target and model.
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    /// Features attached to every run.
    #[serde(default)]
    pub features: Vec<String>,
    /// Configuration shared by every run.
    #[serde(default)]
    pub config: Config,
    /// Session post-processes, applied to the report in order.
    #[serde(default)]
    pub postprocesses: Vec<String>,
    /// Post-processes attached to every run.
    #[serde(default)]
    pub run_postprocesses: Vec<String>,
}

fn default_frontend() -> String {
    "tflite".to_string()
}

impl Manifest {
    /// Loads a manifest. Relative model paths are resolved against the
    /// manifest's directory.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let mut manifest: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        if let Some(base) = path.parent() {
            manifest.resolve_paths(base);
        }
        Ok(manifest)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for model in &mut self.models {
            for file in &mut model.paths {
                if file.is_relative() {
                    *file = base.join(&*file);
                }
            }
        }
    }

    /// Creates one run builder per (model, backend, target) combination.
    pub fn run_builders(&self, base: &Config, parallelism: usize) -> anyhow::Result<Vec<RunBuilder>> {
        if self.models.is_empty() {
            bail!("manifest lists no models");
        }
        let config = base.clone().merged(&self.config);
        let run_postprocesses = build_postprocesses(&self.run_postprocesses, &config)?;
        let backends: Vec<Option<&BackendSpec>> = optional_items(&self.backends);
        let targets: Vec<Option<&TargetSpec>> = optional_items(&self.targets);

        let mut builders = Vec::new();
        for model in &self.models {
            for backend in &backends {
                for target in &targets {
                    let mut builder = Run::builder(model.clone())
                        .frontend(Arc::new(FileFrontend::new(&self.frontend)))
                        .config(&config)
                        .parallelism(parallelism);
                    if let Some(framework) = &self.framework {
                        builder = builder.framework(framework);
                    }
                    if let Some(spec) = backend {
                        builder = builder.backend(Box::new(command_backend(spec)));
                    }
                    if let Some(spec) = &self.platform {
                        builder = builder.platform(Arc::new(
                            CommandPlatform::new(&spec.name, &spec.program, &spec.executable)
                                .with_args(&spec.args),
                        ));
                    }
                    if let Some(spec) = target {
                        builder = builder.target(Arc::new(command_target(spec)?));
                    }
                    for feature in &self.features {
                        builder = builder.feature(feature);
                    }
                    for postprocess in &run_postprocesses {
                        builder = builder.postprocess(Arc::clone(postprocess));
                    }
                    builders.push(builder);
                }
            }
        }
        Ok(builders)
    }

    /// Creates the session post-processes.
    pub fn session_postprocesses(&self, base: &Config) -> anyhow::Result<Vec<Arc<dyn Postprocess>>> {
        let config = base.clone().merged(&self.config);
        build_postprocesses(&self.postprocesses, &config)
    }
}

fn build_postprocesses(names: &[String], config: &Config) -> anyhow::Result<Vec<Arc<dyn Postprocess>>> {
    names
        .iter()
        .map(|name| {
            builtin_postprocess(name, config).with_context(|| format!("creating postprocess '{name}'"))
        })
        .collect()
}

fn optional_items<T>(items: &[T]) -> Vec<Option<&T>> {
    if items.is_empty() {
        vec![None]
    } else {
        items.iter().map(Some).collect()
    }
}

fn command_backend(spec: &BackendSpec) -> CommandBackend {
    let backend = CommandBackend::new(&spec.name, &spec.program).with_args(&spec.args);
    match &spec.output_dir {
        Some(dir) => backend.with_output_dir(dir),
        None => backend,
    }
}

fn command_target(spec: &TargetSpec) -> anyhow::Result<CommandTarget> {
    let mut target = CommandTarget::new(&spec.name).with_args(&spec.args);
    if let Some(simulator) = &spec.simulator {
        target = target.with_simulator(simulator);
    }
    if let Some(pattern) = &spec.cycles_pattern {
        target = target
            .with_cycles_pattern(pattern)
            .with_context(|| format!("invalid cycles pattern for target '{}'", spec.name))?;
    }
    if let Some(secs) = spec.timeout_secs {
        target = target.with_timeout(Duration::from_secs(secs));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"{
        "models": [
            {"name": "aww", "paths": ["models/aww.tflite"]},
            {"name": "vww", "paths": ["/abs/vww.tflite"]}
        ],
        "framework": "tvm",
        "backends": [
            {"name": "tvmaot", "program": "tvmc", "args": ["compile", "{model}", "-o", "{out}"]},
            {"name": "tvmrt", "program": "tvmc"}
        ],
        "platform": {"name": "mlif", "program": "make", "args": ["-j{jobs}"], "executable": "build/generic_mlif"},
        "targets": [{"name": "host_x86", "timeout_secs": 30}],
        "features": ["debug"],
        "config": {"tvmaot.opt_level": 3},
        "postprocesses": ["features2cols"],
        "run_postprocesses": ["artifact2cols"]
    }"#;

    fn manifest() -> (tempfile::TempDir, Manifest) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, MANIFEST).unwrap();
        let manifest = Manifest::from_file(&path).unwrap();
        (dir, manifest)
    }

    #[test]
    fn test_relative_model_paths() {
        let (dir, manifest) = manifest();
        assert_eq!(
            manifest.models[0].paths[0],
            dir.path().join("models").join("aww.tflite")
        );
        assert_eq!(manifest.models[1].paths[0], PathBuf::from("/abs/vww.tflite"));
        assert_eq!(manifest.frontend, "tflite");
    }

    #[test]
    fn test_cartesian_product() {
        let (_dir, manifest) = manifest();
        let builders = manifest.run_builders(&Config::new(), 2).unwrap();
        assert_eq!(builders.len(), 4);
    }

    #[test]
    fn test_postprocesses() {
        let (_dir, manifest) = manifest();
        let postprocesses = manifest.session_postprocesses(&Config::new()).unwrap();
        assert_eq!(postprocesses[0].name(), "features2cols");

        let broken = Manifest {
            postprocesses: vec!["visualize".into()],
            ..manifest
        };
        assert!(broken.session_postprocesses(&Config::new()).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = serde_json::from_str::<Manifest>(r#"{"models": [], "modles": []}"#).unwrap_err();
        assert!(err.to_string().contains("modles"));
    }

    #[test]
    fn test_no_models() {
        let manifest = Manifest::default();
        assert!(manifest.run_builders(&Config::new(), 1).is_err());
    }
}
