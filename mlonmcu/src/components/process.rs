//! Collaborators backed by external processes.
//!
//! Command lines are templates; `{name}` placeholders are replaced before the
//! process is spawned. Supported placeholders depend on the role:
//!
//! | role     | placeholders                 |
//! |----------|------------------------------|
//! | backend  | `{model}`, `{out}`, `{dir}`  |
//! | platform | `{src}`, `{jobs}`, `{dir}`   |
//! | target   | `{exe}`, `{dir}`             |
//!
//! Each collaborator also appends the list option `<name>.extra_args` from
//! the run configuration to its command line.

use super::{Backend, Platform, StageContext, Target};
use crate::core::{Artifact, ArtifactFormat, TableRow};
use crate::errors::{CollaboratorError, CollaboratorKind};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Pattern used to extract the cycle count from simulator output.
pub const DEFAULT_CYCLES_PATTERN: &str = r"(?i)total cycles:\s*(\d+)";

fn expand(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

fn extra_args(ctx: &StageContext<'_>, component: &str) -> Vec<String> {
    ctx.options(component).get_list("extra_args").unwrap_or_default()
}

async fn run_command(
    kind: CollaboratorKind,
    name: &str,
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Option<Duration>,
) -> Result<String, CollaboratorError> {
    let fail = |message: String| CollaboratorError::new(kind, name, message);

    debug!(%kind, name, program, ?args, cwd = %cwd.display(), "Spawning process");
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.output();
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child)
            .await
            .map_err(|_| fail(format!("'{program}' timed out after {}s", limit.as_secs())))?,
        None => child.await,
    }
    .map_err(|err| fail(format!("failed to spawn '{program}': {err}")))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        let tail: Vec<&str> = text.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        return Err(fail(format!(
            "'{program}' exited with {}: {}",
            output.status,
            tail.join(" | ")
        )));
    }
    Ok(text)
}

fn source_format(path: &Path) -> ArtifactFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("tar") => ArtifactFormat::Mlf,
        Some("c" | "cc" | "cpp" | "h" | "hpp") => ArtifactFormat::Source,
        Some("txt" | "log" | "json") => ArtifactFormat::Text,
        _ => ArtifactFormat::Raw,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Backend running a code generator command.
///
/// Every file the generator leaves in the output directory becomes a BUILD
/// artifact. The generator's console output is kept as an optional log.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    name: String,
    program: String,
    args: Vec<String>,
    output_dir: String,
    model: Option<PathBuf>,
}

impl CommandBackend {
    /// Creates a backend running `program`.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            output_dir: "codegen".to_string(),
            model: None,
        }
    }

    /// Sets the argument templates.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the output directory, relative to the run directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = dir.into();
        self
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_model(&mut self, _ctx: &StageContext<'_>, model: &Path) -> Result<(), CollaboratorError> {
        tokio::fs::metadata(model).await.map_err(|err| {
            CollaboratorError::backend(&self.name, format!("{}: {err}", model.display()))
        })?;
        self.model = Some(model.to_path_buf());
        Ok(())
    }

    async fn generate_code(&mut self, ctx: &StageContext<'_>) -> Result<Vec<Artifact>, CollaboratorError> {
        let fail = |message: String| CollaboratorError::backend(&self.name, message);
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| fail("no model loaded".to_string()))?;
        let out = ctx.working_dir.join(&self.output_dir);
        tokio::fs::create_dir_all(&out)
            .await
            .map_err(|err| fail(format!("{}: {err}", out.display())))?;

        let vars = [
            ("model", model.display().to_string()),
            ("out", out.display().to_string()),
            ("dir", ctx.working_dir.display().to_string()),
        ];
        let mut args: Vec<String> = self.args.iter().map(|arg| expand(arg, &vars)).collect();
        args.extend(extra_args(ctx, &self.name));

        let log = run_command(
            CollaboratorKind::Backend,
            &self.name,
            &self.program,
            &args,
            ctx.working_dir,
            None,
        )
        .await?;

        let mut entries = tokio::fs::read_dir(&out)
            .await
            .map_err(|err| fail(format!("{}: {err}", out.display())))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| fail(err.to_string()))?
        {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(fail(format!("no files generated in {}", out.display())));
        }

        let mut artifacts = Vec::with_capacity(files.len() + 1);
        for path in files {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|err| fail(format!("{}: {err}", path.display())))?;
            artifacts.push(Artifact::bytes(file_name(&path), bytes, source_format(&path)));
        }
        artifacts.push(
            Artifact::text(format!("{}_out.log", self.name), log, ArtifactFormat::Text).optional(),
        );
        Ok(artifacts)
    }

    fn box_clone(&self) -> Box<dyn Backend> {
        Box::new(Self {
            model: None,
            ..self.clone()
        })
    }
}

/// Platform running a build command.
///
/// The command runs inside the directory holding the exported BUILD
/// artifacts and must leave the program at `executable` (relative paths are
/// resolved against that directory).
#[derive(Debug, Clone)]
pub struct CommandPlatform {
    name: String,
    program: String,
    args: Vec<String>,
    executable: PathBuf,
}

impl CommandPlatform {
    /// Creates a platform running `program` and collecting `executable`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        executable: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            executable: executable.into(),
        }
    }

    /// Sets the argument templates.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl Platform for CommandPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn compile(
        &self,
        ctx: &StageContext<'_>,
        src_dir: &Path,
        parallelism: usize,
    ) -> Result<Artifact, CollaboratorError> {
        let vars = [
            ("src", src_dir.display().to_string()),
            ("jobs", parallelism.max(1).to_string()),
            ("dir", ctx.working_dir.display().to_string()),
        ];
        let mut args: Vec<String> = self.args.iter().map(|arg| expand(arg, &vars)).collect();
        args.extend(extra_args(ctx, &self.name));
        // Compile features append cmake defines here.
        args.extend(
            ctx.options(&self.name)
                .get_list("extra_cmake_args")
                .unwrap_or_default(),
        );

        run_command(
            CollaboratorKind::Platform,
            &self.name,
            &self.program,
            &args,
            src_dir,
            None,
        )
        .await?;

        let path = src_dir.join(&self.executable);
        let bytes = tokio::fs::read(&path).await.map_err(|err| {
            CollaboratorError::platform(&self.name, format!("{}: {err}", path.display()))
        })?;
        Ok(Artifact::bytes(file_name(&path), bytes, ArtifactFormat::Executable))
    }
}

/// Target executing a program, optionally through a simulator.
///
/// The cycle count is extracted from the combined console output with a
/// regular expression whose first capture group holds the number. The
/// pattern and a timeout in seconds may be overridden through the
/// `<name>.cycles_pattern` and `<name>.timeout` options.
#[derive(Debug, Clone)]
pub struct CommandTarget {
    name: String,
    simulator: Option<String>,
    args: Vec<String>,
    cycles_pattern: String,
    timeout: Option<Duration>,
}

impl CommandTarget {
    /// Creates a target that runs programs natively.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            simulator: None,
            args: Vec::new(),
            cycles_pattern: DEFAULT_CYCLES_PATTERN.to_string(),
            timeout: None,
        }
    }

    /// Runs programs through a simulator. The program path is passed as
    /// `{exe}` or appended when no argument mentions it.
    #[must_use]
    pub fn with_simulator(mut self, simulator: impl Into<String>) -> Self {
        self.simulator = Some(simulator.into());
        self
    }

    /// Sets the argument templates.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the cycle count pattern.
    pub fn with_cycles_pattern(mut self, pattern: impl Into<String>) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        Regex::new(&pattern)?;
        self.cycles_pattern = pattern;
        Ok(self)
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Target for CommandTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        executable: &Path,
    ) -> Result<Vec<Artifact>, CollaboratorError> {
        let options = ctx.options(&self.name);
        let pattern = options
            .get_str("cycles_pattern")
            .unwrap_or_else(|| self.cycles_pattern.clone());
        let cycles = Regex::new(&pattern).map_err(|err| {
            CollaboratorError::target(&self.name, format!("invalid cycles pattern: {err}"))
        })?;
        let timeout = options
            .get_u64("timeout")
            .map(Duration::from_secs)
            .or(self.timeout);

        let exe = executable.display().to_string();
        let vars = [("exe", exe.clone()), ("dir", ctx.working_dir.display().to_string())];
        let mut args: Vec<String> = self.args.iter().map(|arg| expand(arg, &vars)).collect();
        let program = match &self.simulator {
            Some(simulator) => {
                if !self.args.iter().any(|arg| arg.contains("{exe}")) {
                    args.push(exe);
                }
                simulator.clone()
            }
            None => exe,
        };
        args.extend(extra_args(ctx, &self.name));

        let started = Instant::now();
        let output = run_command(
            CollaboratorKind::Target,
            &self.name,
            &program,
            &args,
            ctx.working_dir,
            timeout,
        )
        .await?;
        let runtime = started.elapsed().as_secs_f64();

        let mut row = TableRow::new();
        match cycles
            .captures(&output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            Some(count) => {
                row.insert("Cycles".to_string(), json!(count));
            }
            None => warn!(run = ctx.run, target = %self.name, "No cycle count found in output"),
        }
        row.insert("Runtime [s]".to_string(), json!(runtime));

        Ok(vec![
            Artifact::table("metrics.csv", vec![row]),
            Artifact::text(format!("{}_out.log", self.name), output, ArtifactFormat::Text).optional(),
        ])
    }
}
