//! Command line driver for mlonmcu sessions.
//!
//! ```text
//! mlonmcu flow session.json --until RUN --workers 4 --report report.csv
//! mlonmcu export session.json
//! ```
//!
//! The exit status is non-zero when any run failed.

#![warn(missing_docs)]

mod manifest;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use manifest::Manifest;
use mlonmcu::core::{Config, ConfigValue, Stage};
use mlonmcu::feature::ConfigResolver;
use mlonmcu::session::{LoggingProgress, ProgressObserver, Session};
use mlonmcu::settings::FlowSettings;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// mlonmcu CLI arguments
#[derive(Parser, Debug)]
#[command(name = "mlonmcu")]
#[command(author, version, about = "Run ML-on-MCU benchmarking sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: discover mlonmcu.json upwards from the cwd)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Process the runs of a manifest
    Flow(FlowArgs),
    /// Process the runs of a manifest and export them
    Export(FlowArgs),
}

/// Arguments shared by `flow` and `export`.
#[derive(Args, Debug)]
struct FlowArgs {
    /// Session manifest (JSON)
    manifest: PathBuf,

    /// Stage to process until (NOP, LOAD, BUILD, COMPILE, RUN, POSTPROCESS, DONE)
    #[arg(long)]
    until: Option<Stage>,

    /// Number of parallel workers
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Compile jobs per run
    #[arg(long, short = 'j')]
    parallel: Option<usize>,

    /// Log progress after each run
    #[arg(long)]
    progress: bool,

    /// Export runs after processing
    #[arg(long)]
    export: bool,

    /// Write the report to this file (.csv or .json)
    #[arg(long)]
    report: Option<PathBuf>,

    /// Config override, e.g. `-c tvmaot.opt_level=2`
    #[arg(long = "config", short = 'c', value_parser = parse_assignment)]
    config: Vec<(String, ConfigValue)>,
}

fn parse_assignment(arg: &str) -> Result<(String, ConfigValue), String> {
    Config::parse_assignment(arg).ok_or_else(|| format!("expected key=value, got '{arg}'"))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "mlonmcu=debug" } else { "mlonmcu=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<FlowSettings> {
    let settings = match path {
        Some(path) => FlowSettings::from_file(path)
            .with_context(|| format!("loading settings {}", path.display()))?,
        None => FlowSettings::discover().unwrap_or_default(),
    }
    .with_env_overrides();
    settings.validate()?;
    Ok(settings)
}

/// Processes a manifest. Returns false if any run failed.
async fn flow(settings: &FlowSettings, args: FlowArgs, export: bool) -> anyhow::Result<bool> {
    let manifest = Manifest::from_file(&args.manifest)?;
    let until = args.until.unwrap_or(settings.until);
    let workers = args.workers.unwrap_or(settings.num_workers);
    let parallel = args.parallel.unwrap_or(settings.parallelism);

    let mut base = settings.run_config();
    for (key, value) in args.config {
        base.insert(key, value);
    }

    let resolver = Arc::new(ConfigResolver::default());
    let mut session = Session::create_next(settings.sessions_dir(), resolver)?;
    if settings.lock {
        session = session.with_lock(&settings.home)?;
    }
    for builder in manifest.run_builders(&base, parallel)? {
        session.add_run(builder)?;
    }
    info!(
        session = session.index(),
        runs = session.len(),
        dir = %session.dir().display(),
        "Created session"
    );

    let progress: Option<Arc<dyn ProgressObserver>> = (args.progress || settings.progress)
        .then(|| Arc::new(LoggingProgress::default()) as Arc<dyn ProgressObserver>);
    let outcome = session.process_runs(until, workers, progress).await?;

    if export || args.export || settings.export {
        let written = session.export_runs()?;
        info!(runs = written.len(), "Exported runs to {}", session.dir().display());
    }

    let report = session.report(&manifest.session_postprocesses(&base)?)?;
    match &args.report {
        Some(path) => {
            report.export(path)?;
            info!("Report written to {}", path.display());
        }
        None => print!("{report}"),
    }

    for failed in outcome.failed() {
        if let Some(failure) = &failed.failure {
            warn!("{} {failure}", failed.label);
        }
    }
    Ok(!outcome.has_failures())
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let settings = load_settings(cli.settings.as_ref())?;
    match cli.command {
        Commands::Flow(args) => flow(&settings, args, false).await,
        Commands::Export(args) => flow(&settings, args, true).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_flow() {
        let cli = Cli::try_parse_from([
            "mlonmcu", "flow", "session.json", "--until", "BUILD", "-w", "3", "-c",
            "tvmaot.opt_level=2", "-c", "run.export_optional=true",
        ])
        .unwrap();

        let Commands::Flow(args) = cli.command else {
            panic!("expected flow");
        };
        assert_eq!(args.until, Some(Stage::Build));
        assert_eq!(args.workers, Some(3));
        assert_eq!(
            args.config,
            vec![
                ("tvmaot.opt_level".to_string(), json!(2)),
                ("run.export_optional".to_string(), json!(true)),
            ]
        );
    }

    #[test]
    fn test_invalid_assignment() {
        let result = Cli::try_parse_from(["mlonmcu", "flow", "session.json", "-c", "oops"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_stage() {
        let result = Cli::try_parse_from(["mlonmcu", "export", "session.json", "--until", "DEPLOY"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mlonmcu.json");
        std::fs::write(&path, r#"{"num_workers": 0}"#).unwrap();

        assert!(load_settings(Some(&path)).is_err());
    }

    #[tokio::test]
    async fn test_flow_until_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aww.tflite"), b"TFL3").unwrap();
        let manifest = dir.path().join("session.json");
        std::fs::write(
            &manifest,
            r#"{"models": [{"name": "aww", "paths": ["aww.tflite"]}], "postprocesses": ["config2cols"]}"#,
        )
        .unwrap();
        let settings = FlowSettings {
            home: dir.path().join("home"),
            ..FlowSettings::default()
        };
        let report = dir.path().join("report.json");
        let args = FlowArgs {
            manifest,
            until: Some(Stage::Load),
            workers: Some(2),
            parallel: None,
            progress: true,
            export: false,
            report: Some(report.clone()),
            config: vec![],
        };

        let ok = flow(&settings, args, true).await.unwrap();

        assert!(ok);
        let rows: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(report).unwrap()).unwrap();
        assert_eq!(rows[0]["Model"], json!("aww"));
        assert!(settings
            .sessions_dir()
            .join("0")
            .join("runs")
            .join("0")
            .join("run.txt")
            .exists());
        assert!(!settings.home.join(mlonmcu::session::LOCK_FILE).exists());
    }
}
