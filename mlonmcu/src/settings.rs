//! Environment settings loaded from `mlonmcu.json`.
//!
//! Settings are discovered by walking up from the current directory. Two
//! environment variables override the file: `MLONMCU_HOME` and
//! `MLONMCU_NUM_WORKERS`.

use crate::core::{Config, Stage};
use crate::errors::{FlowError, Result};
use crate::run::EXPORT_OPTIONAL_KEY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name searched by [`FlowSettings::discover`].
pub const SETTINGS_FILE: &str = "mlonmcu.json";

/// Overrides the environment home directory.
pub const HOME_VAR: &str = "MLONMCU_HOME";

/// Overrides the number of workers.
pub const NUM_WORKERS_VAR: &str = "MLONMCU_NUM_WORKERS";

/// Settings of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSettings {
    /// Environment home; sessions live in `<home>/temp/sessions`.
    #[serde(default = "default_home")]
    pub home: PathBuf,
    /// Number of parallel workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Compile jobs per run.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Default stage to process until.
    #[serde(default = "default_until")]
    pub until: Stage,
    /// Log progress after each run.
    #[serde(default)]
    pub progress: bool,
    /// Export runs after processing.
    #[serde(default)]
    pub export: bool,
    /// Include optional artifacts in exports.
    #[serde(default)]
    pub export_optional: bool,
    /// Lock the environment while a session is open.
    #[serde(default = "default_lock")]
    pub lock: bool,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            home: default_home(),
            num_workers: default_num_workers(),
            parallelism: default_parallelism(),
            until: default_until(),
            progress: false,
            export: false,
            export_optional: false,
            lock: default_lock(),
        }
    }
}

fn default_home() -> PathBuf {
    PathBuf::from(".mlonmcu")
}
fn default_num_workers() -> usize {
    1
}
fn default_parallelism() -> usize {
    1
}
fn default_until() -> Stage {
    Stage::Done
}
fn default_lock() -> bool {
    true
}

impl FlowSettings {
    /// Loads settings from a JSON file.
    ///
    /// A relative `home` is resolved against the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&content)?;
        if settings.home.is_relative() {
            if let Some(parent) = path.parent() {
                settings.home = parent.join(&settings.home);
            }
        }
        Ok(settings)
    }

    /// Walks up from the current directory and loads the first settings file.
    #[must_use]
    pub fn discover() -> Option<Self> {
        let dir = std::env::current_dir().ok()?;
        Self::discover_from(&dir)
    }

    /// Walks up from `start` and loads the first settings file.
    #[must_use]
    pub fn discover_from(start: &Path) -> Option<Self> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(SETTINGS_FILE);
            if candidate.exists() {
                debug!(path = %candidate.display(), "Found settings");
                return match Self::from_file(&candidate) {
                    Ok(settings) => Some(settings),
                    Err(err) => {
                        warn!(path = %candidate.display(), error = %err, "Ignoring invalid settings");
                        None
                    }
                };
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Applies overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(home) = lookup(HOME_VAR) {
            self.home = PathBuf::from(home);
        }
        if let Some(workers) = lookup(NUM_WORKERS_VAR) {
            match workers.parse() {
                Ok(workers) => self.num_workers = workers,
                Err(_) => warn!(value = %workers, "Ignoring invalid {NUM_WORKERS_VAR}"),
            }
        }
        self
    }

    /// Rejects settings that can not be used.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(FlowError::InvalidWorkers(self.num_workers));
        }
        Ok(())
    }

    /// Returns the directory holding all sessions.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("temp").join("sessions")
    }

    /// Returns the config entries every run inherits.
    #[must_use]
    pub fn run_config(&self) -> Config {
        Config::new().with(EXPORT_OPTIONAL_KEY, self.export_optional)
    }
}
