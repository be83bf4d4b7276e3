//! Error types for run orchestration.
//!
//! Errors fall into a small taxonomy: contract violations are programming or
//! configuration mistakes and are fatal for the run that hit them,
//! collaborator errors come from frontends, backends, platforms, targets and
//! post-processes and are isolated per run by the session scheduler.

use crate::core::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = FlowError> = std::result::Result<T, E>;

/// The main error type for flow operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A contract of the run state machine or resolver was violated.
    #[error("{0}")]
    Contract(#[from] ContractViolation),

    /// An external collaborator failed.
    #[error("{0}")]
    Collaborator(#[from] CollaboratorError),

    /// A feature could not be looked up or instantiated.
    #[error("{0}")]
    Feature(#[from] FeatureError),

    /// Mutually exclusive options were configured together.
    #[error("{0}")]
    Ambiguity(#[from] ResolutionAmbiguity),

    /// The environment lock is held by someone else.
    #[error("Lock could not be acquired: {}", path.display())]
    LockUnavailable {
        /// Location of the lock file.
        path: PathBuf,
    },

    /// No post-process is known under the name.
    #[error("Unknown postprocess '{0}'")]
    UnknownPostprocess(String),

    /// A session was asked to process runs with an unusable worker count.
    #[error("Invalid number of workers: {0} (must be at least 1)")]
    InvalidWorkers(usize),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Short machine-readable category, used in run outcomes and reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Contract(_) => "contract",
            Self::Collaborator(err) => err.kind.as_str(),
            Self::Feature(_) => "feature",
            Self::Ambiguity(_) => "ambiguity",
            Self::LockUnavailable { .. } => "lock",
            Self::UnknownPostprocess(_) => "postprocess",
            Self::InvalidWorkers(_) => "workers",
            Self::Internal(_) => "internal",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// Returns true for errors that indicate misuse rather than a failing tool.
    #[must_use]
    pub fn is_contract(&self) -> bool {
        matches!(self, Self::Contract(_))
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "RUN-001-PRECONDITION").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Violations of the run state machine and resolver contracts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractViolation {
    /// A handler was invoked before its predecessor stage completed.
    #[error("Stage {stage} requires stage {required} to be completed (current stage: {current})")]
    PreconditionNotMet {
        /// The stage that was requested.
        stage: Stage,
        /// The stage that must have completed first.
        required: Stage,
        /// The run's current stage.
        current: Stage,
    },

    /// The run is already being processed.
    #[error("Parallel processing of the same run is not allowed ({run})")]
    Reentrant {
        /// Label of the run.
        run: String,
    },

    /// A feature does not support the component it was combined with.
    #[error("Unsupported feature '{feature}' for {kind} '{component}'")]
    IncompatibleFeature {
        /// The feature name.
        feature: String,
        /// The component kind (frontend, framework, backend, target).
        kind: String,
        /// The component name.
        component: String,
    },

    /// The run has no collaborator for a stage.
    #[error("No {kind} configured for stage {stage}")]
    MissingComponent {
        /// The missing collaborator kind.
        kind: String,
        /// The stage that needed it.
        stage: Stage,
    },

    /// A stage produced no artifact where one was required.
    #[error("Stage {stage} did not produce the artifact required by the next stage")]
    MissingArtifact {
        /// The stage whose output is missing.
        stage: Stage,
    },
}

impl ContractViolation {
    /// Returns structured diagnostics for the violation.
    #[must_use]
    pub fn info(&self) -> ContractErrorInfo {
        match self {
            Self::PreconditionNotMet {
                stage,
                required,
                current,
            } => ContractErrorInfo::new("RUN-001-PRECONDITION", "Stage precondition not met")
                .with_fix_hint(format!(
                    "Process the run until {required} before invoking {stage}"
                ))
                .with_context_entry("stage", stage.as_str())
                .with_context_entry("required", required.as_str())
                .with_context_entry("current", current.as_str()),
            Self::Reentrant { run } => {
                ContractErrorInfo::new("RUN-002-REENTRANT", "Run is already active")
                    .with_fix_hint("Wait for the active operation to finish or duplicate the run")
                    .with_context_entry("run", run.clone())
            }
            Self::IncompatibleFeature {
                feature,
                kind,
                component,
            } => ContractErrorInfo::new("FEATURE-001-INCOMPATIBLE", "Feature not supported by component")
                .with_fix_hint(format!("Remove '{feature}' or choose another {kind}"))
                .with_context_entry("feature", feature.clone())
                .with_context_entry("kind", kind.clone())
                .with_context_entry("component", component.clone()),
            Self::MissingComponent { kind, stage } => {
                ContractErrorInfo::new("RUN-003-MISSING-COMPONENT", "Collaborator not configured")
                    .with_fix_hint(format!("Attach a {kind} to the run before processing {stage}"))
                    .with_context_entry("kind", kind.clone())
                    .with_context_entry("stage", stage.as_str())
            }
            Self::MissingArtifact { stage } => {
                ContractErrorInfo::new("RUN-004-MISSING-ARTIFACT", "Required artifact missing")
                    .with_fix_hint(format!("Check that the {stage} collaborator returns artifacts"))
                    .with_context_entry("stage", stage.as_str())
            }
        }
    }
}

/// The collaborator roles a run talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    /// Model frontend.
    Frontend,
    /// Code-generating backend.
    Backend,
    /// Build platform.
    Platform,
    /// Execution target.
    Target,
    /// Run or session post-process.
    Postprocess,
}

impl CollaboratorKind {
    /// Returns the lower-case name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Platform => "platform",
            Self::Target => "target",
            Self::Postprocess => "postprocess",
        }
    }
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by an external collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} '{name}' failed: {message}")]
pub struct CollaboratorError {
    /// The collaborator role.
    pub kind: CollaboratorKind,
    /// The collaborator name.
    pub name: String,
    /// The error message.
    pub message: String,
}

impl CollaboratorError {
    /// Creates a new collaborator error.
    #[must_use]
    pub fn new(kind: CollaboratorKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a frontend error.
    #[must_use]
    pub fn frontend(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CollaboratorKind::Frontend, name, message)
    }

    /// Creates a backend error.
    #[must_use]
    pub fn backend(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CollaboratorKind::Backend, name, message)
    }

    /// Creates a platform error.
    #[must_use]
    pub fn platform(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CollaboratorKind::Platform, name, message)
    }

    /// Creates a target error.
    #[must_use]
    pub fn target(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CollaboratorKind::Target, name, message)
    }

    /// Creates a post-process error.
    #[must_use]
    pub fn postprocess(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CollaboratorKind::Postprocess, name, message)
    }
}

/// Errors raised while looking up or instantiating features.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeatureError {
    /// No descriptor is registered under the name.
    #[error("Unknown feature '{0}'")]
    Unknown(String),

    /// A required option was not supplied.
    #[error("Feature '{feature}' requires option '{option}'")]
    MissingOption {
        /// The feature name.
        feature: String,
        /// The missing option key.
        option: String,
    },

    /// A descriptor with the same name is already registered.
    #[error("Feature '{0}' is already registered")]
    Duplicate(String),
}

/// Two mutually exclusive settings were supplied together.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("'{first}' and '{second}' can not be defined at the same time for '{component}'")]
pub struct ResolutionAmbiguity {
    /// The component being configured.
    pub component: String,
    /// The first conflicting option.
    pub first: String,
    /// The second conflicting option.
    pub second: String,
}

impl ResolutionAmbiguity {
    /// Creates a new ambiguity error.
    #[must_use]
    pub fn new(
        component: impl Into<String>,
        first: impl Into<String>,
        second: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            first: first.into(),
            second: second.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_violation_info() {
        let err = ContractViolation::PreconditionNotMet {
            stage: Stage::Compile,
            required: Stage::Build,
            current: Stage::Load,
        };
        let info = err.info();

        assert_eq!(info.code, "RUN-001-PRECONDITION");
        assert_eq!(info.context.get("required"), Some(&"BUILD".to_string()));
        assert!(info.fix_hint.unwrap().contains("BUILD"));
        assert!(err.to_string().contains("current stage: LOAD"));
    }

    #[test]
    fn test_flow_error_kind() {
        let err: FlowError = CollaboratorError::backend("tvmaot", "codegen crashed").into();
        assert_eq!(err.kind(), "backend");
        assert_eq!(err.to_string(), "backend 'tvmaot' failed: codegen crashed");

        let err: FlowError = ContractViolation::Reentrant { run: "run-0".into() }.into();
        assert!(err.is_contract());
        assert_eq!(err.kind(), "contract");
    }

    #[test]
    fn test_incompatible_feature_message() {
        let err = ContractViolation::IncompatibleFeature {
            feature: "unpacked_api".into(),
            kind: "backend".into(),
            component: "tflmi".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported feature 'unpacked_api' for backend 'tflmi'"
        );
        assert_eq!(err.info().code, "FEATURE-001-INCOMPATIBLE");
    }

    #[test]
    fn test_ambiguity_message() {
        let err = ResolutionAmbiguity::new("filter_cols", "keep", "drop");
        assert_eq!(
            err.to_string(),
            "'keep' and 'drop' can not be defined at the same time for 'filter_cols'"
        );
    }

    #[test]
    fn test_contract_info_serialize() {
        let info = ContractErrorInfo::new("RUN-002-REENTRANT", "Run is already active")
            .with_context_entry("run", "[run-1]");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["code"], "RUN-002-REENTRANT");
        assert_eq!(json["context"]["run"], "[run-1]");
    }
}
