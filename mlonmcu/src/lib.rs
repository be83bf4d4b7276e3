//! # mlonmcu
//!
//! Run orchestration for ML-on-MCU benchmarking flows.
//!
//! A benchmark is a batch of *runs*. Each run is one combination of model,
//! frontend, framework, backend and target, and is processed through a fixed
//! sequence of stages:
//!
//! - **LOAD**: the frontend turns a model reference into model artifacts
//! - **BUILD**: the backend generates code for the model
//! - **COMPILE**: the platform compiles the target software
//! - **RUN**: the target executes the program and reports metrics
//! - **POSTPROCESS**: the run's result row is built and post-processed
//!
//! Features contribute configuration to the components they support. A
//! session processes its runs with a bounded number of workers and
//! aggregates their results into a report.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mlonmcu::prelude::*;
//! use std::sync::Arc;
//!
//! let mut session = Session::new(0, "sessions", Arc::new(ConfigResolver::default()))?;
//! session.add_run(
//!     Run::builder(ModelRef::new("aww").with_path("aww.tflite"))
//!         .frontend(Arc::new(FileFrontend::new("tflite")))
//!         .backend(Box::new(CommandBackend::new("tvmaot", "tvmc")))
//!         .feature("debug"),
//! )?;
//! let outcome = session.process_runs(Stage::Done, 4, None).await?;
//! let report = session.report(&[])?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod components;
pub mod core;
pub mod errors;
pub mod feature;
pub mod report;
pub mod run;
pub mod session;
pub mod settings;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::components::{
        Backend, CommandBackend, CommandPlatform, CommandTarget, FileFrontend, Frontend,
        ModelRef, Platform, StageContext, Target,
    };
    pub use crate::core::{Artifact, ArtifactData, ArtifactFormat, Config, ConfigValue, Stage};
    pub use crate::errors::{
        CollaboratorError, ContractErrorInfo, ContractViolation, FeatureError, FlowError,
        ResolutionAmbiguity,
    };
    pub use crate::feature::{
        Capability, ComponentKind, Components, ConfigResolver, Feature, FeatureDescriptor,
        FeatureRegistry,
    };
    pub use crate::report::{builtin_postprocess, Postprocess, Report, ReportRow};
    pub use crate::run::{ArtifactStore, Run, RunBuilder, RunFailure};
    pub use crate::session::{
        LoggingProgress, NoOpProgress, ProgressObserver, RunOutcome, Session, SessionLock,
        SessionOutcome,
    };
    pub use crate::settings::FlowSettings;
}
