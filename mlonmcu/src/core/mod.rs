//! Core types shared by every layer: stages, configuration maps and artifacts.

mod artifact;
mod config;
mod stage;

pub use artifact::{table_to_csv, Artifact, ArtifactData, ArtifactFormat, TableRow};
pub(crate) use artifact::csv_cell;
pub use config::{Config, ConfigValue};
pub use stage::{Stage, StageParseError};
