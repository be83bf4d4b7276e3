//! Pipeline stage enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One step of the fixed run pipeline.
///
/// Stages are totally ordered; a run's current stage never decreases.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Nothing has been processed yet.
    #[default]
    Nop = 0,
    /// Model ingestion by the frontend.
    Load = 1,
    /// Code generation by the backend.
    Build = 2,
    /// Compilation of the target software by the platform.
    Compile = 3,
    /// Execution on the target.
    Run = 4,
    /// Result extraction and run post-processing.
    Postprocess = 5,
    /// Marker for a fully processed run. Has no handler.
    Done = 6,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Self; 7] = [
        Self::Nop,
        Self::Load,
        Self::Build,
        Self::Compile,
        Self::Run,
        Self::Postprocess,
        Self::Done,
    ];

    /// Returns the numeric index of the stage.
    #[must_use]
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Looks up a stage by its numeric index.
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    /// Returns the stage immediately before this one.
    #[must_use]
    pub fn previous(self) -> Option<Self> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    /// Returns the stage immediately after this one.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    /// Returns true if the stage has a handler that performs work.
    #[must_use]
    pub const fn has_handler(self) -> bool {
        !matches!(self, Self::Nop | Self::Done)
    }

    /// Maps a requested target onto the last stage with a handler.
    ///
    /// `DONE` is a pure marker, so requesting it means `POSTPROCESS`.
    #[must_use]
    pub const fn effective_target(self) -> Self {
        match self {
            Self::Done => Self::Postprocess,
            other => other,
        }
    }

    /// Returns the handler stages `s` with `from < s <= to`, in order.
    #[must_use]
    pub fn pending(from: Self, to: Self) -> Vec<Self> {
        let to = to.effective_target();
        Self::ALL
            .into_iter()
            .filter(|stage| stage.has_handler() && *stage > from && *stage <= to)
            .collect()
    }

    /// Returns the upper-case name of the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Load => "LOAD",
            Self::Build => "BUILD",
            Self::Compile => "COMPILE",
            Self::Run => "RUN",
            Self::Postprocess => "POSTPROCESS",
            Self::Done => "DONE",
        }
    }

    /// Returns the report column name used for the stage's wall-clock time.
    #[must_use]
    pub fn time_column(self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        let title: String = chars
            .next()
            .into_iter()
            .chain(chars.flat_map(char::to_lowercase))
            .collect();
        format!("{title} Stage Time [s]")
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stage name can not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown stage '{0}' (expected one of NOP, LOAD, BUILD, COMPILE, RUN, POSTPROCESS, DONE)")]
pub struct StageParseError(pub String);

impl FromStr for Stage {
    type Err = StageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(index) = trimmed.parse::<u8>() {
            return Self::from_index(index).ok_or_else(|| StageParseError(s.to_string()));
        }
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| StageParseError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::Nop < Stage::Load);
        assert!(Stage::Load < Stage::Build);
        assert!(Stage::Run < Stage::Postprocess);
        assert!(Stage::Postprocess < Stage::Done);
        assert_eq!(Stage::default(), Stage::Nop);
    }

    #[test]
    fn test_previous_and_next() {
        assert_eq!(Stage::Nop.previous(), None);
        assert_eq!(Stage::Build.previous(), Some(Stage::Load));
        assert_eq!(Stage::Postprocess.next(), Some(Stage::Done));
        assert_eq!(Stage::Done.next(), None);
    }

    #[test]
    fn test_effective_target() {
        assert_eq!(Stage::Done.effective_target(), Stage::Postprocess);
        assert_eq!(Stage::Run.effective_target(), Stage::Run);
    }

    #[test]
    fn test_pending_stages() {
        assert_eq!(
            Stage::pending(Stage::Nop, Stage::Run),
            vec![Stage::Load, Stage::Build, Stage::Compile, Stage::Run]
        );
        assert_eq!(
            Stage::pending(Stage::Build, Stage::Done),
            vec![Stage::Compile, Stage::Run, Stage::Postprocess]
        );
        assert!(Stage::pending(Stage::Run, Stage::Build).is_empty());
        assert!(Stage::pending(Stage::Run, Stage::Run).is_empty());
    }

    #[test]
    fn test_parse_stage() {
        assert_eq!("run".parse::<Stage>(), Ok(Stage::Run));
        assert_eq!("POSTPROCESS".parse::<Stage>(), Ok(Stage::Postprocess));
        assert_eq!("3".parse::<Stage>(), Ok(Stage::Compile));
        assert!("flash".parse::<Stage>().is_err());
        assert!("9".parse::<Stage>().is_err());
    }

    #[test]
    fn test_time_column() {
        assert_eq!(Stage::Load.time_column(), "Load Stage Time [s]");
        assert_eq!(Stage::Postprocess.time_column(), "Postprocess Stage Time [s]");
    }

    #[test]
    fn test_stage_serialize() {
        let json = serde_json::to_string(&Stage::Compile).unwrap();
        assert_eq!(json, r#""COMPILE""#);

        let deserialized: Stage = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, Stage::Compile);
    }
}
